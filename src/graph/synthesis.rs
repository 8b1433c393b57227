//! 从站点模型合成动作图：打开首页 → [输入查询] → 点击提交 → 断言结果可见

use super::types::{ActionGraph, ActionNode};
use crate::collaborators::{ParsedCommand, SiteModel};

/// 为目标合成一张线性动作图；解析出的 query 参数存在且站点有搜索框时才插入输入节点
pub fn synthesize_graph(
    goal: &str,
    site: &SiteModel,
    command: &ParsedCommand,
    budget_tokens: u32,
) -> ActionGraph {
    let mut nodes = vec![ActionNode::navigate("open_homepage", site.homepage.clone())
        .with_description(format!("Open {}", site.domain))];

    if let (Some(query), Some(input)) = (command.parameters.get("query"), &site.search_input) {
        nodes.push(
            ActionNode::type_text("enter_query", input.clone(), query.clone())
                .with_description("Enter search query"),
        );
    }

    nodes.push(
        ActionNode::click("submit", site.submit_button.clone()).with_description("Submit request"),
    );
    nodes.push(
        ActionNode::assert_present("verify_results", site.results.clone())
            .with_description("Verify results are visible"),
    );

    let mut graph = ActionGraph::new(goal).chain(nodes);
    graph.budget_tokens = budget_tokens;
    graph
        .metadata
        .insert("intent".into(), serde_json::json!(command.intent));
    graph
        .metadata
        .insert("site".into(), serde_json::json!(site.domain));
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::validate::execution_order;
    use std::collections::BTreeMap;

    fn site() -> SiteModel {
        SiteModel {
            domain: "example.com".into(),
            homepage: "https://example.com".into(),
            search_input: Some("input[name='q']".into()),
            submit_button: "button[type='submit']".into(),
            results: ".results".into(),
        }
    }

    fn command(query: Option<&str>) -> ParsedCommand {
        let mut parameters = BTreeMap::new();
        if let Some(q) = query {
            parameters.insert("query".to_string(), q.to_string());
        }
        ParsedCommand {
            intent: "search".into(),
            confidence: 0.9,
            parameters,
        }
    }

    #[test]
    fn test_query_inserts_type_node() {
        let graph = synthesize_graph("find rust", &site(), &command(Some("rust")), 3000);
        let order = execution_order(&graph).unwrap();
        assert_eq!(order, vec!["open_homepage", "enter_query", "submit", "verify_results"]);
    }

    #[test]
    fn test_without_query_skips_typing() {
        let graph = synthesize_graph("browse", &site(), &command(None), 3000);
        assert_eq!(graph.nodes.len(), 3);
        assert!(execution_order(&graph).is_ok());
    }
}
