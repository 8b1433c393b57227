//! 动作图依赖与校验
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序；无依赖关系的节点保持声明顺序。

use std::collections::{HashMap, HashSet, VecDeque};

use super::types::{ActionGraph, NodeId};
use crate::core::AuraError;

/// 动作图依赖图
pub struct DependencyGraph {
    /// 声明顺序
    order: Vec<NodeId>,
    /// 邻接表：节点 ID -> 依赖该节点的节点列表（按边声明顺序）
    adjacency: HashMap<NodeId, Vec<NodeId>>,
    /// 入度表：节点 ID -> 未完成的前驱数
    in_degree: HashMap<NodeId, usize>,
}

impl DependencyGraph {
    /// 创建依赖图；指向未知节点的边被忽略（由校验单独报告）
    pub fn new(graph: &ActionGraph) -> Self {
        let mut order = Vec::new();
        let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();

        for node in &graph.nodes {
            if in_degree.insert(node.id.clone(), 0).is_none() {
                order.push(node.id.clone());
                adjacency.insert(node.id.clone(), Vec::new());
            }
        }

        for edge in &graph.edges {
            if !in_degree.contains_key(&edge.from) || !in_degree.contains_key(&edge.to) {
                continue;
            }
            adjacency
                .entry(edge.from.clone())
                .or_default()
                .push(edge.to.clone());
            *in_degree.entry(edge.to.clone()).or_insert(0) += 1;
        }

        Self {
            order,
            adjacency,
            in_degree,
        }
    }

    /// 入度为 0 的节点（声明顺序）
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        self.order
            .iter()
            .filter(|id| self.in_degree.get(*id) == Some(&0))
            .cloned()
            .collect()
    }

    /// 拓扑序；存在环时返回 None
    pub fn topological_order(&self) -> Option<Vec<NodeId>> {
        let mut in_degree = self.in_degree.clone();
        let mut queue: VecDeque<NodeId> = self.ready_nodes().into();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(id) = queue.pop_front() {
            if let Some(dependents) = self.adjacency.get(&id) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent.clone());
                        }
                    }
                }
            }
            sorted.push(id);
        }

        (sorted.len() == self.order.len()).then_some(sorted)
    }
}

/// 收集图的全部结构问题
pub fn validation_errors(graph: &ActionGraph) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for node in &graph.nodes {
        if !seen.insert(node.id.as_str()) {
            errors.push(format!("Duplicate node id: {}", node.id));
        }
        if node.kind.requires_url() && node.url.is_none() {
            errors.push(format!("{} node {} missing url", node.kind.as_str(), node.id));
        }
        if node.kind.requires_locator() && node.locator.is_none() {
            errors.push(format!(
                "{} node {} missing locator",
                node.kind.as_str(),
                node.id
            ));
        }
        if node.kind.requires_text() && node.text.is_none() {
            errors.push(format!("{} node {} missing text", node.kind.as_str(), node.id));
        }
    }

    for edge in &graph.edges {
        if !seen.contains(edge.from.as_str()) {
            errors.push(format!("Edge references unknown node: {}", edge.from));
        }
        if !seen.contains(edge.to.as_str()) {
            errors.push(format!("Edge references unknown node: {}", edge.to));
        }
    }

    if DependencyGraph::new(graph).topological_order().is_none() {
        errors.push("Graph contains a cycle".to_string());
    }

    errors
}

/// 校验通过时返回执行顺序
pub fn execution_order(graph: &ActionGraph) -> Result<Vec<NodeId>, AuraError> {
    let errors = validation_errors(graph);
    if !errors.is_empty() {
        return Err(AuraError::Validation(errors));
    }
    DependencyGraph::new(graph)
        .topological_order()
        .ok_or_else(|| AuraError::Validation(vec!["Graph contains a cycle".to_string()]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::{ActionNode, NodeKind};

    fn linear() -> ActionGraph {
        ActionGraph::new("g").chain(vec![
            ActionNode::navigate("a", "https://example.com"),
            ActionNode::click("b", "#b"),
            ActionNode::assert_present("c", "#c"),
        ])
    }

    #[test]
    fn test_linear_order() {
        assert_eq!(execution_order(&linear()).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_independent_nodes_keep_declaration_order() {
        let graph = ActionGraph::new("g")
            .with_node(ActionNode::screenshot("z"))
            .with_node(ActionNode::navigate("a", "https://a"))
            .with_node(ActionNode::screenshot("m"))
            .with_edge("a", "m");
        assert_eq!(execution_order(&graph).unwrap(), vec!["z", "a", "m"]);
    }

    #[test]
    fn test_edges_reorder_nodes() {
        let graph = ActionGraph::new("g")
            .with_node(ActionNode::click("b", "#b"))
            .with_node(ActionNode::navigate("a", "https://a"))
            .with_edge("a", "b");
        assert_eq!(execution_order(&graph).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let graph = linear().with_edge("c", "a");
        let errors = validation_errors(&graph);
        assert!(errors.iter().any(|e| e.contains("cycle")));
        assert!(execution_order(&graph).is_err());
    }

    #[test]
    fn test_reports_every_problem() {
        let graph = ActionGraph::new("g")
            .with_node(ActionNode::new("a", NodeKind::Navigate))
            .with_node(ActionNode::new("a", NodeKind::Type))
            .with_edge("a", "ghost");
        let errors = validation_errors(&graph);
        assert!(errors.iter().any(|e| e.contains("Duplicate node id: a")));
        assert!(errors.iter().any(|e| e.contains("missing url")));
        assert!(errors.iter().any(|e| e.contains("missing locator")));
        assert!(errors.iter().any(|e| e.contains("missing text")));
        assert!(errors.iter().any(|e| e.contains("unknown node: ghost")));
    }

    #[test]
    fn test_empty_graph_is_valid() {
        assert!(execution_order(&ActionGraph::new("g")).unwrap().is_empty());
    }
}
