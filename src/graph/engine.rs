//! 动作图引擎
//!
//! 按依赖顺序逐个执行节点；每个节点最多尝试 retry_count 次，任一节点耗尽重试即中止整张图。
//! 维护运行中的图集合（可取消）与执行历史。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::dispatch::{dispatch, CommandRunner};
use super::types::*;
use super::validate::execution_order;
use crate::core::AuraError;

const HISTORY_LIMIT: usize = 100;

/// 运行中图的概要
#[derive(Debug, Clone, Serialize)]
pub struct RunningGraph {
    pub graph_id: GraphId,
    pub goal: String,
    pub started_at: DateTime<Utc>,
}

struct RunningEntry {
    info: RunningGraph,
    token: CancellationToken,
}

/// 动作图引擎
pub struct ActionGraphEngine {
    runner: Arc<dyn CommandRunner>,
    retry_pause: Duration,
    running: RwLock<HashMap<GraphId, RunningEntry>>,
    history: RwLock<Vec<ExecutionResult>>,
}

impl ActionGraphEngine {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            retry_pause: Duration::from_secs(1),
            running: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
        }
    }

    /// 节点两次尝试之间的等待
    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    /// 执行动作图；结构不合法时在任何副作用之前返回 Validation 错误
    pub async fn execute(
        &self,
        graph: &mut ActionGraph,
        mode: ExecutionMode,
    ) -> Result<ExecutionResult, AuraError> {
        self.execute_with_cancel(graph, mode, &CancellationToken::new())
            .await
    }

    /// 同 execute，但可由外部令牌取消（取消会中断正在进行的节点调用）
    pub async fn execute_with_cancel(
        &self,
        graph: &mut ActionGraph,
        mode: ExecutionMode,
        parent: &CancellationToken,
    ) -> Result<ExecutionResult, AuraError> {
        let order = execution_order(graph)?;
        let index: HashMap<NodeId, usize> = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let token = parent.child_token();
        let started_at = Utc::now();
        self.running.write().await.insert(
            graph.id.clone(),
            RunningEntry {
                info: RunningGraph {
                    graph_id: graph.id.clone(),
                    goal: graph.goal.clone(),
                    started_at,
                },
                token: token.clone(),
            },
        );

        graph.status = NodeStatus::Running;
        graph.started_at = Some(started_at);
        graph.log(format!(
            "Graph {} started: {} nodes, mode {:?}",
            graph.id,
            order.len(),
            mode
        ));
        tracing::info!("Executing graph {} ({} nodes)", graph.id, order.len());

        let start = Instant::now();
        let mut completed = 0;
        let mut artifacts = Artifacts::default();
        let mut error: Option<String> = None;

        for node_id in &order {
            if token.is_cancelled() {
                graph.log("Execution cancelled");
                error = Some("Execution cancelled".to_string());
                break;
            }

            let Some(&idx) = index.get(node_id) else {
                continue;
            };

            if mode == ExecutionMode::DryRun {
                let node = &mut graph.nodes[idx];
                node.status = NodeStatus::Completed;
                let line = format!("DRY RUN: {} on {}", node.kind.as_str(), node.target());
                graph.log(line);
                completed += 1;
                continue;
            }

            match self.run_node(graph, idx, &token).await {
                Ok(output) => {
                    completed += 1;
                    let node = &graph.nodes[idx];
                    match node.kind {
                        NodeKind::Screenshot => artifacts.screenshots.push(output),
                        NodeKind::Extract => {
                            artifacts.extracted.insert(node.id.clone(), output);
                        }
                        _ => {}
                    }
                }
                Err(AuraError::Cancelled) => {
                    graph.log("Execution cancelled");
                    error = Some("Execution cancelled".to_string());
                    break;
                }
                Err(e) => {
                    error = Some(format!("Node {} failed: {}", node_id, e));
                    break;
                }
            }
        }

        for node in graph.nodes.iter_mut() {
            if node.status == NodeStatus::Pending {
                node.status = NodeStatus::Skipped;
            }
        }

        let success = error.is_none() && completed == order.len();
        graph.status = if success {
            NodeStatus::Completed
        } else {
            NodeStatus::Failed
        };
        graph.finished_at = Some(Utc::now());
        let execution_time_ms = start.elapsed().as_millis() as u64;
        graph.log(format!(
            "Graph {} finished: {}/{} nodes completed in {}ms",
            graph.id,
            completed,
            order.len(),
            execution_time_ms
        ));

        self.running.write().await.remove(&graph.id);

        let result = ExecutionResult {
            graph_id: graph.id.clone(),
            success,
            completed_nodes: completed,
            total_nodes: order.len(),
            execution_time_ms,
            error,
            artifacts,
            log: graph.log.clone(),
        };

        if success {
            tracing::info!("Graph {} completed successfully", graph.id);
        } else {
            tracing::warn!(
                "Graph {} failed: {}",
                graph.id,
                result.error.as_deref().unwrap_or("unknown")
            );
        }

        let mut history = self.history.write().await;
        history.push(result.clone());
        if history.len() > HISTORY_LIMIT {
            let overflow = history.len() - HISTORY_LIMIT;
            history.drain(..overflow);
        }

        Ok(result)
    }

    /// 执行单个节点（含重试）；取消时节点标记为 Failed 且结果丢弃
    async fn run_node(
        &self,
        graph: &mut ActionGraph,
        idx: usize,
        token: &CancellationToken,
    ) -> Result<String, AuraError> {
        let node = &mut graph.nodes[idx];
        node.status = NodeStatus::Running;
        node.started_at = Some(Utc::now());
        let node_id = node.id.clone();
        let kind = node.kind;
        let max_attempts = node.retry_count.max(1);
        let snapshot = node.clone();

        graph.log(format!("Executing node {} ({})", node_id, kind.as_str()));

        let mut attempt = 1;
        let outcome = loop {
            let result = tokio::select! {
                _ = token.cancelled() => Err(AuraError::Cancelled),
                r = dispatch(&snapshot, self.runner.as_ref()) => r,
            };

            match result {
                Ok(output) => break Ok(output),
                Err(AuraError::Cancelled) => break Err(AuraError::Cancelled),
                Err(e) if attempt < max_attempts => {
                    graph.log(format!(
                        "Node {} attempt {} failed: {}, retrying...",
                        node_id, attempt, e
                    ));
                    tracing::warn!("Node {} attempt {} failed: {}", node_id, attempt, e);
                    tokio::select! {
                        _ = token.cancelled() => break Err(AuraError::Cancelled),
                        _ = tokio::time::sleep(self.retry_pause) => {}
                    }
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        };

        let node = &mut graph.nodes[idx];
        node.finished_at = Some(Utc::now());
        match outcome {
            Ok(output) => {
                node.status = NodeStatus::Completed;
                node.result = Some(output.clone());
                graph.log(format!("Node {} completed successfully", node_id));
                Ok(output)
            }
            Err(e) => {
                node.status = NodeStatus::Failed;
                node.error = Some(e.to_string());
                graph.log(format!("Node {} failed: {}", node_id, e));
                Err(e)
            }
        }
    }

    /// 取消运行中的图；图不在运行集合中时返回 false
    pub async fn cancel_execution(&self, graph_id: &str) -> bool {
        match self.running.write().await.remove(graph_id) {
            Some(entry) => {
                entry.token.cancel();
                tracing::info!("Cancelled graph execution {}", graph_id);
                true
            }
            None => false,
        }
    }

    pub async fn running_graphs(&self) -> Vec<RunningGraph> {
        self.running
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    /// 最近 limit 条执行结果（新的在后，最多保留 100 条）
    pub async fn execution_history(&self, limit: usize) -> Vec<ExecutionResult> {
        let history = self.history.read().await;
        let skip = history.len().saturating_sub(limit);
        history[skip..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::CommandContext;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// 记录调用；命令包含 fail_on 时失败
    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<String>>,
        fail_on: Option<String>,
        delay: Duration,
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, command: &str, _ctx: &CommandContext) -> Result<String, AuraError> {
            self.calls.lock().unwrap().push(command.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &self.fail_on {
                Some(p) if command.contains(p.as_str()) => {
                    Err(AuraError::TaskExecution(format!("cannot {}", command)))
                }
                _ => Ok(format!("ok: {}", command)),
            }
        }
    }

    fn engine(runner: Arc<ScriptedRunner>) -> ActionGraphEngine {
        ActionGraphEngine::new(runner).with_retry_pause(Duration::from_millis(1))
    }

    fn search_graph() -> ActionGraph {
        ActionGraph::new("search").chain(vec![
            ActionNode::navigate("open", "https://example.com"),
            ActionNode::click("go", "#submit").with_retry_count(2),
            ActionNode::extract("grab", ".result"),
            ActionNode::screenshot("shot"),
        ])
    }

    #[tokio::test]
    async fn test_dry_run_touches_no_backend() {
        let runner = Arc::new(ScriptedRunner::default());
        let mut graph = search_graph();
        let result = engine(runner.clone())
            .execute(&mut graph, ExecutionMode::DryRun)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.completed_nodes, 4);
        assert!(runner.calls.lock().unwrap().is_empty());
        assert!(graph.nodes.iter().all(|n| n.status == NodeStatus::Completed));
        assert!(result.log.iter().any(|l| l.message.starts_with("DRY RUN: navigate")));
    }

    #[tokio::test]
    async fn test_normal_run_collects_artifacts() {
        let runner = Arc::new(ScriptedRunner::default());
        let mut graph = search_graph();
        let result = engine(runner.clone())
            .execute(&mut graph, ExecutionMode::Normal)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.completed_nodes, result.total_nodes);
        assert_eq!(result.artifacts.screenshots.len(), 1);
        assert!(result.artifacts.extracted.contains_key("grab"));
        assert_eq!(graph.status, NodeStatus::Completed);
        assert!(graph.nodes[0].result.is_some());
    }

    #[tokio::test]
    async fn test_failing_node_halts_graph() {
        let runner = Arc::new(ScriptedRunner {
            fail_on: Some("#submit".into()),
            ..Default::default()
        });
        let mut graph = search_graph();
        let eng = engine(runner.clone());
        let result = eng.execute(&mut graph, ExecutionMode::Normal).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.completed_nodes, 1);
        assert!(result.error.as_deref().unwrap().contains("Node go failed"));
        // navigate 一次 + click 两次，后续节点不执行
        assert_eq!(runner.calls.lock().unwrap().len(), 3);
        assert_eq!(graph.nodes[1].status, NodeStatus::Failed);
        assert_eq!(graph.nodes[2].status, NodeStatus::Skipped);
        assert_eq!(graph.status, NodeStatus::Failed);
        assert_eq!(eng.execution_history(10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_graph_has_no_side_effects() {
        let runner = Arc::new(ScriptedRunner::default());
        let mut graph = search_graph().with_edge("shot", "open");
        let eng = engine(runner.clone());
        let err = eng.execute(&mut graph, ExecutionMode::Normal).await.unwrap_err();

        assert!(matches!(err, AuraError::Validation(_)));
        assert!(runner.calls.lock().unwrap().is_empty());
        assert!(eng.execution_history(10).await.is_empty());
        assert_eq!(graph.status, NodeStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_running_graph() {
        let runner = Arc::new(ScriptedRunner {
            delay: Duration::from_secs(5),
            ..Default::default()
        });
        let eng = Arc::new(engine(runner));
        let mut graph = search_graph();
        let graph_id = graph.id.clone();

        let worker = {
            let eng = eng.clone();
            tokio::spawn(async move {
                let result = eng.execute(&mut graph, ExecutionMode::Normal).await;
                (result, graph)
            })
        };

        for _ in 0..100 {
            if !eng.running_graphs().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(eng.cancel_execution(&graph_id).await);
        assert!(!eng.cancel_execution(&graph_id).await);

        let (result, graph) = worker.await.unwrap();
        let result = result.unwrap();
        assert!(!result.success);
        assert_eq!(result.completed_nodes, 0);
        assert_eq!(graph.status, NodeStatus::Failed);
        assert!(graph.nodes[0].result.is_none());
        assert!(eng.running_graphs().await.is_empty());
    }
}
