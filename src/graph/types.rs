//! 动作图类型定义
//!
//! 定义动作节点、依赖边、动作图与执行结果等核心数据类型

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::AuraError;

pub type NodeId = String;
pub type GraphId = String;

/// 节点动作类型（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Navigate,
    Click,
    Type,
    Assert,
    Wait,
    Extract,
    Scroll,
    Hover,
    Select,
    Screenshot,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::Click => "click",
            Self::Type => "type",
            Self::Assert => "assert",
            Self::Wait => "wait",
            Self::Extract => "extract",
            Self::Scroll => "scroll",
            Self::Hover => "hover",
            Self::Select => "select",
            Self::Screenshot => "screenshot",
        }
    }

    pub fn requires_url(&self) -> bool {
        matches!(self, Self::Navigate)
    }

    pub fn requires_locator(&self) -> bool {
        matches!(
            self,
            Self::Click
                | Self::Type
                | Self::Assert
                | Self::Extract
                | Self::Scroll
                | Self::Hover
                | Self::Select
        )
    }

    pub fn requires_text(&self) -> bool {
        matches!(self, Self::Type | Self::Select)
    }
}

/// 节点 / 图执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// 等待执行
    #[default]
    Pending,
    /// 正在执行
    Running,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 跳过（前序节点失败导致图中止）
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Normal,
    /// 只记录将要执行的动作，不调用后端
    DryRun,
}

fn default_node_timeout_ms() -> u64 {
    5000
}

fn default_node_retry_count() -> u32 {
    3
}

/// 动作节点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionNode {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub locator: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default = "default_node_timeout_ms", alias = "timeout")]
    pub timeout_ms: u64,
    /// 最大尝试次数
    #[serde(default = "default_node_retry_count")]
    pub retry_count: u32,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,

    #[serde(skip)]
    pub status: NodeStatus,
    #[serde(skip)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub error: Option<String>,
    #[serde(skip)]
    pub result: Option<String>,
}

impl ActionNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            locator: None,
            url: None,
            text: None,
            timeout_ms: default_node_timeout_ms(),
            retry_count: default_node_retry_count(),
            description: None,
            metadata: BTreeMap::new(),
            status: NodeStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
            result: None,
        }
    }

    pub fn navigate(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Navigate).with_url(url)
    }

    pub fn click(id: impl Into<String>, locator: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Click).with_locator(locator)
    }

    pub fn type_text(
        id: impl Into<String>,
        locator: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(id, NodeKind::Type)
            .with_locator(locator)
            .with_text(text)
    }

    pub fn assert_present(id: impl Into<String>, locator: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Assert).with_locator(locator)
    }

    pub fn wait(id: impl Into<String>, millis: u64) -> Self {
        Self::new(id, NodeKind::Wait).with_metadata("wait_ms", serde_json::json!(millis))
    }

    pub fn extract(id: impl Into<String>, locator: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Extract).with_locator(locator)
    }

    pub fn screenshot(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Screenshot)
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// 日志中描述节点作用对象
    pub fn target(&self) -> &str {
        self.url
            .as_deref()
            .or(self.locator.as_deref())
            .unwrap_or("N/A")
    }
}

/// 依赖边：from 完成后 to 才能执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEdge {
    pub from: NodeId,
    pub to: NodeId,
    /// 仅记录，不参与调度
    #[serde(default)]
    pub condition: Option<String>,
}

impl ActionEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// 带时间戳的执行日志条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

fn new_graph_id() -> GraphId {
    format!("graph_{}", uuid::Uuid::new_v4())
}

fn default_budget_tokens() -> u32 {
    3000
}

fn default_graph_timeout_ms() -> u64 {
    60_000
}

/// 动作图：节点 + 依赖边 + 执行记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionGraph {
    #[serde(default = "new_graph_id")]
    pub id: GraphId,
    pub goal: String,
    pub nodes: Vec<ActionNode>,
    #[serde(default)]
    pub edges: Vec<ActionEdge>,
    #[serde(default = "default_budget_tokens")]
    pub budget_tokens: u32,
    #[serde(default = "default_graph_timeout_ms", alias = "timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,

    #[serde(skip)]
    pub status: NodeStatus,
    #[serde(skip)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub log: Vec<LogEntry>,
}

impl ActionGraph {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            id: new_graph_id(),
            goal: goal.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            budget_tokens: default_budget_tokens(),
            timeout_ms: default_graph_timeout_ms(),
            metadata: BTreeMap::new(),
            status: NodeStatus::Pending,
            started_at: None,
            finished_at: None,
            log: Vec::new(),
        }
    }

    /// 从 JSON 描述构建（字段：goal、nodes、edges，其余可选）
    pub fn from_json(value: serde_json::Value) -> Result<Self, AuraError> {
        serde_json::from_value(value)
            .map_err(|e| AuraError::Validation(vec![format!("invalid graph definition: {}", e)]))
    }

    pub fn with_node(mut self, node: ActionNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(ActionEdge::new(from, to));
        self
    }

    /// 依次追加节点，并在相邻节点之间连边
    pub fn chain(mut self, nodes: Vec<ActionNode>) -> Self {
        for node in nodes {
            if let Some(prev) = self.nodes.last() {
                let edge = ActionEdge::new(prev.id.clone(), node.id.clone());
                self.edges.push(edge);
            }
            self.nodes.push(node);
        }
        self
    }

    pub fn node(&self, id: &str) -> Option<&ActionNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// 追加一条执行日志
    pub fn log(&mut self, message: impl Into<String>) {
        self.log.push(LogEntry {
            timestamp: Utc::now(),
            message: message.into(),
        });
    }
}

/// 执行产物：截图与提取结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    pub screenshots: Vec<String>,
    pub extracted: BTreeMap<NodeId, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub graph_id: GraphId,
    pub success: bool,
    pub completed_nodes: usize,
    pub total_nodes: usize,
    pub execution_time_ms: u64,
    pub error: Option<String>,
    pub artifacts: Artifacts,
    pub log: Vec<LogEntry>,
}
