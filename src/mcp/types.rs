//! 远程服务器配置与命令上下文

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 远程工具服务器类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    Playwright,
    PlaywrightExtension,
    Filesystem,
    Search,
    Memory,
    #[default]
    Custom,
}

/// 单个远程服务器的配置（名称取自配置表的键）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteServerConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: ServerKind,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retry_count() -> u32 {
    3
}

impl RemoteServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ServerKind::Custom,
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            enabled: default_enabled(),
            timeout_secs: default_timeout_secs(),
            retry_count: default_retry_count(),
            description: None,
        }
    }

    pub fn with_kind(mut self, kind: ServerKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 命令附带的键值上下文（渲染进发往后端的指令）
pub type CommandContext = BTreeMap<String, String>;

/// 将命令与上下文渲染为后端指令文本
pub fn render_command(command: &str, context: Option<&CommandContext>) -> String {
    match context {
        Some(ctx) if !ctx.is_empty() => {
            let lines: Vec<String> = ctx.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
            format!("Context:\n{}\n\nTask: {}", lines.join("\n"), command)
        }
        _ => command.to_string(),
    }
}

/// 服务器状态概览（配置 + 连接情况）
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub kind: ServerKind,
    pub enabled: bool,
    pub connected: bool,
    pub state: Option<crate::resilience::ConnectionState>,
    pub command: String,
    pub args: Vec<String>,
    pub description: Option<String>,
}
