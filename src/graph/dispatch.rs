//! 节点分派：按节点类型生成后端指令，或在本地处理（Wait）

use std::time::Duration;

use async_trait::async_trait;

use super::types::{ActionNode, NodeKind};
use crate::core::AuraError;
use crate::mcp::CommandContext;

/// 动作图引擎调用远程能力的接口
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// 执行一条指令；失败以错误返回，由引擎决定是否重试
    async fn run(&self, command: &str, context: &CommandContext) -> Result<String, AuraError>;
}

const DEFAULT_WAIT_MS: u64 = 1000;

/// 节点对应的动作
#[derive(Debug, Clone, PartialEq)]
pub enum NodeAction {
    /// 发往后端的指令及其上下文
    Remote {
        command: String,
        context: CommandContext,
    },
    /// 本地等待
    Sleep(Duration),
}

impl ActionNode {
    fn wait_duration(&self) -> Duration {
        let ms = self
            .metadata
            .get("wait_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_WAIT_MS);
        Duration::from_millis(ms)
    }

    /// 将节点翻译为具体动作
    pub fn action(&self) -> NodeAction {
        let locator = self.locator.as_deref().unwrap_or_default();
        let text = self.text.as_deref().unwrap_or_default();

        let command = match self.kind {
            NodeKind::Wait => return NodeAction::Sleep(self.wait_duration()),
            NodeKind::Navigate => format!("Navigate to {}", self.url.as_deref().unwrap_or_default()),
            NodeKind::Click => format!("Click the element matching `{}`", locator),
            NodeKind::Type => format!("Type \"{}\" into the element matching `{}`", text, locator),
            NodeKind::Assert => format!("Verify that an element matching `{}` is present", locator),
            NodeKind::Extract => format!("Extract the text content of `{}`", locator),
            NodeKind::Scroll => format!("Scroll the element matching `{}` into view", locator),
            NodeKind::Hover => format!("Hover over the element matching `{}`", locator),
            NodeKind::Select => format!("Select option \"{}\" in `{}`", text, locator),
            NodeKind::Screenshot => "Take a screenshot of the current page".to_string(),
        };

        let mut context = CommandContext::new();
        context.insert("node_id".into(), self.id.clone());
        context.insert("node_type".into(), self.kind.as_str().into());
        context.insert("timeout_ms".into(), self.timeout_ms.to_string());
        if let Some(url) = &self.url {
            context.insert("url".into(), url.clone());
        }
        if let Some(locator) = &self.locator {
            context.insert("locator".into(), locator.clone());
        }
        if let Some(text) = &self.text {
            context.insert("text".into(), text.clone());
        }

        NodeAction::Remote { command, context }
    }
}

/// 执行一次节点动作
pub async fn dispatch(node: &ActionNode, runner: &dyn CommandRunner) -> Result<String, AuraError> {
    match node.action() {
        NodeAction::Sleep(duration) => {
            tokio::time::sleep(duration).await;
            Ok(format!("Waited {}ms", duration.as_millis()))
        }
        NodeAction::Remote { command, context } => runner.run(&command, &context).await,
    }
}
