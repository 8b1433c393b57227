//! 错误类型：后端原始失败与系统统一错误
//!
//! BackendError 是执行后端返回的原始失败；AuraError 是编排层统一的错误分类，
//! 远程调用失败会先经 ErrorClassifier 归类为 FailureKind，再决定重试、熔断或降级。

use thiserror::Error;

use crate::resilience::{ErrorClassifier, FailureKind};

/// 执行后端（多路复用客户端）返回的原始错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport failure: {0}")]
    Transport(String),

    /// 远端明确拒绝（鉴权、协议、配额等，具体类别由消息内容判断）
    #[error("rejected by server: {0}")]
    Rejected(String),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// 错误消息正文（不含前缀）
    pub fn message(&self) -> &str {
        match self {
            Self::Timeout(m) | Self::Transport(m) | Self::Rejected(m) | Self::Other(m) => m,
        }
    }
}

/// 系统错误分类：调用失败、图/输入校验、策略、容量、任务执行
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuraError {
    /// 远程调用最终失败（已经过本地重试）
    #[error("{kind} on {server}: {message}")]
    Remote {
        server: String,
        kind: FailureKind,
        message: String,
    },

    /// 熔断器打开或连接不存在，且没有可用的降级
    #[error("Connection {0} is not available")]
    Unavailable(String),

    #[error("Connection pool full (max: {max})")]
    Capacity { max: usize },

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Task execution failed: {0}")]
    TaskExecution(String),

    #[error("Connection manager not initialized")]
    NotInitialized,

    #[error("Server {0} not found in configuration")]
    ServerNotFound(String),

    #[error("Task {0} not found")]
    TaskNotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,
}

impl AuraError {
    /// 将后端错误包装为某个连接上的远程失败，并完成分类
    pub fn remote(server: impl Into<String>, err: &BackendError) -> Self {
        Self::Remote {
            server: server.into(),
            kind: ErrorClassifier::classify(err),
            message: err.message().to_string(),
        }
    }

    /// 该错误对应的失败类别（非远程错误按语义映射）
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Remote { kind, .. } => *kind,
            Self::Unavailable(_) => FailureKind::NetworkError,
            Self::Capacity { .. } => FailureKind::ResourceExhausted,
            _ => FailureKind::Unknown,
        }
    }

    /// 配置类问题：中止所属任务/图，不做整任务重试
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PolicyViolation(_) | Self::Validation(_) | Self::Cancelled
        )
    }
}
