//! 失败分类：将后端错误归入 FailureKind
//!
//! 分类结果决定重试策略：AuthenticationError 属于配置问题，永不重试；其余类别可在本地重试后再交给熔断器。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::BackendError;

/// 远程调用失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ConnectionTimeout,
    NetworkError,
    ProtocolError,
    AuthenticationError,
    ResourceExhausted,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionTimeout => "connection_timeout",
            Self::NetworkError => "network_error",
            Self::ProtocolError => "protocol_error",
            Self::AuthenticationError => "authentication_error",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Unknown => "unknown_error",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthenticationError)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 错误分类器（纯函数）
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// 类型化变体直接映射；Rejected / Other 按消息关键词判断
    pub fn classify(err: &BackendError) -> FailureKind {
        match err {
            BackendError::Timeout(_) => FailureKind::ConnectionTimeout,
            BackendError::Transport(_) => FailureKind::NetworkError,
            BackendError::Rejected(msg) => match Self::classify_message(msg) {
                FailureKind::Unknown => FailureKind::ProtocolError,
                kind => kind,
            },
            BackendError::Other(msg) => Self::classify_message(msg),
        }
    }

    /// 关键词匹配，顺序即优先级
    pub fn classify_message(message: &str) -> FailureKind {
        let msg = message.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| msg.contains(w));

        if has(&["timeout", "timed out"]) {
            FailureKind::ConnectionTimeout
        } else if has(&["connection", "network"]) {
            FailureKind::NetworkError
        } else if has(&["auth", "permission"]) {
            FailureKind::AuthenticationError
        } else if has(&["protocol", "invalid"]) {
            FailureKind::ProtocolError
        } else if has(&["resource", "limit"]) {
            FailureKind::ResourceExhausted
        } else {
            FailureKind::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_variants() {
        assert_eq!(
            ErrorClassifier::classify(&BackendError::Timeout("x".into())),
            FailureKind::ConnectionTimeout
        );
        assert_eq!(
            ErrorClassifier::classify(&BackendError::Transport("broken pipe".into())),
            FailureKind::NetworkError
        );
    }

    #[test]
    fn test_message_keywords() {
        let cases = [
            ("Request timed out after 30s", FailureKind::ConnectionTimeout),
            ("network unreachable", FailureKind::NetworkError),
            ("Authentication failed", FailureKind::AuthenticationError),
            ("permission denied", FailureKind::AuthenticationError),
            ("invalid JSON-RPC frame", FailureKind::ProtocolError),
            ("rate limit exceeded", FailureKind::ResourceExhausted),
            ("something odd", FailureKind::Unknown),
        ];
        for (msg, expected) in cases {
            assert_eq!(
                ErrorClassifier::classify(&BackendError::Other(msg.into())),
                expected,
                "{msg}"
            );
        }
    }

    #[test]
    fn test_rejected_defaults_to_protocol() {
        assert_eq!(
            ErrorClassifier::classify(&BackendError::Rejected("unsupported method".into())),
            FailureKind::ProtocolError
        );
        assert_eq!(
            ErrorClassifier::classify(&BackendError::Rejected("auth token expired".into())),
            FailureKind::AuthenticationError
        );
    }

    #[test]
    fn test_only_authentication_is_not_retryable() {
        assert!(!FailureKind::AuthenticationError.is_retryable());
        assert!(FailureKind::ConnectionTimeout.is_retryable());
        assert!(FailureKind::Unknown.is_retryable());
    }
}
