//! 指数退避重试
//!
//! delay(n) = min(base_delay * exponential_base^(n-1), max_delay)，可选叠加至多 10% 的随机抖动。
//! 鉴权类失败不重试；其余失败最多尝试 max_attempts 次，最终错误原样返回。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::FailureKind;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// 第 attempt 次失败后的等待时间（不含抖动）
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.config.base_delay.as_secs_f64() * self.config.exponential_base.powi(exp);
        let capped = secs.min(self.config.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// 第 attempt 次失败后的实际等待时间
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if !self.config.jitter || base.is_zero() {
            return base;
        }
        let jitter = base.as_secs_f64() * 0.1 * rand::thread_rng().gen::<f64>();
        base + Duration::from_secs_f64(jitter)
    }

    /// 按策略执行 op；classify 决定失败是否可重试
    pub async fn execute_with_retry<T, E, F, Fut, C>(&self, mut op: F, classify: C) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> FailureKind,
        E: Display,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!("Operation succeeded on attempt {}", attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let kind = classify(&e);
                    if !kind.is_retryable() {
                        tracing::error!("Non-retryable failure ({}): {}", kind, e);
                        return Err(e);
                    }
                    if attempt >= max_attempts {
                        tracing::error!("All {} attempts failed: {}", max_attempts, e);
                        return Err(e);
                    }
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        "Attempt {} failed ({}), retrying in {:.2}s: {}",
                        attempt,
                        kind,
                        delay.as_secs_f64(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BackendError;
    use crate::resilience::ErrorClassifier;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential_base: 2.0,
            jitter: true,
        })
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::new(RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        });
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(10), Duration::from_secs(60));
        assert_eq!(policy.backoff(500), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::default();
        for attempt in 1..8 {
            let base = policy.backoff(attempt);
            let d = policy.delay(attempt);
            assert!(d >= base);
            assert!(d.as_secs_f64() <= base.as_secs_f64() * 1.1 + 1e-9);
        }
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let calls = AtomicU32::new(0);
        let result = quick_policy(3)
            .execute_with_retry(
                || {
                    let calls = &calls;
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(BackendError::Timeout("slow".into()))
                        } else {
                            Ok("done")
                        }
                    }
                },
                ErrorClassifier::classify,
            )
            .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_authentication_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = quick_policy(5)
            .execute_with_retry(
                || {
                    let calls = &calls;
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(BackendError::Rejected("authentication failed".into()))
                    }
                },
                ErrorClassifier::classify,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = quick_policy(4)
            .execute_with_retry(
                || {
                    let calls = &calls;
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        Err(BackendError::Transport(format!("attempt {n}")))
                    }
                },
                ErrorClassifier::classify,
            )
            .await;
        assert_eq!(result, Err(BackendError::Transport("attempt 3".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
