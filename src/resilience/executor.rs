//! 容错执行器：熔断检查 → 重试 → 记录结果 → 可选降级
//!
//! 重试与熔断是两个独立阶段：重试在本地吸收瞬时失败，只有重试耗尽后的最终结果才计入熔断器。

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::{ConnectionPool, ErrorClassifier, RetryPolicy};
use crate::core::{AuraError, BackendError};

pub struct ResilienceExecutor<H> {
    pool: Arc<ConnectionPool<H>>,
    retry: RetryPolicy,
}

impl<H: Clone> ResilienceExecutor<H> {
    pub fn new(pool: Arc<ConnectionPool<H>>, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<H>> {
        &self.pool
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// 在 server 对应连接上执行 op
    ///
    /// - 熔断器拒绝：有降级则执行降级，否则返回 Unavailable
    /// - 重试耗尽：记录失败后执行降级（降级自身的错误向上传播），否则返回分类后的错误
    pub async fn execute_with_error_handling<'a, T, F, Fut>(
        &self,
        server: &str,
        op: F,
        fallback: Option<BoxFuture<'a, Result<T, AuraError>>>,
    ) -> Result<T, AuraError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        if !self.pool.can_execute(server) {
            tracing::warn!("Circuit breaker open or no connection for {}", server);
            return match fallback {
                Some(fb) => {
                    tracing::info!("Using fallback for {}", server);
                    fb.await
                }
                None => Err(AuraError::Unavailable(server.to_string())),
            };
        }

        match self
            .retry
            .execute_with_retry(op, ErrorClassifier::classify)
            .await
        {
            Ok(value) => {
                self.pool.record_operation_result(server, true, None);
                Ok(value)
            }
            Err(e) => {
                let kind = ErrorClassifier::classify(&e);
                self.pool.record_operation_result(server, false, Some(kind));
                tracing::error!("Operation failed for {} after retries: {}", server, e);

                match fallback {
                    Some(fb) => {
                        tracing::info!("Attempting fallback for {}", server);
                        fb.await
                    }
                    None => Err(AuraError::remote(server, &e)),
                }
            }
        }
    }
}
