//! 容错层：失败分类、熔断器、指数退避重试、连接池与容错执行器

pub mod breaker;
pub mod classifier;
pub mod executor;
pub mod pool;
pub mod retry;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use classifier::{ErrorClassifier, FailureKind};
pub use executor::ResilienceExecutor;
pub use pool::{ConnectionPool, ConnectionState, ConnectionStats, ErrorMetrics};
pub use retry::{RetryConfig, RetryPolicy};
