//! 熔断器：按连接跟踪连续失败，失败过多时快速失败，冷却后半开试探
//!
//! 状态机：
//! - Closed：正常放行，连续失败达到阈值后进入 Open
//! - Open：拒绝调用，距上次失败超过 recovery_timeout 后（在下一次检查时）进入 HalfOpen
//! - HalfOpen：放行试探调用，连续成功 half_open_max_calls 次后回到 Closed，任一失败立即回到 Open

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

/// 熔断器快照（只读，用于统计与诊断）
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub half_open_calls: u32,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: BreakerState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    half_open_calls: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_time: None,
            half_open_calls: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// 是否允许调用；Open 超时后在此处惰性切换到 HalfOpen
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = self
                    .last_failure_time
                    .map(|t| t.elapsed() > self.config.recovery_timeout)
                    .unwrap_or(true);
                if cooled {
                    self.state = BreakerState::HalfOpen;
                    self.half_open_calls = 0;
                    tracing::info!("Circuit breaker entering half-open state");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => self.half_open_calls < self.config.half_open_max_calls,
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                self.half_open_calls += 1;
                if self.half_open_calls >= self.config.half_open_max_calls {
                    self.state = BreakerState::Closed;
                    self.failure_count = 0;
                    self.half_open_calls = 0;
                    tracing::info!("Circuit breaker closed after successful recovery");
                }
            }
            BreakerState::Closed => self.failure_count = 0,
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure_time = Some(Instant::now());

        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.half_open_calls = 0;
                tracing::warn!("Circuit breaker reopened after half-open failure");
            }
            BreakerState::Closed if self.failure_count >= self.config.failure_threshold => {
                self.state = BreakerState::Open;
                tracing::warn!(
                    "Circuit breaker opened after {} failures",
                    self.failure_count
                );
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            half_open_calls: self.half_open_calls,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker(threshold: u32, half_open: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(20),
            half_open_max_calls: half_open,
        })
    }

    #[test]
    fn test_opens_at_threshold() {
        let mut cb = fast_breaker(3, 1);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.can_execute());
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_success_resets_closed_count() {
        let mut cb = fast_breaker(3, 1);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_needs_consecutive_successes() {
        let mut cb = fast_breaker(1, 2);
        cb.record_failure();
        assert!(!cb.can_execute());

        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.can_execute());
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut cb = fast_breaker(1, 3);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.can_execute());
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_stays_open_before_timeout() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        });
        cb.record_failure();
        assert!(!cb.can_execute());
        assert_eq!(cb.state(), BreakerState::Open);
    }
}
