//! 连接池：按服务器名保存连接句柄、连接状态、错误统计与熔断器
//!
//! 每个服务器一条记录（句柄、状态、指标、熔断器放在一起），外层映射锁只在查找/插入时短暂持有，
//! 单条记录的读-改-写在记录自身的锁内完成，保证 record_operation_result 对同一连接原子。
//! 指标与熔断器只能经 record_operation_result 修改。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::breaker::{BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakerConfig};
use super::FailureKind;
use crate::core::AuraError;

/// 连接生命周期状态（由连接管理器驱动）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    CircuitOpen,
}

/// 单个连接的错误统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorMetrics {
    pub total_errors: u64,
    pub consecutive_failures: u64,
    pub successful_operations: u64,
    pub last_error_time: Option<DateTime<Utc>>,
    pub error_types: BTreeMap<FailureKind, u64>,
}

impl ErrorMetrics {
    fn record_failure(&mut self, kind: FailureKind) {
        self.total_errors += 1;
        self.consecutive_failures += 1;
        self.last_error_time = Some(Utc::now());
        *self.error_types.entry(kind).or_insert(0) += 1;
    }

    fn record_success(&mut self) {
        self.successful_operations += 1;
        self.consecutive_failures = 0;
    }

    pub fn total_operations(&self) -> u64 {
        self.total_errors + self.successful_operations
    }

    /// 错误率；无任何操作时为 0
    pub fn error_rate(&self) -> f64 {
        match self.total_operations() {
            0 => 0.0,
            total => self.total_errors as f64 / total as f64,
        }
    }
}

/// 连接统计（只读快照）
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub connected: bool,
    pub error_metrics: ErrorMetrics,
    pub error_rate: f64,
    pub circuit_breaker: BreakerSnapshot,
}

struct ServerRecord<H> {
    handle: Option<H>,
    state: ConnectionState,
    metrics: ErrorMetrics,
    breaker: CircuitBreaker,
    health_failures: u32,
}

impl<H> ServerRecord<H> {
    fn new(breaker: CircuitBreaker) -> Self {
        Self {
            handle: None,
            state: ConnectionState::Disconnected,
            metrics: ErrorMetrics::default(),
            breaker,
            health_failures: 0,
        }
    }

    /// 对外呈现的状态：已连接但熔断打开时报告 CircuitOpen
    fn effective_state(&self) -> ConnectionState {
        if self.state == ConnectionState::Connected && self.breaker.state() == BreakerState::Open {
            ConnectionState::CircuitOpen
        } else {
            self.state
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ConnectionPool<H> {
    max_connections: usize,
    breaker_config: CircuitBreakerConfig,
    records: RwLock<HashMap<String, Arc<Mutex<ServerRecord<H>>>>>,
}

impl<H: Clone> ConnectionPool<H> {
    pub fn new(max_connections: usize, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            max_connections,
            breaker_config,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    fn record(&self, name: &str) -> Option<Arc<Mutex<ServerRecord<H>>>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn record_or_insert(&self, name: &str) -> Arc<Mutex<ServerRecord<H>>> {
        if let Some(record) = self.record(name) {
            return record;
        }
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ServerRecord::new(CircuitBreaker::new(
                    self.breaker_config.clone(),
                ))))
            })
            .clone()
    }

    /// 登记（或替换）连接句柄并重置熔断器；历史错误统计保留
    pub fn add_connection(&self, name: &str, handle: H) -> Result<(), AuraError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);

        let live_others = records
            .iter()
            .filter(|(n, _)| n.as_str() != name)
            .filter(|(_, r)| lock(r).handle.is_some())
            .count();
        if live_others >= self.max_connections {
            return Err(AuraError::Capacity {
                max: self.max_connections,
            });
        }

        let record = records
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ServerRecord::new(CircuitBreaker::new(
                    self.breaker_config.clone(),
                ))))
            })
            .clone();
        drop(records);

        let mut record = lock(&record);
        record.handle = Some(handle);
        record.breaker = CircuitBreaker::new(self.breaker_config.clone());
        tracing::info!("Added connection {} to pool", name);
        Ok(())
    }

    /// 移除连接句柄（记录保留，状态置为 Disconnected）；返回此前是否存在句柄
    pub fn remove_connection(&self, name: &str) -> bool {
        match self.record(name) {
            Some(record) => {
                let mut record = lock(&record);
                record.state = ConnectionState::Disconnected;
                let had = record.handle.take().is_some();
                if had {
                    tracing::info!("Removed connection {} from pool", name);
                }
                had
            }
            None => false,
        }
    }

    pub fn get_connection(&self, name: &str) -> Option<H> {
        self.record(name).and_then(|r| lock(&r).handle.clone())
    }

    /// 有句柄且熔断器允许调用的连接名（按名称排序）
    pub fn get_healthy_connections(&self) -> Vec<String> {
        let records: Vec<_> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(n, r)| (n.clone(), r.clone()))
            .collect();

        let mut healthy: Vec<String> = records
            .into_iter()
            .filter(|(_, r)| {
                let mut r = lock(r);
                r.handle.is_some() && r.breaker.can_execute()
            })
            .map(|(n, _)| n)
            .collect();
        healthy.sort();
        healthy
    }

    /// 连接存在且熔断器允许调用
    pub fn can_execute(&self, name: &str) -> bool {
        match self.record(name) {
            Some(record) => {
                let mut r = lock(&record);
                r.handle.is_some() && r.breaker.can_execute()
            }
            None => false,
        }
    }

    /// 记录一次操作结果：同时更新错误统计与熔断器
    pub fn record_operation_result(&self, name: &str, success: bool, kind: Option<FailureKind>) {
        let record = self.record_or_insert(name);
        let mut r = lock(&record);
        if success {
            r.metrics.record_success();
            r.breaker.record_success();
        } else {
            r.metrics.record_failure(kind.unwrap_or(FailureKind::Unknown));
            r.breaker.record_failure();
        }
    }

    pub fn set_state(&self, name: &str, state: ConnectionState) {
        let record = self.record_or_insert(name);
        lock(&record).state = state;
    }

    pub fn state(&self, name: &str) -> Option<ConnectionState> {
        self.record(name).map(|r| lock(&r).effective_state())
    }

    /// 健康检查连续失败计数 +1，返回新值
    pub fn note_health_failure(&self, name: &str) -> u32 {
        let record = self.record_or_insert(name);
        let mut r = lock(&record);
        r.health_failures += 1;
        r.health_failures
    }

    pub fn reset_health_failures(&self, name: &str) {
        if let Some(record) = self.record(name) {
            lock(&record).health_failures = 0;
        }
    }

    pub fn health_failures(&self, name: &str) -> u32 {
        self.record(name).map(|r| lock(&r).health_failures).unwrap_or(0)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// 彻底删除一条记录（服务器从目录移除时使用）
    pub fn forget(&self, name: &str) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    pub fn connection_stats(&self) -> BTreeMap<String, ConnectionStats> {
        let records: Vec<_> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(n, r)| (n.clone(), r.clone()))
            .collect();

        records
            .into_iter()
            .map(|(name, record)| {
                let r = lock(&record);
                let stats = ConnectionStats {
                    state: r.effective_state(),
                    connected: r.handle.is_some(),
                    error_rate: r.metrics.error_rate(),
                    error_metrics: r.metrics.clone(),
                    circuit_breaker: r.breaker.snapshot(),
                };
                (name, stats)
            })
            .collect()
    }
}
