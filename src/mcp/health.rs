//! 健康报告：错误汇总、健康指标与连接诊断

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::resilience::{ConnectionState, ConnectionStats, FailureKind};

/// 连接池错误汇总
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub total_connections: usize,
    pub healthy_connections: usize,
    pub overall_error_rate: f64,
    pub connections: BTreeMap<String, ConnectionStats>,
    pub most_common_errors: BTreeMap<FailureKind, u64>,
}

impl ErrorSummary {
    pub fn build(connections: BTreeMap<String, ConnectionStats>, healthy_connections: usize) -> Self {
        let (errors, operations) = connections.values().fold((0u64, 0u64), |(e, o), s| {
            (
                e + s.error_metrics.total_errors,
                o + s.error_metrics.total_operations(),
            )
        });

        let mut most_common_errors = BTreeMap::new();
        for stats in connections.values() {
            for (kind, count) in &stats.error_metrics.error_types {
                *most_common_errors.entry(*kind).or_insert(0) += count;
            }
        }

        Self {
            total_connections: connections.len(),
            healthy_connections,
            overall_error_rate: if operations == 0 {
                0.0
            } else {
                errors as f64 / operations as f64
            },
            connections,
            most_common_errors,
        }
    }
}

/// 服务器健康指标（仅统计配置目录中的服务器）
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    pub total_servers: usize,
    pub enabled_servers: usize,
    pub healthy_servers: usize,
    pub failed_servers: usize,
    pub reconnecting_servers: usize,
    pub server_states: BTreeMap<String, ConnectionState>,
    pub health_check_failures: BTreeMap<String, u32>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl HealthMetrics {
    fn servers_in(&self, state: ConnectionState) -> Vec<String> {
        self.server_states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn failed_server_list(&self) -> Vec<String> {
        self.servers_in(ConnectionState::Failed)
    }

    pub fn reconnecting_server_list(&self) -> Vec<String> {
        self.servers_in(ConnectionState::Reconnecting)
    }
}

/// 总体健康等级（按严重程度排序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Recovering,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub timestamp: DateTime<Utc>,
    pub overall_health: OverallHealth,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

const ERROR_RATE_THRESHOLD: f64 = 0.1;

/// 根据健康指标与错误汇总生成诊断；总体等级取各项中最严重者
pub fn diagnose(metrics: &HealthMetrics, errors: &ErrorSummary) -> Diagnosis {
    let mut overall = OverallHealth::Healthy;
    let mut issues = Vec::new();
    let mut recommendations = Vec::new();

    let failed = metrics.failed_server_list();
    if !failed.is_empty() {
        overall = overall.max(OverallHealth::Degraded);
        issues.push(format!("Failed servers: {}", failed.join(", ")));
        recommendations.push("Check server configurations and network connectivity".to_string());
    }

    let reconnecting = metrics.reconnecting_server_list();
    if !reconnecting.is_empty() {
        overall = overall.max(OverallHealth::Recovering);
        issues.push(format!("Reconnecting servers: {}", reconnecting.join(", ")));
        recommendations.push("Monitor reconnection attempts".to_string());
    }

    if errors.overall_error_rate > ERROR_RATE_THRESHOLD {
        overall = overall.max(OverallHealth::Unhealthy);
        issues.push(format!(
            "High error rate: {:.1}%",
            errors.overall_error_rate * 100.0
        ));
        recommendations.push("Investigate error patterns and server stability".to_string());
    }

    if let Some((kind, count)) = errors
        .most_common_errors
        .iter()
        .max_by_key(|(_, count)| **count)
    {
        issues.push(format!("Most common error: {} ({} occurrences)", kind, count));
    }

    for (server, stats) in &errors.connections {
        if stats.state == ConnectionState::CircuitOpen {
            issues.push(format!("Circuit breaker open for {}", server));
        }
    }

    Diagnosis {
        timestamp: Utc::now(),
        overall_health: overall,
        issues,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(states: &[(&str, ConnectionState)]) -> HealthMetrics {
        HealthMetrics {
            total_servers: states.len(),
            enabled_servers: states.len(),
            healthy_servers: 0,
            failed_servers: 0,
            reconnecting_servers: 0,
            server_states: states.iter().map(|(n, s)| (n.to_string(), *s)).collect(),
            health_check_failures: BTreeMap::new(),
            last_health_check: None,
        }
    }

    fn summary(rate: f64) -> ErrorSummary {
        ErrorSummary {
            total_connections: 0,
            healthy_connections: 0,
            overall_error_rate: rate,
            connections: BTreeMap::new(),
            most_common_errors: BTreeMap::new(),
        }
    }

    #[test]
    fn test_all_connected_is_healthy() {
        let d = diagnose(&metrics(&[("a", ConnectionState::Connected)]), &summary(0.0));
        assert_eq!(d.overall_health, OverallHealth::Healthy);
        assert!(d.issues.is_empty());
    }

    #[test]
    fn test_reconnecting_does_not_mask_failed() {
        let d = diagnose(
            &metrics(&[
                ("a", ConnectionState::Failed),
                ("b", ConnectionState::Reconnecting),
            ]),
            &summary(0.0),
        );
        assert_eq!(d.overall_health, OverallHealth::Degraded);
        assert_eq!(d.issues.len(), 2);
    }

    #[test]
    fn test_high_error_rate_is_unhealthy() {
        let d = diagnose(&metrics(&[("a", ConnectionState::Connected)]), &summary(0.5));
        assert_eq!(d.overall_health, OverallHealth::Unhealthy);
    }

    #[test]
    fn test_empty_summary_rate_is_zero() {
        let s = ErrorSummary::build(BTreeMap::new(), 0);
        assert_eq!(s.overall_error_rate, 0.0);
        assert_eq!(s.total_connections, 0);
    }
}
