//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AURA__*` 覆盖（双下划线表示嵌套，如 `AURA__MCP__HEALTH_CHECK_INTERVAL_SECS=30`）。
//! 所有字段都有默认值，空文件或缺失文件得到文档中的默认配置。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::mcp::RemoteServerConfig;
use crate::resilience::{CircuitBreakerConfig, RetryConfig};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub mcp: McpSection,
    pub resilience: ResilienceSection,
    pub graph: GraphSection,
    pub orchestrator: OrchestratorSection,
}

/// [app] 段
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [mcp] 段：重连、健康检查、连接上限与服务器目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpSection {
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_secs: u64,
    /// 0 表示不启动健康检查循环
    pub health_check_interval_secs: u64,
    pub max_connections: usize,
    /// [mcp.servers.<name>]
    pub servers: BTreeMap<String, RemoteServerConfig>,
}

impl Default for McpSection {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_reconnect_attempts: 3,
            reconnect_delay_secs: 2,
            health_check_interval_secs: 60,
            max_connections: 20,
            servers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResilienceSection {
    pub circuit_breaker: CircuitBreakerSection,
    pub retry: RetrySection,
}

/// [resilience.circuit_breaker] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            half_open_max_calls: 3,
        }
    }
}

impl From<&CircuitBreakerSection> for CircuitBreakerConfig {
    fn from(section: &CircuitBreakerSection) -> Self {
        Self {
            failure_threshold: section.failure_threshold,
            recovery_timeout: Duration::from_secs(section.recovery_timeout_secs),
            half_open_max_calls: section.half_open_max_calls,
        }
    }
}

/// [resilience.retry] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl From<&RetrySection> for RetryConfig {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            base_delay: Duration::from_millis(section.base_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            exponential_base: section.exponential_base,
            jitter: section.jitter,
        }
    }
}

/// [graph] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphSection {
    /// 节点两次尝试之间的等待
    pub node_retry_pause_ms: u64,
}

impl Default for GraphSection {
    fn default() -> Self {
        Self {
            node_retry_pause_ms: 1000,
        }
    }
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub skill_confidence_threshold: f64,
    pub task_retry_count: u32,
    pub task_retry_delay_ms: u64,
    /// 请求未给出 site_scope 时使用
    pub default_site_scope: Option<String>,
    pub distill_skills: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            skill_confidence_threshold: 0.85,
            task_retry_count: 2,
            task_retry_delay_ms: 1000,
            default_site_scope: None,
            distill_skills: true,
        }
    }
}

/// 从 config 目录加载配置，环境变量 AURA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AURA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AURA")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
