//! 连接管理器：远程服务器目录、批量连接、命令执行、健康检查与自动重连
//!
//! 执行后端是多路复用的，因此连接与重连总是针对全部启用的服务器批量进行；
//! 每个服务器在连接池中有独立的状态、错误统计与熔断器。
//! 另有一条逻辑连接 `agent_execution` 承载命令执行的熔断与统计。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::health::{diagnose, Diagnosis, ErrorSummary, HealthMetrics};
use super::{
    render_command, BackendHandle, CommandContext, ExecutionBackend, RemoteServerConfig,
    ServerStatus,
};
use crate::config::AppConfig;
use crate::core::AuraError;
use crate::graph::CommandRunner;
use crate::resilience::{
    CircuitBreakerConfig, ConnectionPool, ConnectionState, ErrorClassifier, ResilienceExecutor,
    RetryConfig, RetryPolicy,
};

/// 命令执行使用的逻辑连接名
pub const AGENT_EXECUTION: &str = "agent_execution";

/// 健康检查连续失败达到该值时标记为 Failed
const HEALTH_FAILED_THRESHOLD: u32 = 3;
/// 健康检查连续失败达到该值时触发自动重连
const HEALTH_RECONNECT_THRESHOLD: u32 = 2;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    /// 为零时不启动健康检查
    pub health_check_interval: Duration,
    pub max_connections: usize,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(2),
            health_check_interval: Duration::from_secs(60),
            max_connections: 20,
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl ManagerSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            auto_reconnect: cfg.mcp.auto_reconnect,
            max_reconnect_attempts: cfg.mcp.max_reconnect_attempts,
            reconnect_delay: Duration::from_secs(cfg.mcp.reconnect_delay_secs),
            health_check_interval: Duration::from_secs(cfg.mcp.health_check_interval_secs),
            max_connections: cfg.mcp.max_connections,
            circuit_breaker: (&cfg.resilience.circuit_breaker).into(),
            retry: (&cfg.resilience.retry).into(),
        }
    }
}

struct HealthTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ConnectionManager {
    settings: ManagerSettings,
    backend: Arc<dyn ExecutionBackend>,
    catalog: RwLock<BTreeMap<String, RemoteServerConfig>>,
    handle: RwLock<Option<BackendHandle>>,
    executor: ResilienceExecutor<BackendHandle>,
    initialized: AtomicBool,
    last_health_check: RwLock<Option<DateTime<Utc>>>,
    health_task: Mutex<Option<HealthTask>>,
    /// 串行化批量连接（健康检查重连与启停服务器可能并发）
    connect_lock: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(settings: ManagerSettings, backend: Arc<dyn ExecutionBackend>) -> Self {
        let pool = Arc::new(ConnectionPool::new(
            settings.max_connections,
            settings.circuit_breaker.clone(),
        ));
        let executor = ResilienceExecutor::new(pool, RetryPolicy::new(settings.retry.clone()));
        Self {
            settings,
            backend,
            catalog: RwLock::new(BTreeMap::new()),
            handle: RwLock::new(None),
            executor,
            initialized: AtomicBool::new(false),
            last_health_check: RwLock::new(None),
            health_task: Mutex::new(None),
            connect_lock: Mutex::new(()),
        }
    }

    /// 从应用配置创建，并载入配置中的服务器目录
    pub fn from_config(cfg: &AppConfig, backend: Arc<dyn ExecutionBackend>) -> Self {
        let mut manager = Self::new(ManagerSettings::from_config(cfg), backend);
        let catalog = cfg
            .mcp
            .servers
            .iter()
            .map(|(name, server)| {
                let mut server = server.clone();
                server.name = name.clone();
                (name.clone(), server)
            })
            .collect();
        manager.catalog = RwLock::new(catalog);
        manager
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<BackendHandle>> {
        self.executor.pool()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// 向目录添加（或替换）服务器配置；不会自动连接
    pub async fn add_server(&self, server: RemoteServerConfig) {
        self.catalog.write().await.insert(server.name.clone(), server);
    }

    /// 从目录移除服务器；若其已启用且管理器已初始化，则重新批量连接
    pub async fn remove_server(&self, name: &str) -> Result<(), AuraError> {
        let removed = self
            .catalog
            .write()
            .await
            .remove(name)
            .ok_or_else(|| AuraError::ServerNotFound(name.to_string()))?;
        self.pool().forget(name);
        tracing::info!("Removed server {} from catalog", name);

        if removed.enabled && self.is_initialized() {
            self.connect_all().await?;
        }
        Ok(())
    }

    pub async fn server_config(&self, name: &str) -> Option<RemoteServerConfig> {
        self.catalog.read().await.get(name).cloned()
    }

    async fn enabled_servers(&self) -> Vec<RemoteServerConfig> {
        self.catalog
            .read()
            .await
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect()
    }

    /// 批量连接全部启用服务器，启动健康检查
    pub async fn initialize(self: &Arc<Self>) -> Result<(), AuraError> {
        tracing::info!("Initializing connection manager...");

        if self.enabled_servers().await.is_empty() {
            return Err(AuraError::Config("no enabled remote servers".to_string()));
        }

        if let Err(e) = self.connect_all().await {
            tracing::error!("Failed to initialize connection manager: {}", e);
            return Err(e);
        }

        self.initialized.store(true, Ordering::SeqCst);
        self.start_health_check().await;

        let count = self.handle.read().await.as_ref().map_or(0, |h| h.servers().len());
        tracing::info!("Connection manager initialized with {} servers", count);
        Ok(())
    }

    /// 释放旧句柄后，经重试策略批量连接全部启用服务器
    pub async fn connect_all(&self) -> Result<(), AuraError> {
        let _guard = self.connect_lock.lock().await;
        let pool = self.pool();
        let enabled = self.enabled_servers().await;

        let previous = self.handle.write().await.take();
        if let Some(old) = previous {
            if let Err(e) = self.backend.disconnect(&old).await {
                tracing::warn!("Failed to release previous connection: {}", e);
            }
        }

        for name in pool.names() {
            if !enabled.iter().any(|s| s.name == name) {
                pool.remove_connection(&name);
            }
        }

        if enabled.is_empty() {
            tracing::warn!("No enabled servers, nothing to connect");
            return Ok(());
        }

        for server in &enabled {
            pool.set_state(&server.name, ConnectionState::Connecting);
        }

        let targets = &enabled;
        let result = self
            .executor
            .retry_policy()
            .execute_with_retry(move || self.backend.connect(targets), ErrorClassifier::classify)
            .await;

        match result {
            Ok(handle) => {
                for server in &enabled {
                    match pool.add_connection(&server.name, handle.clone()) {
                        Ok(()) => {
                            pool.set_state(&server.name, ConnectionState::Connected);
                            pool.reset_health_failures(&server.name);
                        }
                        Err(e) => {
                            tracing::error!("Cannot register {}: {}", server.name, e);
                            pool.set_state(&server.name, ConnectionState::Failed);
                        }
                    }
                }
                if let Err(e) = pool.add_connection(AGENT_EXECUTION, handle.clone()) {
                    tracing::error!("Cannot register {}: {}", AGENT_EXECUTION, e);
                } else {
                    pool.set_state(AGENT_EXECUTION, ConnectionState::Connected);
                }
                *self.handle.write().await = Some(handle);
                tracing::info!("Connected to {} remote servers", enabled.len());
                Ok(())
            }
            Err(e) => {
                for server in &enabled {
                    pool.set_state(&server.name, ConnectionState::Failed);
                    pool.note_health_failure(&server.name);
                }
                let names: Vec<&str> = enabled.iter().map(|s| s.name.as_str()).collect();
                tracing::error!("Failed to connect remote servers: {}", e);
                Err(AuraError::remote(names.join(","), &e))
            }
        }
    }

    async fn run_command(
        &self,
        command: &str,
        context: Option<&CommandContext>,
        fallback: Option<BoxFuture<'_, Result<String, AuraError>>>,
    ) -> Result<String, AuraError> {
        if !self.is_initialized() {
            return Err(AuraError::NotInitialized);
        }
        let prompt = render_command(command, context);
        let started = std::time::Instant::now();
        let prompt = &prompt;

        let result = self
            .executor
            .execute_with_error_handling(
                AGENT_EXECUTION,
                // 每次尝试都取当前句柄：重试期间可能已被重连替换
                move || async move {
                    let current = self.handle.read().await.clone();
                    match current {
                        Some(h) => self.backend.execute(&h, prompt).await,
                        None => Err(crate::core::BackendError::Transport(
                            "no live connection".to_string(),
                        )),
                    }
                },
                fallback,
            )
            .await;

        let audit = serde_json::json!({
            "event": "command_audit",
            "command": command,
            "context_keys": context.map(|c| c.keys().cloned().collect::<Vec<_>>()).unwrap_or_default(),
            "success": result.is_ok(),
            "duration_ms": started.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit, "command");
        result
    }

    /// 执行命令；远程失败时降级为说明性文本，调用方总能拿到字符串
    ///
    /// 仅在未初始化时返回错误。
    pub async fn execute_command(
        &self,
        command: &str,
        context: Option<&CommandContext>,
    ) -> Result<String, AuraError> {
        let fallback_text = format!("Command execution failed, but request was: {}", command);
        let fallback: BoxFuture<'_, Result<String, AuraError>> = Box::pin(async move {
            tracing::warn!("Using fallback execution mode");
            Ok(fallback_text)
        });
        self.run_command(command, context, Some(fallback)).await
    }

    /// 执行命令，不降级：失败以错误返回（供动作图节点重试使用）
    pub async fn invoke(
        &self,
        command: &str,
        context: Option<&CommandContext>,
    ) -> Result<String, AuraError> {
        self.run_command(command, context, None).await
    }

    /// 所有已连接服务器的工具；失败时返回空列表
    pub async fn get_available_tools(&self) -> Vec<String> {
        let handle = match self.handle.read().await.clone() {
            Some(h) => h,
            None => return Vec::new(),
        };
        match self.backend.list_tools(&handle).await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::error!("Failed to list tools: {}", e);
                Vec::new()
            }
        }
    }

    /// 按服务器分组的工具（server 为 None 时返回全部启用服务器）
    pub async fn get_server_tools(&self, server: Option<&str>) -> BTreeMap<String, Vec<String>> {
        let handle = match self.handle.read().await.clone() {
            Some(h) => h,
            None => return BTreeMap::new(),
        };
        let names: Vec<String> = match server {
            Some(s) => vec![s.to_string()],
            None => handle.servers().to_vec(),
        };

        let mut out = BTreeMap::new();
        for name in names {
            match self.backend.list_server_tools(&handle, &name).await {
                Ok(tools) => {
                    out.insert(name, tools);
                }
                Err(e) => tracing::warn!("Failed to list tools for {}: {}", name, e),
            }
        }
        out
    }

    pub async fn get_server_status(&self) -> BTreeMap<String, ServerStatus> {
        let pool = self.pool();
        self.catalog
            .read()
            .await
            .iter()
            .map(|(name, cfg)| {
                let status = ServerStatus {
                    kind: cfg.kind,
                    enabled: cfg.enabled,
                    connected: pool.get_connection(name).is_some(),
                    state: pool.state(name),
                    command: cfg.command.clone(),
                    args: cfg.args.clone(),
                    description: cfg.description.clone(),
                };
                (name.clone(), status)
            })
            .collect()
    }

    /// 目录中各服务器的连接状态（不含逻辑连接）
    pub async fn get_connection_states(&self) -> BTreeMap<String, ConnectionState> {
        let pool = self.pool();
        self.catalog
            .read()
            .await
            .keys()
            .map(|name| {
                let state = pool.state(name).unwrap_or(ConnectionState::Disconnected);
                (name.clone(), state)
            })
            .collect()
    }

    pub fn get_error_statistics(&self) -> ErrorSummary {
        let pool = self.pool();
        ErrorSummary::build(pool.connection_stats(), pool.get_healthy_connections().len())
    }

    pub async fn get_health_metrics(&self) -> HealthMetrics {
        let pool = self.pool();
        let server_states = self.get_connection_states().await;
        let catalog = self.catalog.read().await;

        let count = |state: ConnectionState| server_states.values().filter(|s| **s == state).count();

        HealthMetrics {
            total_servers: catalog.len(),
            enabled_servers: catalog.values().filter(|s| s.enabled).count(),
            healthy_servers: count(ConnectionState::Connected),
            failed_servers: count(ConnectionState::Failed),
            reconnecting_servers: count(ConnectionState::Reconnecting),
            health_check_failures: catalog
                .keys()
                .map(|n| (n.clone(), pool.health_failures(n)))
                .collect(),
            server_states,
            last_health_check: *self.last_health_check.read().await,
        }
    }

    pub async fn diagnose_connection_issues(&self) -> Diagnosis {
        let metrics = self.get_health_metrics().await;
        let errors = self.get_error_statistics();
        diagnose(&metrics, &errors)
    }

    /// 启用服务器并重新批量连接；连接失败不回滚配置
    pub async fn enable_server(&self, name: &str) -> Result<(), AuraError> {
        self.set_enabled(name, true).await
    }

    /// 禁用服务器并重新批量连接；连接失败不回滚配置
    pub async fn disable_server(&self, name: &str) -> Result<(), AuraError> {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), AuraError> {
        {
            let mut catalog = self.catalog.write().await;
            let server = catalog
                .get_mut(name)
                .ok_or_else(|| AuraError::ServerNotFound(name.to_string()))?;
            server.enabled = enabled;
        }
        tracing::info!(
            "Server {} {}",
            name,
            if enabled { "enabled" } else { "disabled" }
        );

        if self.is_initialized() {
            self.connect_all().await?;
        }
        Ok(())
    }

    /// 重连某个服务器（批量重连），最多 max_reconnect_attempts 次；全部失败时标记为 Failed
    pub async fn reconnect_server(&self, name: &str) -> Result<(), AuraError> {
        if self.server_config(name).await.is_none() {
            return Err(AuraError::ServerNotFound(name.to_string()));
        }
        self.reconnect(Some(name)).await
    }

    /// 重连全部启用服务器
    pub async fn reconnect_all(&self) -> Result<(), AuraError> {
        self.reconnect(None).await
    }

    async fn reconnect(&self, target: Option<&str>) -> Result<(), AuraError> {
        let attempts = self.settings.max_reconnect_attempts.max(1);
        let label = target.unwrap_or("all servers");
        let mut last_err = AuraError::Unavailable(label.to_string());

        for attempt in 1..=attempts {
            tracing::info!("Reconnecting {} (attempt {}/{})", label, attempt, attempts);
            if let Some(name) = target {
                self.pool().set_state(name, ConnectionState::Reconnecting);
            }

            match self.connect_all().await {
                Ok(()) => {
                    tracing::info!("Reconnected {}", label);
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!("Reconnection attempt {} for {} failed: {}", attempt, label, e);
                    last_err = e;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.settings.reconnect_delay).await;
            }
        }

        if let Some(name) = target {
            self.pool().set_state(name, ConnectionState::Failed);
        }
        tracing::error!("Failed to reconnect {} after {} attempts", label, attempts);
        Err(last_err)
    }

    async fn start_health_check(self: &Arc<Self>) {
        if self.settings.health_check_interval.is_zero() {
            return;
        }
        let mut slot = self.health_task.lock().await;
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.settings.health_check_interval;
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(manager) = weak.upgrade() else { break };
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = manager.perform_health_check() => {}
                }
            }
            tracing::debug!("Health check loop stopped");
        });

        *slot = Some(HealthTask { token, handle });
        tracing::info!(
            "Health check loop started (interval {}s)",
            interval.as_secs()
        );
    }

    /// 对每个启用服务器做一次探测
    ///
    /// 成功：清零计数并标记 Connected；失败：计数 +1，标记 Reconnecting（达到 3 次为 Failed），
    /// 达到 2 次且开启自动重连时触发重连。
    pub async fn perform_health_check(&self) {
        let handle = match self.handle.read().await.clone() {
            Some(h) => h,
            None => return,
        };
        *self.last_health_check.write().await = Some(Utc::now());

        let pool = self.pool();
        let servers = self.enabled_servers().await;
        let handle = &handle;
        let mut healthy = 0;

        for server in &servers {
            let name = server.name.as_str();
            let check = self
                .executor
                .execute_with_error_handling(
                    name,
                    move || self.backend.list_server_tools(handle, name),
                    None,
                )
                .await;

            match check {
                Ok(_) => {
                    healthy += 1;
                    pool.reset_health_failures(name);
                    pool.set_state(name, ConnectionState::Connected);
                    tracing::debug!("Health check passed for {}", name);
                }
                Err(e) => {
                    let failures = pool.note_health_failure(name);
                    tracing::warn!(
                        "Health check failed for {} ({} consecutive): {}",
                        name,
                        failures,
                        e
                    );
                    let state = if failures >= HEALTH_FAILED_THRESHOLD {
                        ConnectionState::Failed
                    } else {
                        ConnectionState::Reconnecting
                    };
                    pool.set_state(name, state);

                    if self.settings.auto_reconnect && failures >= HEALTH_RECONNECT_THRESHOLD {
                        tracing::info!("Attempting to reconnect unhealthy server {}", name);
                        if let Err(e) = self.reconnect_server(name).await {
                            tracing::error!("Auto-reconnect of {} failed: {}", name, e);
                        }
                    }
                }
            }
        }

        tracing::info!(
            "Health check complete: {}/{} servers healthy",
            healthy,
            servers.len()
        );
    }

    /// 停止健康检查并断开全部连接
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down connection manager...");

        let health_task = self.health_task.lock().await.take();
        if let Some(task) = health_task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                tracing::warn!("Health check task ended abnormally: {}", e);
            }
        }

        let current = self.handle.write().await.take();
        if let Some(handle) = current {
            if let Err(e) = self.backend.disconnect(&handle).await {
                tracing::error!("Error disconnecting backend: {}", e);
            }
        }

        let pool = self.pool();
        for name in pool.names() {
            pool.remove_connection(&name);
        }
        self.initialized.store(false, Ordering::SeqCst);
        tracing::info!("Connection manager shutdown complete");
    }
}

#[async_trait]
impl CommandRunner for ConnectionManager {
    async fn run(&self, command: &str, context: &CommandContext) -> Result<String, AuraError> {
        self.invoke(command, Some(context)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BackendError;
    use crate::mcp::MockBackend;

    fn quick_settings() -> ManagerSettings {
        ManagerSettings {
            auto_reconnect: true,
            max_reconnect_attempts: 2,
            reconnect_delay: Duration::from_millis(1),
            health_check_interval: Duration::ZERO,
            max_connections: 20,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(60),
                half_open_max_calls: 1,
            },
            retry: RetryConfig {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                exponential_base: 2.0,
                jitter: false,
            },
        }
    }

    async fn manager_with(
        backend: Arc<MockBackend>,
        servers: Vec<RemoteServerConfig>,
    ) -> Arc<ConnectionManager> {
        let manager = Arc::new(ConnectionManager::new(quick_settings(), backend));
        for s in servers {
            manager.add_server(s).await;
        }
        manager
    }

    #[tokio::test]
    async fn test_execute_before_initialize() {
        let manager = manager_with(Arc::new(MockBackend::new()), vec![]).await;
        let err = manager.execute_command("noop", None).await.unwrap_err();
        assert_eq!(err, AuraError::NotInitialized);
    }

    #[tokio::test]
    async fn test_initialize_requires_enabled_server() {
        let manager = manager_with(
            Arc::new(MockBackend::new()),
            vec![RemoteServerConfig::new("fs", "npx").disabled()],
        )
        .await;
        assert!(matches!(manager.initialize().await, Err(AuraError::Config(_))));
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn test_initialize_connects_enabled_only() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(
            backend.clone(),
            vec![
                RemoteServerConfig::new("playwright", "npx"),
                RemoteServerConfig::new("fs", "npx").disabled(),
            ],
        )
        .await;
        manager.initialize().await.unwrap();

        assert_eq!(backend.connected_servers(), vec!["playwright".to_string()]);
        let states = manager.get_connection_states().await;
        assert_eq!(states["playwright"], ConnectionState::Connected);
        assert_eq!(states["fs"], ConnectionState::Disconnected);
        assert!(!states.contains_key(AGENT_EXECUTION));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_initialize_marks_servers_failed() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_next_connects(5, BackendError::Transport("spawn failed".into()));
        let manager =
            manager_with(backend.clone(), vec![RemoteServerConfig::new("playwright", "npx")]).await;

        assert!(manager.initialize().await.is_err());
        assert_eq!(backend.connect_count(), 2);
        let states = manager.get_connection_states().await;
        assert_eq!(states["playwright"], ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_command_fallback_text() {
        let backend = Arc::new(MockBackend::new());
        let manager =
            manager_with(backend.clone(), vec![RemoteServerConfig::new("playwright", "npx")]).await;
        manager.initialize().await.unwrap();

        backend.fail_commands_containing("checkout", BackendError::Other("boom".into()));
        let out = manager.execute_command("open checkout", None).await.unwrap();
        assert_eq!(out, "Command execution failed, but request was: open checkout");

        let err = manager.invoke("open checkout", None).await.unwrap_err();
        assert!(matches!(err, AuraError::Remote { .. }));
    }

    #[tokio::test]
    async fn test_disable_server_reconnects_without_it() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(
            backend.clone(),
            vec![
                RemoteServerConfig::new("a", "npx"),
                RemoteServerConfig::new("b", "npx"),
            ],
        )
        .await;
        manager.initialize().await.unwrap();
        manager.disable_server("b").await.unwrap();

        assert_eq!(backend.connected_servers(), vec!["a".to_string()]);
        assert!(manager.pool().get_connection("b").is_none());
        assert!(matches!(
            manager.enable_server("missing").await,
            Err(AuraError::ServerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reconnect_server_marks_failed_after_attempts() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(backend.clone(), vec![RemoteServerConfig::new("a", "npx")]).await;
        manager.initialize().await.unwrap();

        backend.fail_next_connects(10, BackendError::Transport("down".into()));
        assert!(manager.reconnect_server("a").await.is_err());
        assert_eq!(manager.pool().state("a"), Some(ConnectionState::Failed));
    }

    #[tokio::test]
    async fn test_health_check_counts_failures_then_reconnects() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(
            backend.clone(),
            vec![
                RemoteServerConfig::new("a", "npx"),
                RemoteServerConfig::new("b", "npx"),
            ],
        )
        .await;
        manager.initialize().await.unwrap();
        backend.set_server_healthy("a", false);

        manager.perform_health_check().await;
        assert_eq!(manager.pool().health_failures("a"), 1);
        assert_eq!(manager.pool().state("a"), Some(ConnectionState::Reconnecting));
        assert_eq!(manager.pool().state("b"), Some(ConnectionState::Connected));

        let connects_before = backend.connect_count();
        manager.perform_health_check().await;
        assert!(backend.connect_count() > connects_before);
        // 重连成功后计数被清零
        assert_eq!(manager.pool().health_failures("a"), 0);
    }

    #[tokio::test]
    async fn test_health_check_marks_failed_without_auto_reconnect() {
        let backend = Arc::new(MockBackend::new());
        let settings = ManagerSettings {
            auto_reconnect: false,
            ..quick_settings()
        };
        let manager = Arc::new(ConnectionManager::new(settings, backend.clone()));
        manager.add_server(RemoteServerConfig::new("a", "npx")).await;
        manager.initialize().await.unwrap();
        backend.set_server_healthy("a", false);
        let connects = backend.connect_count();

        manager.perform_health_check().await;
        manager.perform_health_check().await;
        assert_eq!(manager.pool().state("a"), Some(ConnectionState::Reconnecting));

        manager.perform_health_check().await;
        assert_eq!(manager.pool().health_failures("a"), 3);
        assert_eq!(manager.pool().state("a"), Some(ConnectionState::Failed));
        assert_eq!(backend.connect_count(), connects);

        let metrics = manager.get_health_metrics().await;
        assert_eq!(metrics.failed_servers, 1);
        assert_eq!(metrics.health_check_failures["a"], 3);
    }

    #[tokio::test]
    async fn test_command_retry_uses_reconnected_handle() {
        let backend = Arc::new(MockBackend::new());
        let mut settings = quick_settings();
        settings.retry.base_delay = Duration::from_millis(200);
        settings.retry.max_delay = Duration::from_millis(400);
        let manager = Arc::new(ConnectionManager::new(settings, backend.clone()));
        manager.add_server(RemoteServerConfig::new("a", "npx")).await;
        manager.initialize().await.unwrap();

        backend.fail_next_executes(1, BackendError::Transport("socket reset".into()));
        let running = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.invoke("Navigate to x", None).await })
        };
        // 首次尝试失败后、重试前替换句柄
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.reconnect_all().await.unwrap();
        assert_eq!(backend.disconnect_count(), 1);

        let out = running.await.unwrap().unwrap();
        assert_eq!(out, "[mock] Navigate to x");
        assert_eq!(backend.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_tool_listing_grouped_by_server() {
        let backend = Arc::new(MockBackend::new());
        backend.set_tools("a", vec!["a_click".into(), "a_type".into()]);
        let manager = manager_with(
            backend.clone(),
            vec![
                RemoteServerConfig::new("a", "npx"),
                RemoteServerConfig::new("b", "npx"),
            ],
        )
        .await;
        assert!(manager.get_available_tools().await.is_empty());
        manager.initialize().await.unwrap();

        assert_eq!(
            manager.get_available_tools().await,
            vec!["a_click".to_string(), "a_type".to_string(), "b_ping".to_string()]
        );
        let grouped = manager.get_server_tools(None).await;
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["a"], vec!["a_click".to_string(), "a_type".to_string()]);
        assert_eq!(grouped["b"], vec!["b_ping".to_string()]);

        let only_b = manager.get_server_tools(Some("b")).await;
        assert_eq!(only_b.keys().collect::<Vec<_>>(), vec!["b"]);
        assert!(manager.get_server_tools(Some("missing")).await.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_all_is_bounded() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(backend.clone(), vec![RemoteServerConfig::new("a", "npx")]).await;
        manager.initialize().await.unwrap();

        // 单次失败被批量连接内部的重试吸收
        backend.fail_next_connects(1, BackendError::Transport("down".into()));
        let before = backend.connect_count();
        manager.reconnect_all().await.unwrap();
        assert_eq!(backend.connect_count(), before + 2);
        assert_eq!(manager.pool().state("a"), Some(ConnectionState::Connected));

        // 2 次重连 × 每次 2 次连接尝试
        backend.fail_next_connects(10, BackendError::Transport("down".into()));
        let before = backend.connect_count();
        assert!(manager.reconnect_all().await.is_err());
        assert_eq!(backend.connect_count(), before + 4);
        assert_eq!(manager.pool().state("a"), Some(ConnectionState::Failed));
    }
}
