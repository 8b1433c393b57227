//! 优雅关闭
//!
//! 信号（Ctrl+C / SIGTERM）或致命错误触发关闭；随后按注册顺序执行清理，
//! 典型顺序是先取消运行中的任务，再停止健康检查循环并断开执行后端。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::orchestrator::TaskOrchestrator;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupted,
    /// SIGTERM
    Terminated,
    Fatal(String),
}

/// 关闭信号：取消 token 加上首个触发原因
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(reason),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复触发时保留第一次的原因
    pub fn trigger(&self, reason: ShutdownReason) {
        let first = self.reason.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if first {
            tracing::info!(reason = ?self.reason(), "Shutdown triggered");
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.borrow().clone()
    }

    /// 订阅原因变化
    pub fn subscribe(&self) -> watch::Receiver<Option<ShutdownReason>> {
        self.reason.subscribe()
    }

    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }

    /// 后台等待系统信号并触发关闭；调用方负责在结束时 abort
    pub fn listen_for_signals(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(reason) = wait_for_signal().await {
                manager.trigger(reason);
            }
        })
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Option<ShutdownReason> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            return tokio::signal::ctrl_c()
                .await
                .ok()
                .map(|_| ShutdownReason::Interrupted);
        }
    };

    tokio::select! {
        r = tokio::signal::ctrl_c() => r.ok().map(|_| ShutdownReason::Interrupted),
        _ = sigterm.recv() => Some(ShutdownReason::Terminated),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Option<ShutdownReason> {
    tokio::signal::ctrl_c()
        .await
        .ok()
        .map(|_| ShutdownReason::Interrupted)
}

/// 关闭时执行的一步清理
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理，每步有独立超时；某步失败或超时不影响后续步骤
pub struct ShutdownCoordinator {
    steps: Vec<Arc<dyn ShutdownCleanup>>,
    step_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            step_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, step: T) {
        self.steps.push(Arc::new(step));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 执行全部清理，返回失败（含超时）的步数
    pub async fn run_cleanup(&self) -> usize {
        let mut failed = 0;
        for step in &self.steps {
            match tokio::time::timeout(self.step_timeout, step.cleanup()).await {
                Ok(Ok(())) => tracing::debug!(step = step.name(), "Cleanup done"),
                Ok(Err(e)) => {
                    failed += 1;
                    tracing::warn!(step = step.name(), "Cleanup failed: {}", e);
                }
                Err(_) => {
                    failed += 1;
                    tracing::warn!(
                        step = step.name(),
                        "Cleanup timed out after {:?}",
                        self.step_timeout
                    );
                }
            }
        }
        tracing::info!(steps = self.steps.len(), failed, "Shutdown cleanup finished");
        failed
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 取消未结束任务、等待执行单元退出，并关闭其连接管理器
pub struct OrchestratorCleanup {
    orchestrator: Arc<TaskOrchestrator>,
}

impl OrchestratorCleanup {
    pub fn new(orchestrator: Arc<TaskOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for OrchestratorCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.orchestrator.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "task_orchestrator"
    }
}

/// 运行 app 直到其结束或关闭被触发，然后执行清理
///
/// 返回关闭原因；app 正常结束时为 None。
pub async fn run_until_shutdown<F>(
    manager: Arc<ShutdownManager>,
    app: F,
    coordinator: &ShutdownCoordinator,
) -> Option<ShutdownReason>
where
    F: Future<Output = ()>,
{
    let signals = manager.listen_for_signals();

    tokio::select! {
        _ = app => tracing::info!("Application finished"),
        _ = manager.triggered() => {}
    }
    signals.abort();

    coordinator.run_cleanup().await;
    manager.reason()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::core::Collaborators;
    use crate::config::AppConfig;
    use crate::mcp::{ConnectionManager, ManagerSettings, MockBackend, RemoteServerConfig};

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_triggered());
        assert_eq!(manager.reason(), None);

        manager.trigger(ShutdownReason::Fatal("backend lost".into()));
        manager.trigger(ShutdownReason::Interrupted);
        assert!(token.is_cancelled());
        assert_eq!(
            manager.reason(),
            Some(ShutdownReason::Fatal("backend lost".into()))
        );
    }

    #[tokio::test]
    async fn test_subscriber_sees_reason() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe();
        manager.trigger(ShutdownReason::Terminated);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(ShutdownReason::Terminated));
    }

    struct Step {
        label: &'static str,
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        calls: Arc<AtomicUsize>,
        delay: Duration,
        fail: bool,
    }

    impl Step {
        fn new(
            label: &'static str,
            order: &Arc<std::sync::Mutex<Vec<&'static str>>>,
            calls: &Arc<AtomicUsize>,
        ) -> Self {
            Self {
                label,
                order: order.clone(),
                calls: calls.clone(),
                delay: Duration::ZERO,
                fail: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for Step {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.label);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                anyhow::bail!("{} failed", self.label);
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            self.label
        }
    }

    #[tokio::test]
    async fn test_cleanup_continues_after_failure_and_timeout() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut coordinator =
            ShutdownCoordinator::new().with_step_timeout(Duration::from_millis(50));
        coordinator.register(Step {
            fail: true,
            ..Step::new("failing", &order, &calls)
        });
        coordinator.register(Step {
            delay: Duration::from_secs(5),
            ..Step::new("slow", &order, &calls)
        });
        coordinator.register(Step::new("last", &order, &calls));

        assert_eq!(coordinator.run_cleanup().await, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*order.lock().unwrap(), vec!["failing", "slow", "last"]);
    }

    #[tokio::test]
    async fn test_run_until_shutdown_stops_pending_app() {
        let manager = Arc::new(ShutdownManager::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut coordinator = ShutdownCoordinator::new();
        coordinator.register(Step::new("only", &order, &calls));

        let trigger = manager.clone();
        let app = async move {
            trigger.trigger(ShutdownReason::Terminated);
            std::future::pending::<()>().await;
        };

        let reason = run_until_shutdown(manager, app, &coordinator).await;
        assert_eq!(reason, Some(ShutdownReason::Terminated));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_until_shutdown_app_finishes() {
        let coordinator = ShutdownCoordinator::new();
        let reason = run_until_shutdown(Arc::new(ShutdownManager::new()), async {}, &coordinator).await;
        assert_eq!(reason, None);
    }

    #[tokio::test]
    async fn test_orchestrator_cleanup_disconnects_backend() {
        let backend = Arc::new(MockBackend::new());
        let manager = Arc::new(ConnectionManager::new(
            ManagerSettings::default(),
            backend.clone(),
        ));
        manager
            .add_server(RemoteServerConfig::new("playwright", "npx"))
            .await;
        manager.initialize().await.unwrap();
        let orchestrator = Arc::new(TaskOrchestrator::from_config(
            &AppConfig::default(),
            Collaborators::basic(),
            manager.clone(),
        ));

        let cleanup = OrchestratorCleanup::new(orchestrator);
        cleanup.cleanup().await.unwrap();
        assert_eq!(backend.disconnect_count(), 1);
        assert!(!manager.is_initialized());
    }
}
