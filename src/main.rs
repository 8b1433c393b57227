//! Aura - Rust 智能自动化编排系统
//!
//! 入口：`aura "<goal>" [site_scope]`。加载配置、初始化日志、经执行后端连接远程服务器，
//! 提交目标并等待其结束，输出任务与统计 JSON；Ctrl+C 时优雅关闭。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use aura::config::{load_config, AppConfig};
use aura::core::{
    run_until_shutdown, Collaborators, OrchestratorCleanup, ShutdownCoordinator, ShutdownManager,
    TaskOrchestrator, TaskRequest,
};
use aura::mcp::{ConnectionManager, MockBackend};
use aura::observability;

const TASK_WAIT: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1);
    let goal = args.next().context("usage: aura \"<goal>\" [site_scope]")?;
    let site_scope = args.next();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let backend = Arc::new(MockBackend::new());
    let manager = Arc::new(ConnectionManager::from_config(&cfg, backend));
    let orchestrator = Arc::new(TaskOrchestrator::from_config(
        &cfg,
        Collaborators::basic(),
        manager,
    ));
    orchestrator
        .initialize()
        .await
        .context("Failed to initialize connection manager")?;

    let shutdown = Arc::new(ShutdownManager::new());
    let mut coordinator = ShutdownCoordinator::new();
    coordinator.register(OrchestratorCleanup::new(orchestrator.clone()));

    let mut request = TaskRequest::new(goal);
    if let Some(scope) = site_scope {
        request = request.with_site_scope(scope);
    }

    let app = {
        let orchestrator = orchestrator.clone();
        async move {
            let id = orchestrator.create_task(request).await;
            match orchestrator.wait_for_terminal(&id, TASK_WAIT).await {
                Ok(task) => {
                    let report = serde_json::json!({
                        "task": task,
                        "stats": orchestrator.get_stats().await,
                    });
                    match serde_json::to_string_pretty(&report) {
                        Ok(text) => println!("{}", text),
                        Err(e) => tracing::error!("Failed to render report: {}", e),
                    }
                }
                Err(e) => tracing::error!("Task {} did not finish: {}", id, e),
            }
        }
    };

    if let Some(reason) = run_until_shutdown(shutdown, app, &coordinator).await {
        tracing::info!(?reason, "Stopped before the task finished");
    }

    Ok(())
}
