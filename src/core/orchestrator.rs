//! 任务编排器：任务生命周期与执行流水线
//!
//! 每个任务在独立的 tokio 任务中运行：解析 → 风险评估 → 策略检查 → 选择策略 → 执行 → 记录。
//! 技能库高置信匹配时走脚本回放，否则探索站点、合成动作图并交给动作图引擎执行。
//! 策略拒绝与校验错误不重试；其余失败按 retry_count 整体重跑，期间状态保持 Running。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::supervisor::TaskSupervisor;
use super::task::{Task, TaskId, TaskRequest, TaskStats, TaskStatus};
use super::AuraError;
use crate::collaborators::{
    site_domain, CommandParser, InMemorySkillLibrary, KeywordCommandParser, ParsedCommand, PolicyEngine,
    RiskEngine, RulePolicyEngine, RuleRiskEngine, SiteExplorer, SkillLibrary, StaticSiteExplorer,
    SITE_PARAMETER,
};
use crate::config::AppConfig;
use crate::graph::{synthesize_graph, ActionGraph, ActionGraphEngine, ExecutionMode};
use crate::mcp::ConnectionManager;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// 技能匹配置信度需严格大于该值才走脚本回放
    pub skill_confidence_threshold: f64,
    pub task_retry_count: u32,
    pub task_retry_delay: Duration,
    pub default_site_scope: Option<String>,
    /// 成功的动作图是否交给技能库沉淀
    pub distill_skills: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            skill_confidence_threshold: 0.85,
            task_retry_count: 2,
            task_retry_delay: Duration::from_secs(1),
            default_site_scope: None,
            distill_skills: true,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            skill_confidence_threshold: cfg.orchestrator.skill_confidence_threshold,
            task_retry_count: cfg.orchestrator.task_retry_count,
            task_retry_delay: Duration::from_millis(cfg.orchestrator.task_retry_delay_ms),
            default_site_scope: cfg.orchestrator.default_site_scope.clone(),
            distill_skills: cfg.orchestrator.distill_skills,
        }
    }
}

/// 编排器依赖的外部协作者
#[derive(Clone)]
pub struct Collaborators {
    pub parser: Arc<dyn CommandParser>,
    pub risk: Arc<dyn RiskEngine>,
    pub policy: Arc<dyn PolicyEngine>,
    pub skills: Arc<dyn SkillLibrary>,
    pub explorer: Arc<dyn SiteExplorer>,
}

impl Collaborators {
    /// 规则与内存实现
    pub fn basic() -> Self {
        Self {
            parser: Arc::new(KeywordCommandParser::new()),
            risk: Arc::new(RuleRiskEngine::new()),
            policy: Arc::new(RulePolicyEngine::new()),
            skills: Arc::new(InMemorySkillLibrary::new()),
            explorer: Arc::new(StaticSiteExplorer::new()),
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn CommandParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_risk(mut self, risk: Arc<dyn RiskEngine>) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn PolicyEngine>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_skills(mut self, skills: Arc<dyn SkillLibrary>) -> Self {
        self.skills = skills;
        self
    }

    pub fn with_explorer(mut self, explorer: Arc<dyn SiteExplorer>) -> Self {
        self.explorer = explorer;
        self
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::basic()
    }
}

struct TaskEntry {
    task: Task,
    cancel: CancellationToken,
}

pub struct TaskOrchestrator {
    settings: OrchestratorSettings,
    collaborators: Collaborators,
    engine: Arc<ActionGraphEngine>,
    manager: Option<Arc<ConnectionManager>>,
    tasks: RwLock<HashMap<TaskId, TaskEntry>>,
    supervisor: TaskSupervisor,
    /// 任务状态变化时唤醒等待者
    changed: Notify,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        collaborators: Collaborators,
        engine: Arc<ActionGraphEngine>,
    ) -> Self {
        Self {
            settings,
            collaborators,
            engine,
            manager: None,
            tasks: RwLock::new(HashMap::new()),
            supervisor: TaskSupervisor::new(),
            changed: Notify::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// 以连接管理器作为动作图的命令执行者
    pub fn from_config(
        cfg: &AppConfig,
        collaborators: Collaborators,
        manager: Arc<ConnectionManager>,
    ) -> Self {
        let engine = ActionGraphEngine::new(manager.clone())
            .with_retry_pause(Duration::from_millis(cfg.graph.node_retry_pause_ms));
        Self::new(
            OrchestratorSettings::from_config(cfg),
            collaborators,
            Arc::new(engine),
        )
        .with_connection_manager(manager)
    }

    /// 挂接连接管理器：initialize / shutdown 时一并启动与关闭
    pub fn with_connection_manager(mut self, manager: Arc<ConnectionManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn engine(&self) -> &Arc<ActionGraphEngine> {
        &self.engine
    }

    pub async fn initialize(&self) -> Result<(), AuraError> {
        if let Some(manager) = &self.manager {
            manager.initialize().await?;
        }
        tracing::info!("Task orchestrator initialized");
        Ok(())
    }

    /// 创建任务并立即返回 ID；任务在后台执行
    pub async fn create_task(self: &Arc<Self>, request: TaskRequest) -> TaskId {
        let task = Task::new(request);
        let id = task.id.clone();
        let cancel = self.supervisor.child_token();
        tracing::info!("Created task {}: {}", id, task.request.goal);

        self.tasks.write().await.insert(
            id.clone(),
            TaskEntry {
                task,
                cancel: cancel.clone(),
            },
        );

        let this = Arc::clone(self);
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            this.run_task(&task_id, cancel).await;
        });

        let mut workers = self.workers.lock().await;
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
        id
    }

    /// 按原请求重新创建一个任务
    pub async fn replay_task(self: &Arc<Self>, task_id: &str) -> Result<TaskId, AuraError> {
        let request = self.get_task_status(task_id).await?.request;
        tracing::info!("Replaying task {}", task_id);
        Ok(self.create_task(request).await)
    }

    pub async fn get_task_status(&self, task_id: &str) -> Result<Task, AuraError> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|e| e.task.clone())
            .ok_or_else(|| AuraError::TaskNotFound(task_id.to_string()))
    }

    /// 取消任务；任务已处于终态时返回 false
    pub async fn cancel_task(&self, task_id: &str) -> Result<bool, AuraError> {
        let cancelled = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| AuraError::TaskNotFound(task_id.to_string()))?;
            let cancelled = entry.task.cancel();
            if cancelled {
                entry.cancel.cancel();
            }
            cancelled
        };

        if cancelled {
            tracing::info!("Task {} cancelled", task_id);
            self.changed.notify_waiters();
        }
        Ok(cancelled)
    }

    /// 全部任务，按创建时间排序
    pub async fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub async fn get_stats(&self) -> TaskStats {
        let tasks = self.tasks.read().await;
        TaskStats::compute(tasks.values().map(|e| &e.task))
    }

    /// 等待任务进入终态，超时返回错误
    pub async fn wait_for_terminal(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Task, AuraError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            let task = self.get_task_status(task_id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(AuraError::TaskExecution(format!(
                    "Timed out waiting for task {}",
                    task_id
                )));
            }
        }
    }

    /// 取消全部未结束任务，等待执行单元退出，再关闭连接管理器
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down task orchestrator...");
        self.supervisor.cancel_all();
        {
            let mut tasks = self.tasks.write().await;
            for entry in tasks.values_mut() {
                entry.task.cancel();
            }
        }
        self.changed.notify_waiters();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::warn!("Task worker ended abnormally: {}", e);
            }
        }

        if let Some(manager) = &self.manager {
            manager.shutdown().await;
        }
        tracing::info!("Task orchestrator shutdown complete");
    }

    /// 在任务条目上执行一次修改；任务不存在时返回 None
    async fn update<R>(&self, task_id: &str, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        let result = {
            let mut tasks = self.tasks.write().await;
            tasks.get_mut(task_id).map(|e| f(&mut e.task))
        };
        self.changed.notify_waiters();
        result
    }

    async fn log_step(&self, task_id: &str, step: &str, data: serde_json::Value) {
        self.update(task_id, |task| task.log(step, data)).await;
    }

    async fn run_task(&self, task_id: &str, cancel: CancellationToken) {
        if cancel.is_cancelled() {
            self.update(task_id, |task| task.cancel()).await;
            return;
        }

        let started = self
            .update(task_id, |task| {
                task.transition(TaskStatus::Running)
                    .then(|| task.request.clone())
            })
            .await
            .flatten();
        let Some(request) = started else {
            return;
        };

        let max_attempts = request
            .retry_count
            .unwrap_or(self.settings.task_retry_count)
            .saturating_add(1);
        let mut attempt = 1;

        loop {
            self.update(task_id, |task| task.attempts = attempt).await;

            let outcome = match self.run_pipeline(task_id, &request, &cancel).await {
                _ if cancel.is_cancelled() => Err(AuraError::Cancelled),
                outcome => outcome,
            };

            match outcome {
                Ok(result) => {
                    self.update(task_id, |task| task.complete(result)).await;
                    tracing::info!("Task {} completed", task_id);
                    break;
                }
                Err(AuraError::Cancelled) => {
                    self.update(task_id, |task| task.cancel()).await;
                    break;
                }
                Err(e) if !e.is_fatal() && attempt < max_attempts => {
                    tracing::warn!(
                        "Task {} attempt {}/{} failed: {}, retrying...",
                        task_id,
                        attempt,
                        max_attempts,
                        e
                    );
                    self.log_step(
                        task_id,
                        "retry",
                        json!({ "attempt": attempt, "error": e.to_string() }),
                    )
                    .await;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.update(task_id, |task| task.cancel()).await;
                            break;
                        }
                        _ = tokio::time::sleep(self.settings.task_retry_delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!("Task {} failed: {}", task_id, e);
                    self.update(task_id, |task| task.fail(e.to_string())).await;
                    break;
                }
            }
        }
    }

    async fn run_pipeline(
        &self,
        task_id: &str,
        request: &TaskRequest,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, AuraError> {
        let c = &self.collaborators;

        let parsed = c.parser.parse(&request.goal).await?;
        self.log_step(
            task_id,
            "parse",
            json!({
                "intent": parsed.intent,
                "confidence": parsed.confidence,
                "parameters": parsed.parameters,
            }),
        )
        .await;

        let risk = c.risk.assess(&parsed, request.risk_level).await?;
        self.log_step(task_id, "risk_assessment", json!(risk)).await;

        let decision = c.policy.check(&parsed, &risk).await?;
        self.log_step(task_id, "policy_check", json!(decision)).await;
        if !decision.allowed {
            let reason = decision
                .reason
                .unwrap_or_else(|| "denied by policy".to_string());
            return Err(AuraError::PolicyViolation(reason));
        }
        if decision.approval_required {
            tracing::warn!("Task {} requires approval, proceeding", task_id);
        }
        if cancel.is_cancelled() {
            return Err(AuraError::Cancelled);
        }

        let site_scope = self.resolve_site_scope(request, &parsed);
        let mut match_params = parsed.parameters.clone();
        if let Some(scope) = &site_scope {
            match_params.insert(SITE_PARAMETER.to_string(), site_domain(scope));
        }

        match c
            .skills
            .find_matching_skill(&parsed.intent, &match_params)
            .await
        {
            Some(skill) if skill.confidence > self.settings.skill_confidence_threshold => {
                self.log_step(
                    task_id,
                    "strategy_selection",
                    json!({ "mode": "script", "skill_id": skill.skill_id, "confidence": skill.confidence }),
                )
                .await;
                self.run_script(task_id, &skill.skill_id, &skill.parameters, cancel)
                    .await
            }
            _ => {
                self.log_step(
                    task_id,
                    "strategy_selection",
                    json!({ "mode": "ai_agent", "confidence": parsed.confidence }),
                )
                .await;
                self.run_ai_agent(task_id, request, &parsed, site_scope, cancel)
                    .await
            }
        }
    }

    /// 脚本模式：技能返回回放图时经引擎执行，否则技能结果即任务结果
    async fn run_script(
        &self,
        task_id: &str,
        skill_id: &str,
        parameters: &std::collections::BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, AuraError> {
        let output = self
            .collaborators
            .skills
            .execute_skill(skill_id, parameters)
            .await?;

        let Some(plan) = output.get("graph").cloned() else {
            return Ok(json!({ "mode": "script", "skill_id": skill_id, "output": output }));
        };

        let mut graph = ActionGraph::from_json(plan)?;
        let result = self
            .engine
            .execute_with_cancel(&mut graph, ExecutionMode::Normal, cancel)
            .await?;
        self.log_step(task_id, "execution", json!({ "graph_id": graph.id, "success": result.success }))
            .await;
        if cancel.is_cancelled() {
            return Err(AuraError::Cancelled);
        }
        if !result.success {
            return Err(AuraError::TaskExecution(
                result.error.unwrap_or_else(|| "skill replay failed".to_string()),
            ));
        }
        Ok(json!({ "mode": "script", "skill_id": skill_id, "execution": result }))
    }

    /// 站点范围：请求 → 解析出的 url 参数 → 配置默认值
    fn resolve_site_scope(&self, request: &TaskRequest, parsed: &ParsedCommand) -> Option<String> {
        request
            .site_scope
            .clone()
            .or_else(|| parsed.parameters.get("url").cloned())
            .or_else(|| self.settings.default_site_scope.clone())
    }

    /// 动态模式：探索站点 → 合成动作图 → 执行 → 成功后沉淀技能
    async fn run_ai_agent(
        &self,
        task_id: &str,
        request: &TaskRequest,
        parsed: &ParsedCommand,
        site_scope: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, AuraError> {
        let site_scope = site_scope.ok_or_else(|| {
            AuraError::Validation(vec!["no site scope for dynamic execution".to_string()])
        })?;

        let site = self.collaborators.explorer.explore(&site_scope).await?;
        let mut graph = synthesize_graph(&request.goal, &site, parsed, request.budget_tokens);
        self.log_step(
            task_id,
            "graph_synthesized",
            json!({ "graph_id": graph.id, "site": site.domain, "nodes": graph.nodes.len() }),
        )
        .await;

        let result = self
            .engine
            .execute_with_cancel(&mut graph, ExecutionMode::Normal, cancel)
            .await?;
        self.log_step(
            task_id,
            "execution",
            json!({
                "graph_id": graph.id,
                "success": result.success,
                "completed_nodes": result.completed_nodes,
                "total_nodes": result.total_nodes,
            }),
        )
        .await;
        if cancel.is_cancelled() {
            return Err(AuraError::Cancelled);
        }
        if !result.success {
            return Err(AuraError::TaskExecution(
                result.error.unwrap_or_else(|| "graph execution failed".to_string()),
            ));
        }

        let skill_id = if self.settings.distill_skills {
            match self.collaborators.skills.distill(parsed, &graph, &result).await {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!("Skill distillation failed for task {}: {}", task_id, e);
                    None
                }
            }
        } else {
            None
        };

        Ok(json!({
            "mode": "ai_agent",
            "graph_id": graph.id,
            "site": site.domain,
            "skill_id": skill_id,
            "execution": result,
        }))
    }
}
