//! 任务模型：请求、状态机、执行日志与统计
//!
//! 状态转换只允许 Pending → Running → {Completed, Failed}，以及 Pending/Running → Cancelled；
//! 终态写入一次后不再变化。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collaborators::RiskLevel;

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Cancelled)
        )
    }
}

fn default_budget_tokens() -> u32 {
    3000
}

/// 任务请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub goal: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default = "default_budget_tokens")]
    pub budget_tokens: u32,
    #[serde(default)]
    pub site_scope: Option<String>,
    /// 整体重试次数；None 时使用编排器配置
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl TaskRequest {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            constraints: Vec::new(),
            risk_level: RiskLevel::Low,
            budget_tokens: default_budget_tokens(),
            site_scope: None,
            retry_count: None,
            user_id: None,
            session_id: None,
        }
    }

    pub fn with_site_scope(mut self, site_scope: impl Into<String>) -> Self {
        self.site_scope = Some(site_scope.into());
        self
    }

    pub fn with_risk_level(mut self, level: RiskLevel) -> Self {
        self.risk_level = level;
        self
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    pub fn with_budget_tokens(mut self, budget: u32) -> Self {
        self.budget_tokens = budget;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub step: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub request: TaskRequest,
    pub status: TaskStatus,
    pub execution_log: Vec<TaskLogEntry>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// 已开始的执行次数（含首次）
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(request: TaskRequest) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            request,
            status: TaskStatus::Pending,
            execution_log: Vec::new(),
            result: None,
            error: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn log(&mut self, step: impl Into<String>, data: serde_json::Value) {
        self.execution_log.push(TaskLogEntry {
            step: step.into(),
            timestamp: Utc::now(),
            data,
        });
    }

    /// 状态转换；非法转换返回 false 且不修改任务
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::debug!(
                "Task {} rejected transition {:?} -> {:?}",
                self.id,
                self.status,
                next
            );
            return false;
        }
        let now = Utc::now();
        if next == TaskStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        true
    }

    pub fn complete(&mut self, result: serde_json::Value) -> bool {
        if !self.transition(TaskStatus::Completed) {
            return false;
        }
        self.result = Some(result);
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if !self.transition(TaskStatus::Failed) {
            return false;
        }
        self.error = Some(error.into());
        true
    }

    pub fn cancel(&mut self) -> bool {
        if !self.transition(TaskStatus::Cancelled) {
            return false;
        }
        self.error = Some("Task cancelled".to_string());
        true
    }

    /// 从开始到结束的耗时；未结束时为 None
    pub fn execution_time(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.completed_at?);
        (end - start).to_std().ok()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub total_tasks: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// completed / (completed + failed)
    pub success_rate: f64,
    /// 已完成任务的平均耗时
    pub avg_execution_time_secs: f64,
}

impl TaskStats {
    pub fn compute<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut stats = Self::default();
        let mut total_secs = 0.0;
        let mut timed = 0usize;

        for task in tasks {
            stats.total_tasks += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => {
                    stats.completed += 1;
                    if let Some(elapsed) = task.execution_time() {
                        total_secs += elapsed.as_secs_f64();
                        timed += 1;
                    }
                }
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }

        let finished = stats.completed + stats.failed;
        if finished > 0 {
            stats.success_rate = stats.completed as f64 / finished as f64;
        }
        if timed > 0 {
            stats.avg_execution_time_secs = total_secs / timed as f64;
        }
        stats
    }
}
