//! 核心层：错误分类、任务模型、任务编排、任务监管与优雅关闭

pub mod error;
pub mod orchestrator;
pub mod shutdown;
pub mod supervisor;
pub mod task;

pub use error::{AuraError, BackendError};
pub use orchestrator::{Collaborators, OrchestratorSettings, TaskOrchestrator};
pub use shutdown::{
    run_until_shutdown, OrchestratorCleanup, ShutdownCleanup,
    ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
pub use supervisor::TaskSupervisor;
pub use task::{Task, TaskId, TaskLogEntry, TaskRequest, TaskStats, TaskStatus};
