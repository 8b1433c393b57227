//! 远程工具服务器：配置、执行后端抽象、连接管理与健康诊断

pub mod backend;
pub mod health;
pub mod manager;
pub mod mock;
pub mod types;

pub use backend::{BackendHandle, ExecutionBackend};
pub use health::{diagnose, Diagnosis, ErrorSummary, HealthMetrics, OverallHealth};
pub use manager::{ConnectionManager, ManagerSettings, AGENT_EXECUTION};
pub use mock::MockBackend;
pub use types::{render_command, CommandContext, RemoteServerConfig, ServerKind, ServerStatus};
