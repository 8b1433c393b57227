//! 动作图：网页动作节点组成的 DAG、校验、合成与执行引擎

pub mod dispatch;
pub mod engine;
pub mod synthesis;
pub mod types;
pub mod validate;

pub use dispatch::{dispatch, CommandRunner, NodeAction};
pub use engine::{ActionGraphEngine, RunningGraph};
pub use synthesis::synthesize_graph;
pub use types::*;
pub use validate::{execution_order, validation_errors, DependencyGraph};
