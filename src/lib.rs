//! Aura - Rust 智能自动化编排系统
//!
//! 模块划分：
//! - **collaborators**: 指令解析、风险、策略、技能库、站点探索的接口与规则实现
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、任务模型、任务编排、优雅关闭
//! - **graph**: 动作图模型、校验排序、节点分派与执行引擎
//! - **mcp**: 远程工具服务器目录、执行后端抽象、连接管理与健康报告
//! - **observability**: tracing 初始化
//! - **resilience**: 失败分类、熔断器、指数退避重试、连接池与容错执行器

pub mod collaborators;
pub mod config;
pub mod core;
pub mod graph;
pub mod mcp;
pub mod observability;
pub mod resilience;

pub use crate::core::{AuraError, TaskOrchestrator, TaskRequest, TaskStatus};
