//! 可观测性：tracing 订阅器
//!
//! 默认级别 info，可用 RUST_LOG 覆盖（如 `RUST_LOG=aura=debug`）。
//! 每条远程命令另有一行 `audit` 字段为 JSON 的审计日志，见 mcp::manager。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 重复初始化（如测试中）时忽略
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
