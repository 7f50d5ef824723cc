//! 可观测性：结构化日志

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局日志订阅者；默认 info，可通过 RUST_LOG 覆盖（如 RUST_LOG=drivebee=debug）
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 测试或重复初始化时已存在全局订阅者，忽略即可
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}
