//! 可观测性

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 日志写到 stderr，stdout 留给命令输出与 JSON 响应
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
