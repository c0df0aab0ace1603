//! 可观测性：tracing 初始化
//!
//! 默认 info，可通过 RUST_LOG 覆盖；日志写 stderr，不与 REPL 输出混在一起。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化全局 tracing subscriber；重复调用返回错误
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()?;
    Ok(())
}
