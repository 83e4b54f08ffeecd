//! 可观测性：tracing 订阅器初始化（默认 info，可通过 RUST_LOG 覆盖）

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let default_directive = "info"
        .parse()
        .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into());
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(default_directive))
        .with(fmt::layer())
        .try_init();
}
