//! 可观测性：tracing 订阅器初始化
//!
//! 默认 info，可通过 RUST_LOG 覆盖。网关审计记录以 `audit` 字段输出 JSON。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 测试或嵌入场景下可能已经装过订阅器
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
