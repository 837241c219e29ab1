//! 日志初始化：按调试模式选择过滤规则，支持环境变量覆盖。

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default directives for the server. Debug mode serializes request
/// handling, so its per-request dispatch logging (method, headers,
/// parsed `If` conditions) and the HTTP trace layer are raised to
/// `debug` to make that mode useful.
fn default_filter(debug: bool) -> EnvFilter {
    if debug {
        EnvFilter::new("info,oxidav::dav=debug,tower_http=debug")
    } else {
        EnvFilter::new("info")
    }
}

/// 初始化 tracing 日志订阅；`RUST_LOG` 覆盖默认过滤规则。
pub fn init_logging(debug: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(debug));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(debug))
        .init();
}
