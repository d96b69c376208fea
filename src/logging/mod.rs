//! Logging setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber. `RUST_LOG` wins over `log_level`.
pub fn init_tracing(log_level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("fedbridge={},info", log_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
