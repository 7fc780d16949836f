//! Logging initialization
//!
//! One compact console subscriber. `RUST_LOG` wins over the configured
//! level so operators can turn on targeted debug output without touching
//! the service configuration.

use tracing_subscriber::EnvFilter;

pub fn init(level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
