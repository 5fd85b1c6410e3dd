//! Tracing setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::LoggingConfig;

/// Install the global subscriber.
///
/// The config filter is the default; `PARTTRAIL_LOG` overrides it. Safe
/// to call more than once (later calls are no-ops), which keeps tests
/// that each open an engine from fighting over the global subscriber.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::builder()
        .with_env_var("PARTTRAIL_LOG")
        .try_from_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let _ = Registry::default()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}
