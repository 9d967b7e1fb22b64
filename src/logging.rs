//! Logging setup
//!
//! Diagnostics go to stderr so command output on stdout stays clean.
//! `RUST_LOG` overrides the configured level.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Install the global subscriber
///
/// Returns `false` if a subscriber was already installed, in which case the
/// existing one is kept.
pub fn init_logging(config: &LogConfig) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let json = config.json.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .with_target(true)
            .with_thread_ids(true)
    });
    let plain = (!config.json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json)
        .with(plain)
        .try_init()
        .is_ok()
}
