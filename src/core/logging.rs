//! Structured logging setup.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directive (e.g. `shelfwise=debug`).
pub const LOG_ENV: &str = "SHELFWISE_LOG";

/// Install the global stderr subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
