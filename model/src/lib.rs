//! Data model and agents for enterprise identity and access management.

use tracing_subscriber::EnvFilter;

pub mod assistant;
pub mod audit;
pub mod dashboard;
pub mod directory;
pub mod events;
pub mod orchestrator;

/// Initialize logging for binaries and tests.
///
/// The filter is taken from `RUST_LOG`, defaulting to `info`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
