//! Tracing subscriber construction.

use tracing::Subscriber;
use tracing_subscriber::EnvFilter;

/// Builds a fmt subscriber filtered by `level` (overridable through
/// `RUST_LOG`).
pub fn log_subscriber(level: &str) -> impl Subscriber + Send + Sync {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .finish()
}
