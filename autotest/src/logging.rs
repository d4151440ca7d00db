//! Diagnostic tracing for the engine.
//!
//! Tracing output is for operators debugging a run. It is not persisted and is
//! not part of the run report; records of what happened go to the store.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn` if unset.
/// Output: stderr, compact format, so JSON reports on stdout stay clean.
///
/// # Example
/// ```bash
/// RUST_LOG=autotest=debug autotest run --case login --credentials qa
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
