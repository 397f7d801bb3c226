//! Diagnostics via `tracing`.
//!
//! Library code only emits events; the binary decides where they go by
//! installing a subscriber. Nothing in the core writes to a concrete sink.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=orchestrator=debug orchestrator exec "cargo test"
/// ```
pub fn init() {
    init_with_default("warn");
}

/// Like [`init`], with `default_directive` used when `RUST_LOG` is unset.
pub fn init_with_default(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
