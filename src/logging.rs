//! Tracing setup for the agent.
//!
//! Progress shown to the user goes through [`crate::reporter`]; this module only
//! covers diagnostics on stderr, filtered by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber. Falls back to `default_directive` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=task_agent=debug agent run "open https://example.com"
/// ```
pub fn init(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
