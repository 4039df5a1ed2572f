//! Diagnostic tracing for operators watching a loop.
//!
//! Tracing output is advisory: it goes to stderr, is filtered by `RUST_LOG`,
//! and nothing reads it back. What the marketplace remembers lives on disk
//! instead:
//!
//! - `.marketplace/events/` holds one record per outcome and is the only
//!   input to the state projection.
//! - `.marketplace/rounds/` holds per-round audit artifacts (`io/round_log`).
//! - `.marketplace/attention/` holds escalation reports (`io/attention`).
//!
//! Weight updates and phase changes are traced at `info`/`debug`, so
//! `RUST_LOG=marketplace=info marketplace loop 42` shows how a round moved
//! the market without opening any of those files.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset or unparsable.
const DEFAULT_FILTER: &str = "warn";

/// Install the stderr subscriber. A second call is a no-op.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}
