//! Tracing initialization shared by the server and worker binaries

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber: `RUST_LOG` controlled filter with
/// a per-service default, plus a fmt layer.
///
/// Calling this twice is a no-op (the second init fails quietly), which
/// keeps tests that share a process happy.
pub fn init_telemetry(default_directive: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_directive.into());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
