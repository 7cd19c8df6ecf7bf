//! Tracing bootstrap for binaries and integration harnesses.
//!
//! The library itself only emits `tracing` events; installing a
//! subscriber is the host's choice. [`init`] wires the conventional
//! env-filtered fmt subscriber (`RUST_LOG`, falling back to
//! `specloom=info`).

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the default subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("specloom=info,warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}
