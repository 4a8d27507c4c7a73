//! Tracing subscriber setup, matching the codebase's existing
//! `tracing-subscriber` `fmt` + `EnvFilter` wiring.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global `fmt` subscriber filtered by `filter` (a standard
/// `tracing_subscriber::EnvFilter` directive string, e.g. `"info"` or
/// `"agent_ledger_supervisor=debug,warn"`). Safe to call once at process
/// startup; external binaries embedding this crate own the call site.
pub fn init(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
