// src/telemetry.rs
// Global tracing subscriber for the demo binary and for tests that want log output.
use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

static INITIALISED: OnceLock<bool> = OnceLock::new();

/// Installs a fmt subscriber filtered by `RUST_LOG` (default `info`).
/// Safe to call more than once; returns whether this process owns the subscriber.
pub fn init_tracing() -> bool {
    *INITIALISED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr);
        // Another subscriber may already be installed by the host application
        Registry::default().with(filter).with(fmt_layer).try_init().is_ok()
    })
}
