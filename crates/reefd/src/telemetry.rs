//! Tracing subscriber setup for the reef daemon.
//!
//! Human-readable logs go to stderr, filtered by `RUST_LOG` when set and by
//! the configured level otherwise.

use tracing_subscriber::EnvFilter;

/// Telemetry configuration taken from the `[log]` section.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Log level filter (e.g. `"info"`, `"debug"`).
    pub level: String,
}

/// Initialize the tracing subscriber.
///
/// Call this once at startup, before any `tracing` events are emitted.
pub fn init(config: &TelemetryConfig) {
    let filter = build_filter(&config.level);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(level))
}

/// Filter for the configured level, `info` when it does not parse.
fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}
