//! Logging utilities for the watchdog components.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize tracing with `default_level`, as text or as JSON lines.
///
/// RUST_LOG still wins when it is set. Safe to call more than once; later
/// calls are ignored.
pub fn init_with_level(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let result = if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
