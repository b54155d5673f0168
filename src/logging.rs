//! Tracing setup for the command-line runner.
//!
//! Environment variables:
//! - `RUST_LOG`: log filter (default: `info`)
//! - `EVENTLOG_TAIL_LOG_JSON`: `1` or `true` for JSON lines
//!
//! Logs go to stderr; stdout carries metrics only.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// Environment variable switching log output to JSON.
pub const JSON_ENV_VAR: &str = "EVENTLOG_TAIL_LOG_JSON";

/// Returns true if `value` turns JSON log output on.
#[must_use]
pub fn json_requested(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "true"))
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing() -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let use_json = json_requested(std::env::var(JSON_ENV_VAR).ok().as_deref());

    let registry = tracing_subscriber::registry().with(env_filter);
    if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .compact(),
            )
            .try_init()
    }
}
