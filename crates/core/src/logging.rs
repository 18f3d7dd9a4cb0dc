//! Structured logging infrastructure for HomeMesh.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use crate::config::{LogFormat, LoggingSection};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter from `RUST_LOG`, falling back to `default_level`.
fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize the logging system with structured output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level.
///
/// # Example
/// ```no_run
/// use homemesh_core::logging;
///
/// logging::init();
/// tracing::info!("Controller started");
/// ```
pub fn init() {
    tracing_subscriber::registry()
        .with(filter("info"))
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize the logging system with JSON output for production environments.
///
/// # Example
/// ```no_run
/// use homemesh_core::logging;
///
/// logging::init_json();
/// tracing::info!(node_id = 5, "Node added");
/// ```
pub fn init_json() {
    tracing_subscriber::registry()
        .with(filter("info"))
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize logging from the `[logging]` configuration section.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_from_config(config: &LoggingSection) -> bool {
    let registry = tracing_subscriber::registry().with(filter(&config.level));
    match config.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true))
            .try_init()
            .is_ok(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
            .is_ok(),
    }
}
