//! flex-collector library
//!
//! This crate provides a declaratively configured telemetry collector:
//! YAML configs describe data sources (HTTP APIs, shell commands, JMX,
//! files, cached results of earlier sources) and the transformations that
//! turn their raw output into events and dimensional metrics.

pub mod cli;
pub mod collector;
pub mod config;
pub mod context;
pub mod error;
pub mod metric_parser;
pub mod metrics;
pub mod runner;
pub mod server;
pub mod transformer;

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging subsystem
///
/// Logs go to stderr so stdout carries only the collected payload.
///
/// # Arguments
/// * `level` - Log level string (trace, debug, info, warn, error)
/// * `json` - Emit one JSON object per line
///
/// # Errors
/// Returns an error if the logging system fails to initialize
pub fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}
