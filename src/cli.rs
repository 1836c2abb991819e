//! CLI argument parsing for flex-collector
//!
//! This module provides the command-line interface using clap derive macros.
//!
//! # Options
//!
//! - `--config-file` / `-c`: Single config file (env: FLEX_CONFIG_FILE)
//! - `--config-dir` / `-d`: Directory of `.yml`/`.yaml` configs (env: FLEX_CONFIG_DIR)
//! - `--event-limit`: Maximum events per run, 0 for unlimited (env: FLEX_EVENT_LIMIT)
//! - `--log-level` / `-l`: Log level (trace/debug/info/warn/error, env: FLEX_LOG_LEVEL)
//! - `--log-format`: Log line format (text/json, env: FLEX_LOG_FORMAT)
//! - `--pretty`: Pretty-print the JSON output
//! - `--validate`: Load and validate configs, then exit
//! - `--serve`: Harvest on an interval and serve the status endpoints
//! - `--port` / `-p`: Status server port (env: FLEX_PORT)
//! - `--interval`: Seconds between harvests in serve mode (env: FLEX_INTERVAL)
//!
//! # Precedence
//!
//! CLI arguments take precedence over environment variables, which take
//! precedence over defaults. When neither a file nor a directory is given,
//! `./flexConfigs` is used.

use clap::{Parser, ValueEnum};
use std::fmt;
use std::path::PathBuf;

use crate::config::DEFAULT_EVENT_LIMIT;

/// Config directory used when no config source is given
pub const DEFAULT_CONFIG_DIR: &str = "flexConfigs";

/// flex-collector - declarative telemetry collector
///
/// Runs the sources described in YAML configs (HTTP APIs, shell commands,
/// JMX, files) and reshapes their output into events and dimensional
/// metrics.
#[derive(Parser, Debug)]
#[command(name = "flex-collector")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to a single config file
    #[arg(short = 'c', long, value_name = "FILE", env = "FLEX_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Directory of config files
    #[arg(short = 'd', long, value_name = "DIR", env = "FLEX_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Maximum events per run (0 = unlimited)
    #[arg(long, value_name = "N", default_value_t = DEFAULT_EVENT_LIMIT, env = "FLEX_EVENT_LIMIT")]
    pub event_limit: usize,

    /// Log level
    #[arg(
        short,
        long,
        value_enum,
        default_value = "info",
        env = "FLEX_LOG_LEVEL"
    )]
    pub log_level: LogLevel,

    /// Log line format
    #[arg(long, value_enum, default_value = "text", env = "FLEX_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Pretty-print the JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Harvest periodically and serve /health, /status and /metrics
    #[arg(long)]
    pub serve: bool,

    /// Status server port
    #[arg(short, long, value_name = "PORT", default_value_t = 9469, env = "FLEX_PORT")]
    pub port: u16,

    /// Seconds between harvests in serve mode
    #[arg(long, value_name = "SECONDS", default_value_t = 30, env = "FLEX_INTERVAL")]
    pub interval: u64,
}

impl Cli {
    /// Config directory to read when no single file is given
    pub fn config_dir_or_default(&self) -> PathBuf {
        self.config_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR))
    }
}

/// Verbosity passed to the log filter when `RUST_LOG` is unset
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Filter directive for this level
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directive())
    }
}

/// Log line format
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line, for log shippers
    Json,
}
