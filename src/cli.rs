//! Command-line interface for logmailer using clap.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

/// Format of logmailer's own diagnostics on stderr.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format for journalctl (default).
    #[default]
    Text,
    /// Structured JSON format for log aggregation.
    Json,
}

/// Mail the recent log history whenever a severe event is logged.
#[derive(Parser, Debug)]
#[command(name = "logmailer")]
#[command(version)]
#[command(about = "Mail the recent log history whenever a severe event is logged")]
pub struct Cli {
    /// Path to configuration file.
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Validate configuration and exit.
    #[arg(long = "validate")]
    pub validate: bool,

    /// Log format: text or json.
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, env = "LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Read log lines from this file instead of stdin.
    #[arg(short = 'i', long = "input")]
    pub input: Option<PathBuf>,
}
