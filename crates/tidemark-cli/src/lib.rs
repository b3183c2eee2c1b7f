//! # tidemark-cli
//!
//! Command-line driver for the tidemark reconciliation engine.
//!
//! ## Commands
//!
//! - `tidemark tick` - Replay a scenario and evaluate one reconciliation tick
//! - `tidemark freshness` - Compute how late upstream data is under a policy
//!
//! ## Configuration
//!
//! Sensor settings come from the scenario file and may be overridden by the
//! `TIDEMARK_*` environment variables understood by
//! [`tidemark_flow::config::SensorConfig::apply_env`].
//!
//! - `TIDEMARK_LOG_FORMAT` - `pretty` (default) or `json`
//! - `RUST_LOG` - log filter

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod commands;
pub mod scenario;

use clap::{Parser, Subcommand};
use tidemark_core::observability::LogFormat;

/// Tidemark CLI - asset reconciliation driver.
#[derive(Debug, Parser)]
#[command(name = "tidemark")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Log output format.
    #[arg(
        long,
        global = true,
        env = "TIDEMARK_LOG_FORMAT",
        default_value = "pretty",
        ignore_case = true
    )]
    pub log_format: LogFormatArg,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Get the effective configuration.
    #[must_use]
    pub fn config(&self) -> Config {
        Config {
            format: self.format.clone(),
            log_format: self.log_format.into(),
        }
    }
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Replay a scenario and evaluate one reconciliation tick.
    Tick(commands::tick::TickArgs),
    /// Compute minutes late for a freshness policy.
    Freshness(commands::freshness::FreshnessArgs),
}

/// Output format.
#[derive(Debug, Clone, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
    /// Table output.
    Table,
}

/// Log format accepted on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormatArg {
    /// Pretty-printed logs.
    #[default]
    Pretty,
    /// JSON structured logs.
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Pretty => Self::Pretty,
            LogFormatArg::Json => Self::Json,
        }
    }
}

/// CLI configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Output format.
    pub format: OutputFormat,
    /// Log output format.
    pub log_format: LogFormat,
}
