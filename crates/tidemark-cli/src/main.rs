//! Tidemark CLI - drive asset reconciliation ticks by hand.
//!
//! The main entry point for the `tidemark` CLI binary.

use anyhow::Result;
use clap::Parser;

use tidemark_cli::{Cli, Commands};
use tidemark_core::observability::init_logging;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config();

    init_logging(config.log_format);

    match cli.command {
        Commands::Tick(args) => tidemark_cli::commands::tick::execute(&args, &config),
        Commands::Freshness(args) => tidemark_cli::commands::freshness::execute(&args, &config),
    }
}
