//! plotsync - unified CLI entrypoint.
//!
//! Usage:
//!   plotsync start --config config/plotsync.toml
//!   plotsync config validate --config config/plotsync.toml
//!   plotsync config show [--format json]
//!   plotsync init [--force]

use anyhow::Result;
use clap::Parser;
use plotsync::cli::commands::{run_config, run_init, run_start};
use plotsync::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config_path();

    match cli.command {
        Commands::Start(args) => run_start(args, &config_path, cli.log_level).await,
        Commands::Init(args) => run_init(args, &config_path),
        Commands::Config(args) => run_config(args, &config_path),
    }
}
