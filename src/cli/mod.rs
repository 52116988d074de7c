//! Command-line interface.
//!
//! Unified CLI for plotsync operations.

pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/plotsync.toml";

/// plotsync - collaborative data-flow sync server.
#[derive(Parser, Debug)]
#[command(name = "plotsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// The configuration path, falling back to the default location.
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the sync server.
    Start(commands::StartArgs),
    /// Write a default configuration file.
    Init(commands::InitArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["plotsync", "start", "--config", "x.toml", "--log-level", "debug"]);
        assert_eq!(cli.config_path(), PathBuf::from("x.toml"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Commands::Start(_)));
    }

    #[test]
    fn test_default_config_path() {
        let cli = Cli::parse_from(["plotsync", "init", "--force"]);
        assert_eq!(cli.config_path(), PathBuf::from(DEFAULT_CONFIG_PATH));
        match cli.command {
            Commands::Init(args) => assert!(args.force),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
