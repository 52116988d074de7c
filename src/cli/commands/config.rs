//! Config command implementation.

use super::load_config;
use crate::core::config::ConfigOverrides;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::Path;

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate the configuration file.
    Validate,
    /// Print the effective configuration, defaults included.
    Show {
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs, config_path: &Path) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => validate_config(config_path),
        ConfigCommand::Show { format } => show_config(config_path, &format),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("config file not found: {}", path.display());
    }
    let config = load_config(path, &ConfigOverrides::default())?;
    println!("✓ {} is valid", path.display());
    let listeners = [
        ("native", &config.listeners.native),
        ("tracker", &config.listeners.tracker),
        ("web", &config.listeners.web),
    ];
    for (name, bind) in listeners {
        match bind {
            Some(bind) => println!("  {name:<8} {bind}"),
            None => println!("  {name:<8} disabled"),
        }
    }
    Ok(())
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    let config = load_config(path, &ConfigOverrides::default())?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        "toml" => println!("{}", config.to_toml()?),
        other => anyhow::bail!("unknown format: {other} (expected toml or json)"),
    }
    Ok(())
}
