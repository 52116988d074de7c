//! Start command implementation.

use super::load_config;
use crate::core::config::ConfigOverrides;
use crate::core::runtime::Runtime;
use anyhow::Result;
use clap::Args;
use std::path::Path;

/// Start the sync server.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Override the database path (`:memory:` for a throwaway store).
    #[arg(long)]
    pub database: Option<String>,

    /// Read administrative commands from stdin.
    #[arg(long)]
    pub console: bool,
}

/// Initialize the tracing subscriber if the telemetry feature is enabled.
/// `RUST_LOG` wins over the configured level.
#[cfg(feature = "telemetry")]
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "telemetry"))]
pub fn init_tracing(_level: &str) {}

/// Run the start command.
pub async fn run_start(args: StartArgs, config_path: &Path, log_level: Option<String>) -> Result<()> {
    let overrides = ConfigOverrides {
        log_level,
        database: args.database,
    };
    let mut config = load_config(config_path, &overrides)?;
    if args.console {
        config.admin.stdin = true;
    }
    init_tracing(&config.telemetry.log_level);
    tracing::info!(config = %config_path.display(), "configuration loaded");

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}
