//! CLI command implementations.

mod config;
mod init;
mod start;

pub use config::{run_config, ConfigArgs, ConfigCommand};
pub use init::{run_init, InitArgs};
pub use start::{init_tracing, run_start, StartArgs};

use crate::core::config::{Config, ConfigOverrides};
use anyhow::{Context, Result};
use std::path::Path;

/// Load the configuration file, or the defaults when it does not exist, and
/// apply CLI overrides.
pub fn load_config(path: &Path, overrides: &ConfigOverrides) -> Result<Config> {
    let mut config = if path.exists() {
        Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?
    } else {
        Config::default()
    };
    config.apply_overrides(overrides);
    config.validate().context("invalid configuration")?;
    Ok(config)
}
