//! Init command implementation.

use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Write a default configuration file.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,
}

/// Run the init command.
pub fn run_init(args: InitArgs, config_path: &Path) -> Result<()> {
    if config_path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let content = Config::default().to_toml()?;
    std::fs::write(config_path, content)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    println!("Wrote default configuration to {}", config_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/plotsync.toml");

        run_init(InitArgs { force: false }, &path).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.dataflow.fast_window_ms, 500);

        assert!(run_init(InitArgs { force: false }, &path).is_err());
        run_init(InitArgs { force: true }, &path).unwrap();
    }
}
