//! Configuration parsing and validation.
//!
//! Configuration is loaded from a TOML file with CLI overrides. Every section
//! is optional and falls back to the defaults below.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration for the protocol gateway.
    #[serde(default)]
    pub listeners: ListenerConfig,

    /// Framed protocol and liveness settings.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Backing store settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Recompute batching windows.
    #[serde(default)]
    pub dataflow: DataflowConfig,

    /// Filter engine settings.
    #[serde(default)]
    pub filters: FilterConfig,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Administrative console.
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Bind addresses for each transport. A missing entry disables that listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Framed TCP listener for native AR clients.
    #[serde(default = "default_native_bind")]
    pub native: Option<String>,

    /// Framed TCP listener for the tracking service (auto-registered).
    #[serde(default = "default_tracker_bind")]
    pub tracker: Option<String>,

    /// WebSocket listener for web/tablet clients.
    #[serde(default = "default_web_bind")]
    pub web: Option<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            native: default_native_bind(),
            tracker: default_tracker_bind(),
            web: default_web_bind(),
        }
    }
}

/// Framed protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Interval between server heartbeats in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a native connection is dropped, in milliseconds.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Largest accepted frame payload in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Largest amount of unparsed bytes kept per connection.
    #[serde(default = "default_read_buffer_limit")]
    pub read_buffer_limit: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            read_buffer_limit: default_read_buffer_limit(),
        }
    }
}

impl ProtocolConfig {
    /// Heartbeat interval as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat timeout as a duration.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Backing store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path, or `:memory:`.
    #[serde(default = "default_database")]
    pub database: String,

    /// Delay before reopening a dropped database, in milliseconds.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Debounce window for persisted field writes, in milliseconds.
    #[serde(default = "default_write_debounce_ms")]
    pub write_debounce_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            write_debounce_ms: default_write_debounce_ms(),
        }
    }
}

/// Recompute batching windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataflowConfig {
    /// Coalescing window for direct edits, in milliseconds.
    #[serde(default = "default_fast_window_ms")]
    pub fast_window_ms: u64,

    /// Coalescing window for rescheduled work, in milliseconds.
    #[serde(default = "default_slow_window_ms")]
    pub slow_window_ms: u64,
}

impl Default for DataflowConfig {
    fn default() -> Self {
        Self {
            fast_window_ms: default_fast_window_ms(),
            slow_window_ms: default_slow_window_ms(),
        }
    }
}

/// Filter engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Grace period before an empty new filter is deleted, in milliseconds.
    #[serde(default = "default_empty_grace_ms")]
    pub empty_grace_ms: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            empty_grace_ms: default_empty_grace_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Administrative console configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Read administrative commands from stdin.
    #[serde(default)]
    pub stdin: bool,
}

// Default value functions

fn default_native_bind() -> Option<String> {
    Some("0.0.0.0:8835".to_string())
}

fn default_tracker_bind() -> Option<String> {
    Some("0.0.0.0:8836".to_string())
}

fn default_web_bind() -> Option<String> {
    Some("0.0.0.0:8837".to_string())
}

fn default_heartbeat_interval_ms() -> u64 {
    100
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_read_buffer_limit() -> usize {
    64 * 1024 * 1024
}

fn default_database() -> String {
    "data/plotsync.db".to_string()
}

fn default_reconnect_backoff_ms() -> u64 {
    5_000
}

fn default_write_debounce_ms() -> u64 {
    2_000
}

fn default_fast_window_ms() -> u64 {
    500
}

fn default_slow_window_ms() -> u64 {
    3_000
}

fn default_empty_grace_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render config")
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref database) = overrides.database {
            self.storage.database = database.clone();
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_listeners()?;
        self.validate_protocol()?;
        self.validate_storage()?;
        self.validate_dataflow()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_listeners(&self) -> Result<()> {
        let binds = [
            ("listeners.native", &self.listeners.native),
            ("listeners.tracker", &self.listeners.tracker),
            ("listeners.web", &self.listeners.web),
        ];
        for (name, bind) in binds {
            if let Some(bind) = bind {
                bind.parse::<SocketAddr>()
                    .with_context(|| format!("{name} is not a socket address: {bind}"))?;
            }
        }
        Ok(())
    }

    fn validate_protocol(&self) -> Result<()> {
        if self.protocol.heartbeat_interval_ms == 0 {
            anyhow::bail!("protocol.heartbeat_interval_ms must be > 0");
        }
        if self.protocol.heartbeat_timeout_ms <= self.protocol.heartbeat_interval_ms {
            anyhow::bail!(
                "protocol.heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.protocol.heartbeat_timeout_ms,
                self.protocol.heartbeat_interval_ms
            );
        }
        if self.protocol.max_frame_bytes > self.protocol.read_buffer_limit {
            anyhow::bail!(
                "protocol.max_frame_bytes ({}) cannot exceed read_buffer_limit ({})",
                self.protocol.max_frame_bytes,
                self.protocol.read_buffer_limit
            );
        }
        Ok(())
    }

    fn validate_storage(&self) -> Result<()> {
        if self.storage.database.trim().is_empty() {
            anyhow::bail!("storage.database must not be empty");
        }
        Ok(())
    }

    fn validate_dataflow(&self) -> Result<()> {
        if self.dataflow.fast_window_ms > self.dataflow.slow_window_ms {
            anyhow::bail!(
                "dataflow.fast_window_ms ({}) cannot exceed slow_window_ms ({})",
                self.dataflow.fast_window_ms,
                self.dataflow.slow_window_ms
            );
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override database path.
    pub database: Option<String>,
}
