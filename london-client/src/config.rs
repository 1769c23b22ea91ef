//! Device and client settings.
//!
//! Built-in defaults are replaced by a YAML file named by `LONDON_CONFIG`
//! (or `--config`), and `LONDON_*` variables win over both.

use crate::dsp::with_default_port;
use crate::pool::PoolOptions;
use crate::transaction::TransactionConfig;
use london_protocol::{Block, DEFAULT_PORT, DEVICE_VOLUME_OFFSET, MIN_SUBSCRIBE_INTERVAL};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device to talk to.
    pub device: DeviceConfig,
    /// Connection pool settings.
    pub pool: PoolConfig,
    /// Transaction timeouts.
    pub timeouts: TimeoutConfig,
    /// Protocol tuning.
    pub protocol: ProtocolConfig,
    /// Block aliases (`mic1: "000000010A"`).
    pub blocks: BTreeMap<String, String>,
}

impl Config {
    /// Reads the file named by `LONDON_CONFIG`, if set, then the `LONDON_*` overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("LONDON_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Parses a YAML device file. Missing sections keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Defaults plus `LONDON_*` overrides, for running without a file.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Overrides device, timeout and protocol settings from `LONDON_*` variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides looked up through `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        self.device.apply_overrides(&var);
        self.timeouts.apply_overrides(&var);
        self.protocol.apply_overrides(&var);
    }

    /// Writes the settings, block aliases included, as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Checks that the configuration describes a usable device.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.address.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "device address not set".to_string(),
            ));
        }
        if self.pool.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "pool.max_connections must be at least 1".to_string(),
            ));
        }
        self.transaction_config()
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        if self.protocol.subscribe_interval_ms < MIN_SUBSCRIBE_INTERVAL {
            return Err(ConfigError::ValidationError(format!(
                "protocol.subscribe_interval_ms must be at least {}",
                MIN_SUBSCRIBE_INTERVAL
            )));
        }

        for (alias, hex) in &self.blocks {
            if hex.parse::<Block>().is_err() {
                return Err(ConfigError::ValidationError(format!(
                    "block '{}' has invalid address '{}'",
                    alias, hex
                )));
            }
        }

        Ok(())
    }

    /// Returns the device address as `host:port`.
    pub fn device_addr(&self) -> String {
        with_default_port(self.device.address.trim(), self.device.port)
    }

    /// Resolves a block alias, or returns `name` unchanged if it isn't one.
    pub fn resolve_block<'a>(&'a self, name: &'a str) -> &'a str {
        self.blocks.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Returns the pool options for this device.
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions::new(self.device_addr())
            .with_connect_timeout(self.pool.connect_timeout())
            .with_idle_ttl(self.pool.idle_ttl())
            .with_reuse_delay(self.pool.reuse_delay())
            .with_max_connections(self.pool.max_connections)
            .with_max_frame_size(self.pool.max_frame_size)
    }

    /// Returns the transaction timeouts.
    pub fn transaction_config(&self) -> TransactionConfig {
        TransactionConfig {
            overall_timeout: Duration::from_millis(self.timeouts.overall_ms),
            write_timeout: Duration::from_millis(self.timeouts.write_ms),
            read_timeout: Duration::from_millis(self.timeouts.read_ms),
        }
    }
}

/// Device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Host name or IP address. May carry its own port.
    pub address: String,
    /// Port used when `address` has none.
    pub port: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: DEFAULT_PORT,
        }
    }
}

impl DeviceConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(address) = var("LONDON_ADDRESS") {
            if !address.is_empty() {
                self.address = address;
            }
        }

        if let Some(port) = var("LONDON_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Idle connections are closed after this many seconds.
    pub idle_ttl_secs: u64,
    /// Pause before a returned connection is reused, in milliseconds.
    pub reuse_delay_ms: u64,
    /// Maximum connections to the device at once.
    pub max_connections: usize,
    /// Largest response accepted, in bytes.
    pub max_frame_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            idle_ttl_secs: 45,
            reuse_delay_ms: 400,
            max_connections: 1,
            max_frame_size: crate::connection::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn reuse_delay(&self) -> Duration {
        Duration::from_millis(self.reuse_delay_ms)
    }
}

/// Transaction timeouts, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub overall_ms: u64,
    pub write_ms: u64,
    pub read_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            overall_ms: 5_000,
            write_ms: 3_000,
            read_ms: 3_000,
        }
    }
}

impl TimeoutConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(ms) = var("LONDON_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.overall_ms = ms;
        }
        if let Some(ms) = var("LONDON_WRITE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.write_ms = ms;
        }
        if let Some(ms) = var("LONDON_READ_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.read_ms = ms;
        }
    }
}

/// Protocol tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Interval requested in subscribe commands, in milliseconds.
    pub subscribe_interval_ms: u32,
    /// Added to the decoded volume level.
    pub volume_offset: i32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            subscribe_interval_ms: MIN_SUBSCRIBE_INTERVAL,
            volume_offset: DEVICE_VOLUME_OFFSET,
        }
    }
}

impl ProtocolConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(ms) = var("LONDON_SUBSCRIBE_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.subscribe_interval_ms = ms;
        }
        if let Some(offset) = var("LONDON_VOLUME_OFFSET").and_then(|v| v.parse().ok()) {
            self.volume_offset = offset;
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
