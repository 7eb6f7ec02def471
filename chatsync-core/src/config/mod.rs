//! Configuration for the sync engine
//!
//! Layering is defaults, then an optional TOML file, then environment
//! variables named `CHATSYNC_<SECTION>_<KEY>`. Durations are written in
//! humantime form (`"2s"`, `"500ms"`) in files.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Channel sizes and timeouts of the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Capacity of each subscription channel
    pub source_buffer: usize,

    /// Capacity of the merged event channel feeding a handle's worker
    pub merged_buffer: usize,

    /// Capacity of a handle's command channel
    pub command_buffer: usize,

    /// How long `close` waits for the worker before aborting it
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    pub json_format: bool,
    pub with_timestamp: bool,
    pub with_target: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Register metric descriptions at startup
    pub enabled: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_buffer: 256,
            merged_buffer: 1024,
            command_buffer: 64,
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Defaults overridden by `CHATSYNC_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_vars(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_vars(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from a variable lookup
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CHATSYNC_SYNC_SOURCE_BUFFER") {
            self.sync.source_buffer = parse_var("CHATSYNC_SYNC_SOURCE_BUFFER", &v)?;
        }
        if let Some(v) = lookup("CHATSYNC_SYNC_MERGED_BUFFER") {
            self.sync.merged_buffer = parse_var("CHATSYNC_SYNC_MERGED_BUFFER", &v)?;
        }
        if let Some(v) = lookup("CHATSYNC_SYNC_COMMAND_BUFFER") {
            self.sync.command_buffer = parse_var("CHATSYNC_SYNC_COMMAND_BUFFER", &v)?;
        }
        if let Some(v) = lookup("CHATSYNC_SYNC_CLOSE_TIMEOUT_MS") {
            let millis: u64 = parse_var("CHATSYNC_SYNC_CLOSE_TIMEOUT_MS", &v)?;
            self.sync.close_timeout = Duration::from_millis(millis);
        }

        if let Some(v) = lookup("CHATSYNC_LOG_LEVEL") {
            self.logging.level = v.to_lowercase();
        }
        if let Some(v) = lookup("CHATSYNC_LOG_JSON") {
            self.logging.json_format = parse_var("CHATSYNC_LOG_JSON", &v)?;
        }

        if let Some(v) = lookup("CHATSYNC_METRICS_ENABLED") {
            self.metrics.enabled = parse_var("CHATSYNC_METRICS_ENABLED", &v)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("source_buffer", self.sync.source_buffer),
            ("merged_buffer", self.sync.merged_buffer),
            ("command_buffer", self.sync.command_buffer),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.sync.close_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "close_timeout must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::InvalidValue(format!("{}={}: {}", name, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.close_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.sync.merged_buffer = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.sync.close_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_vars() {
        let vars: HashMap<&str, &str> = [
            ("CHATSYNC_SYNC_SOURCE_BUFFER", "8"),
            ("CHATSYNC_SYNC_CLOSE_TIMEOUT_MS", "250"),
            ("CHATSYNC_LOG_LEVEL", "DEBUG"),
            ("CHATSYNC_LOG_JSON", "true"),
            ("CHATSYNC_METRICS_ENABLED", "false"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.sync.source_buffer, 8);
        assert_eq!(config.sync.close_timeout, Duration::from_millis(250));
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
        assert!(!config.metrics.enabled);
        assert_eq!(config.sync.merged_buffer, SyncConfig::default().merged_buffer);
    }

    #[test]
    fn test_apply_vars_rejects_garbage() {
        let mut config = Config::default();
        let err = config
            .apply_vars(|name| (name == "CHATSYNC_SYNC_COMMAND_BUFFER").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chatsync.toml");

        let mut config = Config::default();
        config.sync.close_timeout = Duration::from_millis(1500);
        config.logging.level = "warn".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[sync]\nclose_timeout = \"750ms\"\n").unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.sync.close_timeout, Duration::from_millis(750));
        assert_eq!(loaded.sync.source_buffer, 256);
        assert_eq!(loaded.logging, LoggingConfig::default());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/chatsync.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileReadError(_)));
    }
}
