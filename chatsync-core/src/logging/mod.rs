//! Logging setup
//!
//! Everything in the crate logs through `tracing` with structured fields.
//! Binaries install a subscriber once with [`init_logging_with_config`];
//! `RUST_LOG`, when set, overrides the configured level.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

mod error;
mod level;

pub use error::LoggingError;
pub use level::LogLevel;

use crate::config::LoggingConfig;

/// Output options for the global subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LogLevel,
    pub with_timestamp: bool,
    pub with_target: bool,
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_timestamp: true,
            with_target: true,
            json_format: false,
        }
    }
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Build from the `[logging]` section of the configuration file
    pub fn from_settings(settings: &LoggingConfig) -> Result<Self, LoggingError> {
        Ok(Self {
            level: settings.level.parse()?,
            with_timestamp: settings.with_timestamp,
            with_target: settings.with_target,
            json_format: settings.json_format,
        })
    }

    pub fn with_timestamp(mut self, enabled: bool) -> Self {
        self.with_timestamp = enabled;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn json_format(mut self, enabled: bool) -> Self {
        self.json_format = enabled;
        self
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let layer = fmt::layer().with_target(self.with_target);
        match (self.json_format, self.with_timestamp) {
            (true, true) => layer.json().boxed(),
            (true, false) => layer.json().without_time().boxed(),
            (false, true) => layer.boxed(),
            (false, false) => layer.without_time().boxed(),
        }
    }
}

/// Install the global subscriber with default options
pub fn init_logging() -> Result<(), LoggingError> {
    init_logging_with_config(LogConfig::default())
}

/// Install the global subscriber.
///
/// # Example
/// ```no_run
/// use chatsync_core::logging::{init_logging_with_config, LogConfig, LogLevel};
///
/// let config = LogConfig::new(LogLevel::Debug).with_target(false);
/// init_logging_with_config(config).expect("logging already initialized");
/// ```
pub fn init_logging_with_config(config: LogConfig) -> Result<(), LoggingError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(env_filter)
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))
}
