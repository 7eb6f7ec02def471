use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoggingError {
    /// A global subscriber is already installed, or the filter was rejected
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    #[error("Unknown log level: {0}")]
    UnknownLevel(String),
}
