//! Error types for observability

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize metrics: {0}")]
    MetricsInit(String),

    #[error("Log sink '{0}' is already registered")]
    DuplicateSink(String),

    #[error("Unknown log sink type '{0}'")]
    UnknownSink(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ObservabilityError>;
