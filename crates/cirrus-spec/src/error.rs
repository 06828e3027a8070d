//! Error types for the spec crate

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when parsing or validating configuration
#[derive(Debug, Error)]
pub enum SpecError {
    /// YAML parsing error
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Semantic validation error
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// IO error when reading a config file
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
