use thiserror::Error;

/// Errors from metadata resolution
#[derive(Debug, Error)]
pub enum MetaError {
    /// No record of this kind under this key
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    /// The backing metadata service failed
    #[error("metadata backend error: {0}")]
    Backend(String),

    #[error("metadata decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T, E = MetaError> = std::result::Result<T, E>;
