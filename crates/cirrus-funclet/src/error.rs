use thiserror::Error;

/// Errors from funclet RPCs
#[derive(Debug, Error)]
pub enum FuncletError {
    /// Could not reach the funclet socket or the connection broke mid-call
    #[error("funclet transport error: {0}")]
    Transport(String),

    /// The funclet answered with a non-success status
    #[error("funclet returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The RPC did not complete within its timeout
    #[error("funclet call {call} timed out after {timeout_ms}ms")]
    Timeout { call: &'static str, timeout_ms: u64 },

    #[error("funclet response decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = FuncletError> = std::result::Result<T, E>;
