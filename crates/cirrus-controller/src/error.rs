use cirrus_funclet::FuncletError;
use cirrus_meta::MetaError;
use cirrus_rtctrl::RtctrlError;
use thiserror::Error;

/// Errors surfaced by the invocation orchestration layer
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error(transparent)]
    Funclet(#[from] FuncletError),

    #[error(transparent)]
    Rtctrl(#[from] RtctrlError),

    /// The pool could not supply the memory or sandboxes for a cold start
    #[error("no capacity to start function {0}")]
    NoCapacity(String),

    /// The sandbox never connected back after a successful warm-up RPC
    #[error("runtime {0} did not become warm in time")]
    WarmUpTimeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;
