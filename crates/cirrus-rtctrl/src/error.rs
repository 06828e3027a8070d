//! Runtime control errors
//!
//! State-mismatch and match errors are routine CAS rejections: callers move
//! on to the next candidate runtime and nothing is logged as a failure.
//! Resource and transport errors are real faults and are surfaced.

use crate::state::RuntimeState;
use thiserror::Error;

/// Errors from the runtime dispatch and lifecycle layer
#[derive(Debug, Error)]
pub enum RtctrlError {
    /// CAS precondition failed on the runtime's lifecycle state
    #[error("runtime {runtime_id} state {current_state} does not match expected {expected_states:?}")]
    RuntimeStateUnmatched {
        runtime_id: String,
        current_state: RuntimeState,
        expected_states: Vec<RuntimeState>,
    },

    /// Runtime exists but cannot take this request (commit mismatch, quota
    /// exhausted, abnormal, deadline not reached)
    #[error("runtime {runtime_id} does not match: {reason}")]
    RuntimeMatch { runtime_id: String, reason: String },

    /// Concurrency released more times than it was acquired
    #[error("{reason}")]
    RuntimeRelease { runtime_id: String, reason: String },

    /// No runtime with this ID in the pool
    #[error("runtime {runtime_id} not found")]
    RuntimeNotFound { runtime_id: String },

    /// Not enough allocatable memory to mark the requested amount
    #[error("insufficient resource: requested {requested} bytes, available {available} bytes")]
    InsufficientResource { requested: i64, available: i64 },

    /// The generic-mode request channel is full
    #[error("runtime {runtime_id} request queue is full")]
    QueueFull { runtime_id: String },

    /// The runtime has no bound connection to send on
    #[error("runtime {runtime_id} is not connected")]
    NotConnected { runtime_id: String },

    /// Connection-level failure to or from a sandbox
    #[error("transport error on runtime {runtime_id}: {reason}")]
    Transport { runtime_id: String, reason: String },

    /// Stream-mode invocation was canceled by the upstream timeout
    #[error("stream invocation canceled for request {request_id}")]
    Canceled { request_id: String },

    /// Stream-mode retries exhausted their deadline
    #[error("stream invocation deadline elapsed for request {request_id}")]
    RetryDeadline { request_id: String },

    /// Frame decode failure on a sandbox connection
    #[error("frame decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = RtctrlError> = std::result::Result<T, E>;

impl RtctrlError {
    /// True for routine CAS rejections that callers recover from locally
    pub fn is_state_mismatch(&self) -> bool {
        matches!(
            self,
            RtctrlError::RuntimeStateUnmatched { .. } | RtctrlError::RuntimeMatch { .. }
        )
    }
}
