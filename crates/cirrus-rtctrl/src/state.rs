//! Sandbox lifecycle states and CAS operations
//!
//! Each operation is a tagged variant carrying its parameters; the runtime
//! checks it twice (a lock-free fast check against atomic mirrors, then a
//! re-check under the invoke lock) before applying the transition.

use cirrus_spec::Resource;
use serde::Serialize;
use std::time::Instant;

/// Lifecycle state of one sandbox runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum RuntimeState {
    /// Empty sandbox awaiting assignment
    Cold = 0,
    /// Assigned; code is being loaded
    WarmUp = 1,
    /// Code loaded, ready to invoke
    Warm = 2,
    /// Resource donated to another runtime during scale-up
    Merged = 3,
    /// Donated resource being reclaimed during scale-down
    Reclaiming = 4,
    /// Idle cooldown in progress
    Stopping = 5,
    /// Cooldown confirmed by the node agent
    Stopped = 6,
    /// No usable sandbox process behind this slot
    Closed = 7,
}

impl RuntimeState {
    pub(crate) fn from_u8(value: u8) -> RuntimeState {
        match value {
            0 => RuntimeState::Cold,
            1 => RuntimeState::WarmUp,
            2 => RuntimeState::Warm,
            3 => RuntimeState::Merged,
            4 => RuntimeState::Reclaiming,
            5 => RuntimeState::Stopping,
            6 => RuntimeState::Stopped,
            _ => RuntimeState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeState::Cold => "cold",
            RuntimeState::WarmUp => "warmup",
            RuntimeState::Warm => "warm",
            RuntimeState::Merged => "merged",
            RuntimeState::Reclaiming => "reclaiming",
            RuntimeState::Stopping => "stopping",
            RuntimeState::Stopped => "stopped",
            RuntimeState::Closed => "closed",
        }
    }

    /// All states, for metrics enumeration
    pub fn all() -> [RuntimeState; 8] {
        [
            RuntimeState::Cold,
            RuntimeState::WarmUp,
            RuntimeState::Warm,
            RuntimeState::Merged,
            RuntimeState::Reclaiming,
            RuntimeState::Stopping,
            RuntimeState::Stopped,
            RuntimeState::Closed,
        ]
    }
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parameters for binding a sandbox to a function version
#[derive(Debug, Clone)]
pub struct OccupyParams {
    pub commit_id: String,
    pub user_id: String,
    pub resource: Resource,
    pub stream_mode: bool,
    pub concurrent_mode: bool,
    pub concurrent_quota: u32,
}

/// A compare-and-swap operation on a runtime's lifecycle state
#[derive(Debug, Clone)]
pub enum CasOp {
    /// Cold -> WarmUp: bind the runtime to a function version
    Occupy(OccupyParams),
    /// Cold -> Merged: donate this sandbox's resource to another runtime
    Merge { commit_id: String },
    /// {Merged, Reclaiming} -> Reclaiming: take the donated resource back
    Retrieve { reset_deadline: Instant },
    /// {WarmUp, Merged} -> Cold: undo a failed occupy/merge
    Rollback { commit_id: String },
    /// Bind one more invocation to an already-assigned runtime
    Mark { commit_id: String },
    /// Warm -> Stopping: begin idle cooldown
    Stop { idle_deadline: Instant },
    /// Clear bindings on a runtime whose runner went defunct; no state change
    Reset { liveness_deadline: Instant },
}

impl CasOp {
    /// States in which this operation may begin; used both for the fast
    /// check and for the error reported on rejection
    pub fn expected_states(&self) -> &'static [RuntimeState] {
        match self {
            CasOp::Occupy(_) | CasOp::Merge { .. } => &[RuntimeState::Cold],
            CasOp::Retrieve { .. } => &[RuntimeState::Merged, RuntimeState::Reclaiming],
            CasOp::Rollback { .. } => &[RuntimeState::WarmUp, RuntimeState::Merged],
            CasOp::Mark { .. } => &[RuntimeState::WarmUp, RuntimeState::Warm],
            CasOp::Stop { .. } => &[RuntimeState::Warm],
            CasOp::Reset { .. } => &[
                RuntimeState::WarmUp,
                RuntimeState::Stopping,
                RuntimeState::Stopped,
                RuntimeState::Closed,
            ],
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            CasOp::Occupy(_) => "occupy",
            CasOp::Merge { .. } => "merge",
            CasOp::Retrieve { .. } => "retrieve",
            CasOp::Rollback { .. } => "rollback",
            CasOp::Mark { .. } => "mark",
            CasOp::Stop { .. } => "stop",
            CasOp::Reset { .. } => "reset",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in RuntimeState::all() {
            assert_eq!(RuntimeState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_expected_states() {
        let op = CasOp::Mark {
            commit_id: "c1".to_string(),
        };
        assert_eq!(
            op.expected_states(),
            &[RuntimeState::WarmUp, RuntimeState::Warm]
        );
    }
}
