//! Runtime dispatch and lifecycle control
//!
//! This crate owns the sandbox side of the control plane: the lifecycle
//! state machine for every runtime slot, the pool manager that bin-packs
//! memory and orchestrates scale merges, the dispatch server that services
//! runtime-initiated channels, and the per-invocation bookkeeping that
//! guarantees exactly one completion per request.

pub mod demux;
pub mod dispatch;
pub mod error;
pub mod logstore;
pub mod manager;
pub mod protocol;
pub mod request;
pub mod runtime;
pub mod state;
pub mod stream;

pub use dispatch::Dispatcher;
pub use error::{Result, RtctrlError};
pub use logstore::{LogSource, LogStatStore, LogStoreIndex, RuntimeLogStores};
pub use manager::{
    ManagerOptions, OccupiedRuntime, OccupyInput, ResourceLedger, RuntimeManager,
    ScaleDownRecommendation, ScaleUpRecommendation,
};
pub use protocol::{FrameDecoder, InvocationFrame, ResponseFrame};
pub use request::{RequestInfo, RequestOutcome, RequestStatus, RequestTiming, LOG_DRAIN_GRACE};
pub use runtime::{RuntimeDescription, RuntimeInfo};
pub use state::{CasOp, OccupyParams, RuntimeState};
pub use stream::{invoke_stream, runtime_socket_path, StreamRequest, StreamResponse};
