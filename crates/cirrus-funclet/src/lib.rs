//! Client for the funclet, the per-node sandbox agent.
//!
//! The controller never manipulates sandbox processes directly; it asks the
//! funclet over a node-local Unix socket to warm up, cool down, or recreate
//! sandboxes, and reads the node inventory from it at startup.

pub mod client;
pub mod error;
pub mod mock;
pub mod types;

pub use client::{FuncletClient, UdsFuncletClient, DEFAULT_CALL_TIMEOUT, WARM_UP_TIMEOUT};
pub use error::{FuncletError, Result};
pub use mock::{FuncletCall, MockFunclet};
pub use types::{CoolDownParams, FuncletAck, NodeInfo, RebornParams, RunnerInfo, WarmUpParams};
