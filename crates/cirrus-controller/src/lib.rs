//! Invocation orchestration for the cirrus control plane.
//!
//! Ties the runtime pool, the funclet, and the metadata store together:
//! the [`Invoker`] drives individual invocations end to end, the
//! [`Reaper`] keeps the pool healthy in the background, and [`api`]
//! exposes the caller-facing HTTP surface.

pub mod api;
pub mod error;
pub mod invoker;
pub mod reaper;

pub use api::{router, ApiState};
pub use error::{ControllerError, Result};
pub use invoker::{InvokeResponse, Invoker, InvokerOptions};
pub use reaper::Reaper;
