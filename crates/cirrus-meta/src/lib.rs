//! Function metadata resolution for the cirrus control plane.

pub mod error;
pub mod store;

pub use error::{MetaError, Result};
pub use store::{
    CachedFunctionStore, FunctionStore, MetaBackend, StaticBackend, DEFAULT_ALIAS_CACHE_TTL,
    DEFAULT_CACHE_TTL,
};
