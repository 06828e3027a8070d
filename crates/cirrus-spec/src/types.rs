//! Function and runtime metadata types
//!
//! These are the records the controller receives from the function metadata
//! store and hands to the runtime dispatch layer.

use serde::{Deserialize, Serialize};

/// Bytes in one mebibyte; function memory sizes are configured in MB.
pub const BYTES_PER_MB: i64 = 1024 * 1024;

/// A resource quantity (memory plus CPU shares)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Memory in bytes
    pub memory: i64,
    /// CPU in milli-cores
    pub milli_cpus: i64,
}

impl Resource {
    /// Create a resource from a memory size in MB, with proportional CPU
    pub fn from_memory_mb(memory_mb: i64, milli_cpus_per_mb: i64) -> Self {
        Self {
            memory: memory_mb * BYTES_PER_MB,
            milli_cpus: memory_mb * milli_cpus_per_mb,
        }
    }

    /// Saturating element-wise addition
    pub fn add(&self, other: &Resource) -> Resource {
        Resource {
            memory: self.memory.saturating_add(other.memory),
            milli_cpus: self.milli_cpus.saturating_add(other.milli_cpus),
        }
    }

    /// Element-wise subtraction, clamped at zero
    pub fn sub_clamped(&self, other: &Resource) -> Resource {
        Resource {
            memory: (self.memory - other.memory).max(0),
            milli_cpus: (self.milli_cpus - other.milli_cpus).max(0),
        }
    }

    /// True if both fields are zero
    pub fn is_zero(&self) -> bool {
        self.memory == 0 && self.milli_cpus == 0
    }
}

/// Function configuration as resolved from the metadata store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionConfig {
    /// Fully-qualified function resource name
    pub function_brn: String,
    /// Short function name
    pub function_name: String,
    /// Resolved version (qualifier or alias target)
    pub version: String,
    /// Identifies the code revision loaded into a sandbox
    pub commit_id: String,
    /// Owning account
    pub user_id: String,
    /// Configured memory size in MB
    pub memory_size: i64,
    /// Invocation timeout in seconds
    pub timeout: u64,
    /// Runtime name (e.g. "python3", "nodejs20")
    pub runtime: String,
    /// Entry point within the code bundle
    pub handler: String,
    /// Whether the sandbox accepts concurrent invocations
    #[serde(default)]
    pub concurrent_mode: bool,
    /// Maximum in-flight invocations per sandbox when concurrent
    #[serde(default = "default_concurrent_quota")]
    pub concurrent_quota: u32,
    /// Deliver the invocation over native HTTP passthrough instead of the
    /// JSON-framed generic protocol
    #[serde(default)]
    pub stream_mode: bool,
    /// Tail user logs into the invocation response
    #[serde(default)]
    pub log_tail: bool,
}

fn default_concurrent_quota() -> u32 {
    10
}

/// Alias record mapping an alias name to a concrete function version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasInfo {
    pub alias_brn: String,
    pub function_name: String,
    pub function_version: String,
}

/// Runtime binary description for a named language runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfiguration {
    /// Runtime name
    pub name: String,
    /// Path to the runtime bootstrap binary inside the sandbox
    pub bin: String,
    /// Arguments passed to the bootstrap
    #[serde(default)]
    pub args: Vec<String>,
}

/// What kind of event triggered an invocation; carried through to user logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    #[default]
    Generic,
    Http,
    Timer,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerType::Generic => write!(f, "generic"),
            TriggerType::Http => write!(f, "http"),
            TriggerType::Timer => write!(f, "timer"),
        }
    }
}

/// Per-invocation input assembled by the controller before dispatch
#[derive(Debug, Clone)]
pub struct InvokeInput {
    pub request_id: String,
    pub function: FunctionConfig,
    pub trigger: TriggerType,
    /// Raw event payload forwarded to the sandbox
    pub event_object: serde_json::Value,
    /// Base64-encoded client context, if the caller supplied one
    pub client_context: Option<String>,
}
