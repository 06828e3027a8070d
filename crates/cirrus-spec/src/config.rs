//! Controller configuration
//!
//! Loaded from a YAML file at daemon startup; every field has a code default
//! so a minimal file (or none at all) still yields a runnable controller.

use crate::SpecError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

mod duration {
    use humantime::format_duration;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let s: String = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(|e| D::Error::custom(format!("invalid duration: {}", e)))
    }
}

/// Top-level controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CirrusConfig {
    /// Listen address for the controller HTTP API
    #[serde(default = "default_api_listen")]
    pub api_listen: String,

    /// Listen address for the sandbox-facing dispatch server
    #[serde(default = "default_dispatch_listen")]
    pub dispatch_listen: String,

    /// Unix socket path of the local node agent (funclet)
    #[serde(default = "default_funclet_socket")]
    pub funclet_socket: PathBuf,

    /// Directory holding per-sandbox stream-mode sockets
    #[serde(default = "default_runtime_socket_dir")]
    pub runtime_socket_dir: PathBuf,

    /// Bin-packing unit in MB; oversized functions merge multiple sandboxes
    #[serde(default = "default_base_memory_mb")]
    pub base_memory_mb: i64,

    /// CPU shares granted per MB of memory
    #[serde(default = "default_milli_cpus_per_mb")]
    pub milli_cpus_per_mb: i64,

    /// How long a warm runtime may sit idle before cooldown
    #[serde(with = "duration", default = "default_max_runtime_idle")]
    pub max_runtime_idle: Duration,

    /// How long a runner may miss liveness before the runtime is reset
    #[serde(with = "duration", default = "default_max_runner_defunct")]
    pub max_runner_defunct: Duration,

    /// Minimum spacing between retrieve operations on one runtime
    #[serde(with = "duration", default = "default_max_runner_reset_timeout")]
    pub max_runner_reset_timeout: Duration,

    /// Interval between reaper passes (cooldown + reset)
    #[serde(with = "duration", default = "default_reaper_interval")]
    pub reaper_interval: Duration,

    /// Default invocation timeout when the function does not set one
    #[serde(with = "duration", default = "default_invoke_timeout")]
    pub default_invoke_timeout: Duration,

    /// TTL for cached function metadata
    #[serde(with = "duration", default = "default_function_cache_ttl")]
    pub function_cache_ttl: Duration,

    /// TTL for cached alias records
    #[serde(with = "duration", default = "default_alias_cache_ttl")]
    pub alias_cache_ttl: Duration,

    /// User-log sink type ("plain" or "json")
    #[serde(default = "default_log_sink")]
    pub log_sink: String,

    /// Directory for per-invocation log files; unset disables file capture
    #[serde(default)]
    pub invocation_log_dir: Option<PathBuf>,
}

fn default_api_listen() -> String {
    "0.0.0.0:6100".to_string()
}

fn default_dispatch_listen() -> String {
    "0.0.0.0:6200".to_string()
}

fn default_funclet_socket() -> PathBuf {
    PathBuf::from("/var/run/faas/.funclet.sock")
}

fn default_runtime_socket_dir() -> PathBuf {
    PathBuf::from("/var/run/faas")
}

fn default_base_memory_mb() -> i64 {
    128
}

fn default_milli_cpus_per_mb() -> i64 {
    10
}

fn default_max_runtime_idle() -> Duration {
    Duration::from_secs(600)
}

fn default_max_runner_defunct() -> Duration {
    Duration::from_secs(120)
}

fn default_max_runner_reset_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_invoke_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_function_cache_ttl() -> Duration {
    Duration::from_secs(600)
}

fn default_alias_cache_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_log_sink() -> String {
    "plain".to_string()
}

impl Default for CirrusConfig {
    fn default() -> Self {
        // serde defaults and Default must agree; an empty YAML map is the
        // canonical default config
        serde_yaml::from_str("{}").expect("default config must deserialize")
    }
}

impl CirrusConfig {
    /// Cross-field validation beyond what serde can express
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.base_memory_mb <= 0 {
            return Err(SpecError::Validation(
                "base_memory_mb must be positive".to_string(),
            ));
        }
        if self.milli_cpus_per_mb < 0 {
            return Err(SpecError::Validation(
                "milli_cpus_per_mb must not be negative".to_string(),
            ));
        }
        if self.max_runtime_idle.is_zero() {
            return Err(SpecError::Validation(
                "max_runtime_idle must not be zero".to_string(),
            ));
        }
        Ok(())
    }
}
