//! Wire types shared with the funclet

use cirrus_spec::Resource;
use serde::{Deserialize, Serialize};

/// Node-level inventory reported by the funclet at startup and on resync
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub host_ip: String,
    pub capacity: Resource,
    pub allocatable: Resource,
    /// Sandbox slots the funclet currently supervises
    pub runtime_ids: Vec<String>,
}

/// One sandbox as the funclet sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerInfo {
    pub runtime_id: String,
    /// Runner process state as reported by the funclet, not the
    /// controller's lifecycle state
    pub running: bool,
    pub pid: Option<i32>,
}

/// Ask the funclet to load function code into an occupied sandbox,
/// consolidating the merged sandboxes' resources into the target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmUpParams {
    pub runtime_id: String,
    pub commit_id: String,
    pub user_id: String,
    pub function_name: String,
    pub version: String,
    pub runtime: String,
    pub handler: String,
    pub code_path: Option<String>,
    pub resource: Resource,
    pub stream_mode: bool,
    #[serde(default)]
    pub merged: Vec<String>,
    #[serde(default)]
    pub environment: Vec<(String, String)>,
}

/// Ask the funclet to stop a sandbox and hand back retrieved donors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoolDownParams {
    pub runtime_id: String,
    #[serde(default)]
    pub retrieved: Vec<String>,
}

/// Ask the funclet to destroy and recreate a defunct sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebornParams {
    pub runtime_id: String,
    #[serde(default)]
    pub retrieved: Vec<String>,
}

/// Generic acknowledgement for mutating funclet calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuncletAck {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
