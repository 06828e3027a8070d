//! In-memory funclet for controller tests

use crate::error::{FuncletError, Result};
use crate::types::{
    CoolDownParams, FuncletAck, NodeInfo, RebornParams, RunnerInfo, WarmUpParams,
};
use crate::FuncletClient;
use async_trait::async_trait;
use cirrus_spec::Resource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Calls recorded by the mock, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FuncletCall {
    WarmUp { runtime_id: String, commit_id: String },
    CoolDown { runtime_id: String },
    Reborn { runtime_id: String },
}

/// A funclet stand-in that records calls and optionally fails warm-ups
pub struct MockFunclet {
    node: NodeInfo,
    calls: Mutex<Vec<FuncletCall>>,
    fail_warm_up: AtomicBool,
}

impl MockFunclet {
    pub fn new(runtime_ids: Vec<String>) -> Self {
        Self {
            node: NodeInfo {
                node_id: "mock-node".to_string(),
                host_ip: "127.0.0.1".to_string(),
                capacity: Resource::from_memory_mb(2048, 10),
                allocatable: Resource::from_memory_mb(2048, 10),
                runtime_ids,
            },
            calls: Mutex::new(Vec::new()),
            fail_warm_up: AtomicBool::new(false),
        }
    }

    /// Make every subsequent warm-up call fail
    pub fn fail_warm_ups(&self) {
        self.fail_warm_up.store(true, Ordering::Release);
    }

    pub fn calls(&self) -> Vec<FuncletCall> {
        self.calls.lock().expect("mock lock poisoned").clone()
    }

    fn record(&self, call: FuncletCall) {
        self.calls.lock().expect("mock lock poisoned").push(call);
    }
}

#[async_trait]
impl FuncletClient for MockFunclet {
    async fn node_info(&self) -> Result<NodeInfo> {
        Ok(self.node.clone())
    }

    async fn list_runtimes(&self) -> Result<Vec<RunnerInfo>> {
        Ok(self
            .node
            .runtime_ids
            .iter()
            .map(|id| RunnerInfo {
                runtime_id: id.clone(),
                running: true,
                pid: Some(1),
            })
            .collect())
    }

    async fn runtime_info(&self, runtime_id: &str) -> Result<RunnerInfo> {
        if self.node.runtime_ids.iter().any(|id| id == runtime_id) {
            Ok(RunnerInfo {
                runtime_id: runtime_id.to_string(),
                running: true,
                pid: Some(1),
            })
        } else {
            Err(FuncletError::Status {
                status: 404,
                body: format!("no such runtime {runtime_id}"),
            })
        }
    }

    async fn warm_up(&self, params: &WarmUpParams) -> Result<FuncletAck> {
        self.record(FuncletCall::WarmUp {
            runtime_id: params.runtime_id.clone(),
            commit_id: params.commit_id.clone(),
        });
        if self.fail_warm_up.load(Ordering::Acquire) {
            return Err(FuncletError::Status {
                status: 500,
                body: "code pull failed".to_string(),
            });
        }
        Ok(FuncletAck {
            ok: true,
            message: None,
        })
    }

    async fn cool_down(&self, params: &CoolDownParams) -> Result<FuncletAck> {
        self.record(FuncletCall::CoolDown {
            runtime_id: params.runtime_id.clone(),
        });
        Ok(FuncletAck {
            ok: true,
            message: None,
        })
    }

    async fn reborn(&self, params: &RebornParams) -> Result<FuncletAck> {
        self.record(FuncletCall::Reborn {
            runtime_id: params.runtime_id.clone(),
        });
        Ok(FuncletAck {
            ok: true,
            message: None,
        })
    }
}
