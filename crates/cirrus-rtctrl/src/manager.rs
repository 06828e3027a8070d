//! Runtime pool management and allocation
//!
//! The manager owns every `RuntimeInfo`, performs memory bin-packing for
//! cold starts, orchestrates merge/retrieve scale operations across
//! sandboxes, and keeps the cluster resource ledger. Cross-runtime
//! coordination never takes two locks at once: scale operations CAS each
//! target sequentially and roll back on partial failure.

use crate::error::{Result, RtctrlError};
use crate::runtime::{RuntimeDescription, RuntimeInfo};
use crate::state::{CasOp, OccupyParams, RuntimeState};
use cirrus_spec::{Resource, BYTES_PER_MB};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Tunables for the manager; defaults match the controller config defaults
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub base_memory_mb: i64,
    pub milli_cpus_per_mb: i64,
    pub max_runtime_idle: Duration,
    pub max_runner_defunct: Duration,
    pub max_runner_reset_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            base_memory_mb: 128,
            milli_cpus_per_mb: 10,
            max_runtime_idle: Duration::from_secs(600),
            max_runner_defunct: Duration::from_secs(120),
            max_runner_reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Cluster-wide resource accounting
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResourceLedger {
    /// Total node capacity reported by the node agent
    pub capacity: Resource,
    /// Capacity minus system reservation; the allocation ceiling
    pub allocatable: Resource,
    /// Default per-sandbox resource grant
    pub default_runtime: Resource,
    /// Reserved for in-progress occupations, not yet confirmed warm
    pub marked: Resource,
    /// Confirmed in use by warm runtimes
    pub used: Resource,
}

/// Allocation request for a cold start
#[derive(Debug, Clone)]
pub struct OccupyInput {
    pub commit_id: String,
    pub user_id: String,
    pub memory_mb: i64,
    pub stream_mode: bool,
    pub concurrent_mode: bool,
    pub concurrent_quota: u32,
}

/// Scale-up plan forwarded to the node agent so it can physically
/// consolidate the merged sandboxes' resources into the target
#[derive(Debug, Clone, Serialize)]
pub struct ScaleUpRecommendation {
    pub target: String,
    pub merged: Vec<String>,
    pub resource: Resource,
}

/// Scale-down report: only the runtimes actually retrieved are listed
#[derive(Debug, Clone, Serialize)]
pub struct ScaleDownRecommendation {
    pub target: String,
    pub retrieved: Vec<String>,
}

/// A successful cold-start allocation
pub struct OccupiedRuntime {
    pub runtime: Arc<RuntimeInfo>,
    pub merged: Vec<Arc<RuntimeInfo>>,
    /// Present only when the request spanned multiple base-memory units
    pub recommendation: Option<ScaleUpRecommendation>,
}

/// The pool of sandbox runtimes plus the resource ledger
pub struct RuntimeManager {
    options: ManagerOptions,
    runtimes: DashMap<String, Arc<RuntimeInfo>>,
    ledger: RwLock<ResourceLedger>,
}

impl RuntimeManager {
    pub fn new(options: ManagerOptions) -> Self {
        Self {
            options,
            runtimes: DashMap::new(),
            ledger: RwLock::new(ResourceLedger::default()),
        }
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Record node capacity reported by the node agent
    pub fn update_capacity(&self, capacity: Resource, allocatable: Resource) {
        let mut ledger = self.write_ledger();
        ledger.capacity = capacity;
        ledger.allocatable = allocatable;
        ledger.default_runtime =
            Resource::from_memory_mb(self.options.base_memory_mb, self.options.milli_cpus_per_mb);
    }

    /// Register sandboxes reported by the node agent and bring them into
    /// allocation as Cold
    pub fn init_runtime_list<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in ids {
            let id = id.into();
            let runtime = self
                .runtimes
                .entry(id.clone())
                .or_insert_with(|| RuntimeInfo::new(id.clone()))
                .clone();
            if let Err(e) = runtime.activate() {
                debug!(runtime_id = %id, error = %e, "runtime not activated");
            }
        }
    }

    /// Reconcile the pool against the node agent's sandbox inventory:
    /// ids not yet tracked are added and activated, slots the agent no
    /// longer reports are dropped
    pub fn sync_runtimes<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let reported: HashSet<String> = ids.into_iter().map(Into::into).collect();
        let stale: Vec<String> = self
            .runtimes
            .iter()
            .filter(|entry| !reported.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for id in stale {
            debug!(runtime_id = %id, "sandbox no longer reported, dropping slot");
            self.runtimes.remove(&id);
        }
        self.init_runtime_list(reported);
    }

    /// Track a newly-reported sandbox without activating it
    pub fn add_runtime(&self, id: impl Into<String>) -> Arc<RuntimeInfo> {
        let id = id.into();
        self.runtimes
            .entry(id.clone())
            .or_insert_with(|| RuntimeInfo::new(id))
            .clone()
    }

    pub fn get(&self, runtime_id: &str) -> Option<Arc<RuntimeInfo>> {
        self.runtimes.get(runtime_id).map(|r| r.clone())
    }

    /// Drop a slot entirely (sandbox teardown)
    pub fn remove(&self, runtime_id: &str) {
        self.runtimes.remove(runtime_id);
    }

    pub fn len(&self) -> usize {
        self.runtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }

    /// Best-effort single pass over the pool binding one more invocation to
    /// a runtime already loaded with this commit. No ordering or balancing
    /// guarantee beyond pool iteration order.
    pub fn find_warm_runtime(&self, commit_id: &str) -> Option<Arc<RuntimeInfo>> {
        let mark = CasOp::Mark {
            commit_id: commit_id.to_string(),
        };
        for entry in self.runtimes.iter() {
            if entry.value().cas(&mark).is_ok() {
                return Some(entry.value().clone());
            }
        }
        None
    }

    /// Reserve memory and occupy one Cold runtime, merging additional Cold
    /// runtimes when the request spans multiple base-memory units.
    ///
    /// Returns `Ok(None)` when the pool cannot satisfy the request; in that
    /// case every partial occupation and the memory reservation have been
    /// rolled back.
    pub fn occupy_cold_runtime(&self, input: &OccupyInput) -> Result<Option<OccupiedRuntime>> {
        let resource =
            Resource::from_memory_mb(input.memory_mb, self.options.milli_cpus_per_mb);
        match self.check_and_mark_resource(&resource) {
            Ok(()) => {}
            Err(RtctrlError::InsufficientResource {
                requested,
                available,
            }) => {
                debug!(requested, available, "insufficient memory for cold start");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let base_bytes = self.options.base_memory_mb * BYTES_PER_MB;
        let scale_count = ((resource.memory + base_bytes - 1) / base_bytes - 1).max(0) as usize;

        let occupy = CasOp::Occupy(OccupyParams {
            commit_id: input.commit_id.clone(),
            user_id: input.user_id.clone(),
            resource,
            stream_mode: input.stream_mode,
            concurrent_mode: input.concurrent_mode,
            concurrent_quota: input.concurrent_quota,
        });

        let mut target = None;
        for entry in self.runtimes.iter() {
            if entry.value().cas(&occupy).is_ok() {
                target = Some(entry.value().clone());
                break;
            }
        }
        let Some(target) = target else {
            self.release_marked_resource(&resource);
            return Ok(None);
        };

        if scale_count == 0 {
            return Ok(Some(OccupiedRuntime {
                runtime: target,
                merged: Vec::new(),
                recommendation: None,
            }));
        }

        // Oversized request: donate scale_count more Cold sandboxes
        let merge = CasOp::Merge {
            commit_id: input.commit_id.clone(),
        };
        let mut merged = Vec::with_capacity(scale_count);
        for entry in self.runtimes.iter() {
            if merged.len() == scale_count {
                break;
            }
            if entry.key() == &target.runtime_id {
                continue;
            }
            if entry.value().cas(&merge).is_ok() {
                merged.push(entry.value().clone());
            }
        }

        if merged.len() < scale_count {
            debug!(
                commit_id = %input.commit_id,
                wanted = scale_count,
                got = merged.len(),
                "not enough cold runtimes to merge, rolling back"
            );
            self.rollback_occupation(&target, &merged, &input.commit_id, &resource);
            return Ok(None);
        }

        let recommendation = ScaleUpRecommendation {
            target: target.runtime_id.clone(),
            merged: merged.iter().map(|r| r.runtime_id.clone()).collect(),
            resource,
        };
        Ok(Some(OccupiedRuntime {
            runtime: target,
            merged,
            recommendation: Some(recommendation),
        }))
    }

    /// Undo a (possibly partial) occupation: CAS-rollback every affected
    /// runtime and release the memory reservation
    pub fn rollback_occupation(
        &self,
        target: &Arc<RuntimeInfo>,
        merged: &[Arc<RuntimeInfo>],
        commit_id: &str,
        resource: &Resource,
    ) {
        let rollback = CasOp::Rollback {
            commit_id: commit_id.to_string(),
        };
        for runtime in merged.iter().chain(std::iter::once(target)) {
            if let Err(e) = runtime.cas(&rollback) {
                warn!(runtime_id = %runtime.runtime_id, error = %e, "rollback failed");
            }
        }
        self.release_marked_resource(resource);
    }

    /// Begin idle cooldown for a warm runtime past its idle deadline.
    ///
    /// Returns `Ok(None)` when the runtime does not satisfy the Stop
    /// precondition. On success, donated sandboxes (for multi-unit
    /// runtimes) are retrieved best-effort: partial retrieval is reported
    /// in the recommendation, never rolled back.
    pub fn cool_down_runtime(&self, runtime_id: &str) -> Result<Option<ScaleDownRecommendation>> {
        let runtime = self.require(runtime_id)?;
        let now = Instant::now();
        let Some(idle_deadline) = now.checked_sub(self.options.max_runtime_idle) else {
            return Ok(None);
        };

        // Capture before Stop clears bindings
        let resource = runtime.resource();
        match runtime.cas_at(&CasOp::Stop { idle_deadline }, now) {
            Ok(()) => {}
            Err(e) if e.is_state_mismatch() => return Ok(None),
            Err(e) => return Err(e),
        }

        let retrieved = self.retrieve_runtimes(runtime_id, &resource, now);
        Ok(Some(ScaleDownRecommendation {
            target: runtime_id.to_string(),
            retrieved,
        }))
    }

    /// Reset a runtime whose supervising runner went defunct; the caller
    /// forwards the recommendation to the node agent for a reborn.
    pub fn reset_runtime(&self, runtime_id: &str) -> Result<Option<ScaleDownRecommendation>> {
        let runtime = self.require(runtime_id)?;
        let now = Instant::now();
        let Some(liveness_deadline) = now.checked_sub(self.options.max_runner_defunct) else {
            return Ok(None);
        };

        let resource = runtime.resource();
        match runtime.cas_at(&CasOp::Reset { liveness_deadline }, now) {
            Ok(()) => {}
            Err(e) if e.is_state_mismatch() => return Ok(None),
            Err(e) => return Err(e),
        }

        let retrieved = self.retrieve_runtimes(runtime_id, &resource, now);
        Ok(Some(ScaleDownRecommendation {
            target: runtime_id.to_string(),
            retrieved,
        }))
    }

    /// CAS-retrieve up to the runtime's donated sandbox count, excluding
    /// the target. Best effort; partial retrieval is reported, not rolled
    /// back.
    fn retrieve_runtimes(&self, target_id: &str, resource: &Resource, now: Instant) -> Vec<String> {
        let base_bytes = self.options.base_memory_mb * BYTES_PER_MB;
        let scale_count = if base_bytes > 0 && resource.memory > 0 {
            ((resource.memory + base_bytes - 1) / base_bytes - 1).max(0) as usize
        } else {
            0
        };
        if scale_count == 0 {
            return Vec::new();
        }

        let Some(reset_deadline) = now.checked_sub(self.options.max_runner_reset_timeout) else {
            return Vec::new();
        };
        let retrieve = CasOp::Retrieve { reset_deadline };

        let mut retrieved = Vec::with_capacity(scale_count);
        for entry in self.runtimes.iter() {
            if retrieved.len() == scale_count {
                break;
            }
            if entry.key() == target_id {
                continue;
            }
            if entry.value().cas_at(&retrieve, now).is_ok() {
                retrieved.push(entry.key().clone());
            }
        }
        retrieved
    }

    /// Reserve memory against `allocatable - marked`.
    ///
    /// Optimistic read then locked write: the read-lock check fails fast
    /// without blocking concurrent readers; the actual mutation is
    /// serialized under the write lock. Two concurrent marks can both pass
    /// the optimistic check; the transient over-mark is corrected by the
    /// release paths.
    pub fn check_and_mark_resource(&self, resource: &Resource) -> Result<()> {
        {
            let ledger = self.read_ledger();
            let available = ledger.allocatable.memory - ledger.marked.memory;
            if available < resource.memory {
                return Err(RtctrlError::InsufficientResource {
                    requested: resource.memory,
                    available,
                });
            }
        }
        let mut ledger = self.write_ledger();
        ledger.marked = ledger.marked.add(resource);
        Ok(())
    }

    /// Drop a reservation that never became used
    pub fn release_marked_resource(&self, resource: &Resource) {
        let mut ledger = self.write_ledger();
        if ledger.marked.memory < resource.memory {
            warn!(
                marked = ledger.marked.memory,
                releasing = resource.memory,
                "marked memory underflow, clamping"
            );
        }
        ledger.marked = ledger.marked.sub_clamped(resource);
    }

    /// Move a reservation into confirmed use once the sandbox is warm
    pub fn increase_used_resource(&self, resource: &Resource) {
        let mut ledger = self.write_ledger();
        ledger.used = ledger.used.add(resource);
        if ledger.marked.memory < resource.memory {
            warn!(
                marked = ledger.marked.memory,
                moving = resource.memory,
                "marked memory underflow on warm confirmation, clamping"
            );
        }
        ledger.marked = ledger.marked.sub_clamped(resource);
    }

    /// Return a warm runtime's resource after cooldown is confirmed
    pub fn release_used_resource(&self, resource: &Resource) {
        let mut ledger = self.write_ledger();
        if ledger.used.memory < resource.memory {
            warn!(
                used = ledger.used.memory,
                releasing = resource.memory,
                "used memory underflow, clamping"
            );
        }
        ledger.used = ledger.used.sub_clamped(resource);
    }

    /// Count this runtime's resource as used, exactly once per warm cycle
    pub fn confirm_runtime_warm(&self, runtime: &Arc<RuntimeInfo>) {
        if runtime.try_set_used() {
            self.increase_used_resource(&runtime.resource());
        }
    }

    /// Undo the used accounting when the runtime's connection closes
    pub fn confirm_runtime_closed(&self, runtime: &Arc<RuntimeInfo>) {
        if runtime.try_clear_used() {
            self.release_used_resource(&runtime.resource());
        }
    }

    pub fn resource_overview(&self) -> ResourceLedger {
        *self.read_ledger()
    }

    /// Snapshot every runtime for the listing API
    pub fn runtime_descriptions(&self) -> Vec<RuntimeDescription> {
        self.runtimes.iter().map(|e| e.value().describe()).collect()
    }

    /// Runtime count per lifecycle state, for metrics
    pub fn counts_by_state(&self) -> HashMap<RuntimeState, usize> {
        let mut counts = HashMap::new();
        for entry in self.runtimes.iter() {
            *counts.entry(entry.value().state()).or_insert(0) += 1;
        }
        counts
    }

    fn require(&self, runtime_id: &str) -> Result<Arc<RuntimeInfo>> {
        self.get(runtime_id).ok_or_else(|| RtctrlError::RuntimeNotFound {
            runtime_id: runtime_id.to_string(),
        })
    }

    fn read_ledger(&self) -> std::sync::RwLockReadGuard<'_, ResourceLedger> {
        self.ledger.read().expect("resource lock poisoned")
    }

    fn write_ledger(&self) -> std::sync::RwLockWriteGuard<'_, ResourceLedger> {
        self.ledger.write().expect("resource lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE_MB: i64 = 128;

    fn manager_with_pool(count: usize) -> RuntimeManager {
        let manager = RuntimeManager::new(ManagerOptions::default());
        manager.update_capacity(
            Resource::from_memory_mb(BASE_MB * 16, 10),
            Resource::from_memory_mb(BASE_MB * 16, 10),
        );
        manager.init_runtime_list((0..count).map(|i| format!("runtime-{i}")));
        manager
    }

    fn occupy_input(memory_mb: i64) -> OccupyInput {
        OccupyInput {
            commit_id: "commit-1".to_string(),
            user_id: "acct".to_string(),
            memory_mb,
            stream_mode: false,
            concurrent_mode: false,
            concurrent_quota: 1,
        }
    }

    #[test]
    fn test_occupy_single_unit_then_find_warm() {
        // One base unit occupies without a recommendation, and after
        // release the same runtime answers a warm lookup
        let manager = manager_with_pool(3);
        let occupied = manager
            .occupy_cold_runtime(&occupy_input(BASE_MB))
            .unwrap()
            .unwrap();
        assert!(occupied.recommendation.is_none());

        let occupied_id = occupied.runtime.runtime_id.clone();
        occupied.runtime.mark_warm();
        occupied.runtime.release().unwrap();

        let warm = manager.find_warm_runtime("commit-1").unwrap();
        assert_eq!(warm.runtime_id, occupied_id);
    }

    #[test]
    fn test_occupy_two_units_merges_one() {
        // 2x base memory on a 3-runtime pool merges exactly one donor
        let manager = manager_with_pool(3);
        let occupied = manager
            .occupy_cold_runtime(&occupy_input(2 * BASE_MB))
            .unwrap()
            .unwrap();
        let recommendation = occupied.recommendation.unwrap();
        assert_eq!(recommendation.merged.len(), 1);
        assert_eq!(recommendation.target, occupied.runtime.runtime_id);
        assert_eq!(occupied.runtime.state(), RuntimeState::WarmUp);
        assert_eq!(occupied.merged[0].state(), RuntimeState::Merged);
    }

    #[test]
    fn test_scale_shortfall_rolls_back_everything() {
        // k*base with fewer than k-1 cold runtimes available fails and
        // every partial merge returns to Cold
        let manager = manager_with_pool(2);
        let marked_before = manager.resource_overview().marked.memory;

        let result = manager
            .occupy_cold_runtime(&occupy_input(3 * BASE_MB))
            .unwrap();
        assert!(result.is_none());

        for description in manager.runtime_descriptions() {
            assert_eq!(description.state, RuntimeState::Cold);
        }
        // The reservation is fully released on failure
        assert_eq!(manager.resource_overview().marked.memory, marked_before);
    }

    #[test]
    fn test_insufficient_memory_fails_fast_and_conserves_marked() {
        let manager = RuntimeManager::new(ManagerOptions::default());
        manager.update_capacity(
            Resource::from_memory_mb(BASE_MB, 10),
            Resource::from_memory_mb(BASE_MB, 10),
        );
        manager.init_runtime_list(["runtime-0"]);

        let marked_before = manager.resource_overview().marked.memory;
        let result = manager
            .occupy_cold_runtime(&occupy_input(4 * BASE_MB))
            .unwrap();
        assert!(result.is_none());
        assert_eq!(manager.resource_overview().marked.memory, marked_before);
    }

    #[test]
    fn test_find_warm_requires_commit_match() {
        let manager = manager_with_pool(3);
        let occupied = manager
            .occupy_cold_runtime(&occupy_input(BASE_MB))
            .unwrap()
            .unwrap();
        occupied.runtime.mark_warm();
        occupied.runtime.release().unwrap();

        assert!(manager.find_warm_runtime("other-commit").is_none());
        assert!(manager.find_warm_runtime("commit-1").is_some());
    }

    #[test]
    fn test_cool_down_retrieves_merged_runtimes() {
        let manager = manager_with_pool(3);
        let occupied = manager
            .occupy_cold_runtime(&occupy_input(2 * BASE_MB))
            .unwrap()
            .unwrap();
        let target_id = occupied.runtime.runtime_id.clone();
        occupied.runtime.mark_warm();
        occupied.runtime.release().unwrap();

        // Not yet idle
        assert!(manager.cool_down_runtime(&target_id).unwrap().is_none());

        // Age the runtime and the donated sandbox past their deadlines
        let old = Instant::now() - Duration::from_secs(3600);
        occupied.runtime.set_last_access(old);
        occupied.merged[0].set_last_reset(old);

        let recommendation = manager.cool_down_runtime(&target_id).unwrap().unwrap();
        assert_eq!(recommendation.target, target_id);
        assert_eq!(recommendation.retrieved.len(), 1);
        assert_eq!(occupied.merged[0].state(), RuntimeState::Reclaiming);
        assert_eq!(occupied.runtime.state(), RuntimeState::Stopping);
    }

    #[test]
    fn test_reset_defunct_runtime() {
        let manager = manager_with_pool(2);
        let occupied = manager
            .occupy_cold_runtime(&occupy_input(BASE_MB))
            .unwrap()
            .unwrap();
        let target_id = occupied.runtime.runtime_id.clone();

        // Still in WarmUp with a stale liveness: defunct
        occupied
            .runtime
            .set_last_liveness(Instant::now() - Duration::from_secs(3600));
        let recommendation = manager.reset_runtime(&target_id).unwrap().unwrap();
        assert_eq!(recommendation.target, target_id);
        assert_eq!(occupied.runtime.commit_id(), None);
    }

    #[test]
    fn test_used_accounting_is_exactly_once() {
        let manager = manager_with_pool(1);
        let occupied = manager
            .occupy_cold_runtime(&occupy_input(BASE_MB))
            .unwrap()
            .unwrap();

        manager.confirm_runtime_warm(&occupied.runtime);
        manager.confirm_runtime_warm(&occupied.runtime);
        let overview = manager.resource_overview();
        assert_eq!(overview.used.memory, BASE_MB * BYTES_PER_MB);
        assert_eq!(overview.marked.memory, 0);

        manager.confirm_runtime_closed(&occupied.runtime);
        manager.confirm_runtime_closed(&occupied.runtime);
        assert_eq!(manager.resource_overview().used.memory, 0);
    }

    #[test]
    fn test_sync_runtimes_reconciles_pool() {
        let manager = manager_with_pool(3);

        manager.sync_runtimes(["runtime-1", "runtime-3"]);

        assert_eq!(manager.len(), 2);
        assert!(manager.get("runtime-0").is_none());
        assert!(manager.get("runtime-2").is_none());
        let added = manager.get("runtime-3").unwrap();
        assert_eq!(added.state(), RuntimeState::Cold);
        // A slot that survived the sync keeps its state
        assert_eq!(
            manager.get("runtime-1").unwrap().state(),
            RuntimeState::Cold
        );
    }
}
