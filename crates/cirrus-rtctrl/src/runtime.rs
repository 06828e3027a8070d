//! Per-sandbox runtime records
//!
//! A `RuntimeInfo` tracks one sandbox process for its whole lifetime. All
//! lifecycle transitions go through [`RuntimeInfo::cas`], which checks the
//! operation twice: a lock-free fast check against atomic mirrors to shed
//! contention, then a re-check and apply under the invoke lock. The atomics
//! are mutated only while holding that lock, so the locked check is
//! authoritative.

use crate::error::{Result, RtctrlError};
use crate::protocol::InvocationFrame;
use crate::request::RequestInfo;
use crate::state::{CasOp, OccupyParams, RuntimeState};
use cirrus_spec::Resource;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Capacity of the generic-mode request channel; a full channel yields an
/// immediate queue-full error instead of blocking
pub const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// Mutable sandbox state guarded by the invoke lock
pub struct RuntimeCore {
    pub commit_id: Option<String>,
    pub user_id: Option<String>,
    pub resource: Resource,
    /// Memory for this runtime is reserved in the manager's ledger
    pub marked: bool,
    pub stream_mode: bool,
    pub default_concurrent_mode: bool,
    pub host_ip: Option<String>,
    pub last_access_time: Instant,
    pub last_liveness_time: Instant,
    pub last_reset_time: Instant,
    pub init_start_ms: i64,
    pub init_done_ms: i64,
}

/// Connection-scoped handles for a bound generic-mode sandbox
struct Transport {
    request_tx: mpsc::Sender<InvocationFrame>,
    stop_tx: watch::Sender<bool>,
}

/// One sandbox process tracked by the controller
pub struct RuntimeInfo {
    pub runtime_id: String,

    // Atomic mirrors for the lock-free fast check; written only under `core`
    state: AtomicU8,
    concurrency: AtomicU32,
    abnormal: AtomicBool,
    abnormal_times: AtomicU32,
    concurrent_mode: AtomicBool,
    concurrent_quota: AtomicU32,
    /// Runtime's resource has been counted into the manager's used ledger
    used: AtomicBool,

    core: Mutex<RuntimeCore>,
    transport: Mutex<Option<Transport>>,
    warm_tx: watch::Sender<bool>,

    /// In-flight invocations bound to this runtime
    pub(crate) requests: DashMap<String, Arc<RequestInfo>>,
}

/// Read-only snapshot for listings and logging
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeDescription {
    pub runtime_id: String,
    pub state: RuntimeState,
    pub concurrency: u32,
    pub abnormal: bool,
    pub commit_id: Option<String>,
    pub user_id: Option<String>,
    pub memory_bytes: i64,
    pub milli_cpus: i64,
    pub stream_mode: bool,
    pub in_flight: usize,
}

impl RuntimeInfo {
    pub fn new(runtime_id: impl Into<String>) -> Arc<Self> {
        let now = Instant::now();
        let (warm_tx, _) = watch::channel(false);
        Arc::new(Self {
            runtime_id: runtime_id.into(),
            state: AtomicU8::new(RuntimeState::Closed as u8),
            concurrency: AtomicU32::new(0),
            abnormal: AtomicBool::new(false),
            abnormal_times: AtomicU32::new(0),
            concurrent_mode: AtomicBool::new(false),
            concurrent_quota: AtomicU32::new(1),
            used: AtomicBool::new(false),
            core: Mutex::new(RuntimeCore {
                commit_id: None,
                user_id: None,
                resource: Resource::default(),
                marked: false,
                stream_mode: false,
                default_concurrent_mode: false,
                host_ip: None,
                last_access_time: now,
                last_liveness_time: now,
                last_reset_time: now,
                init_start_ms: 0,
                init_done_ms: 0,
            }),
            transport: Mutex::new(None),
            warm_tx,
            requests: DashMap::new(),
        })
    }

    pub fn state(&self) -> RuntimeState {
        RuntimeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn concurrency(&self) -> u32 {
        self.concurrency.load(Ordering::Acquire)
    }

    pub fn is_abnormal(&self) -> bool {
        self.abnormal.load(Ordering::Acquire)
    }

    pub fn abnormal_times(&self) -> u32 {
        self.abnormal_times.load(Ordering::Relaxed)
    }

    pub fn commit_id(&self) -> Option<String> {
        self.lock_core().commit_id.clone()
    }

    pub fn resource(&self) -> Resource {
        self.lock_core().resource
    }

    pub fn stream_mode(&self) -> bool {
        self.lock_core().stream_mode
    }

    pub fn is_concurrent_mode(&self) -> bool {
        self.concurrent_mode.load(Ordering::Acquire)
    }

    /// A runtime under an abnormal flag takes no new work
    pub fn available(&self) -> bool {
        !self.is_abnormal()
    }

    /// Mark this runtime unusable (e.g. after a failed warm-up RPC); it is
    /// excluded from allocation until the flag is cleared
    pub fn invalidate(&self) {
        self.abnormal.store(true, Ordering::Release);
        self.abnormal_times.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear_abnormal(&self) {
        self.abnormal.store(false, Ordering::Release);
    }

    fn lock_core(&self) -> MutexGuard<'_, RuntimeCore> {
        self.core.lock().expect("runtime invoke lock poisoned")
    }

    /// Apply a lifecycle CAS operation at the current instant
    pub fn cas(&self, op: &CasOp) -> Result<()> {
        self.cas_at(op, Instant::now())
    }

    /// Apply a lifecycle CAS operation, with the clock injected
    pub fn cas_at(&self, op: &CasOp, now: Instant) -> Result<()> {
        // Fast-path rejection without the lock
        self.check_fast(op)?;

        let mut core = self.lock_core();
        self.check_locked(&core, op)?;
        self.apply(&mut core, op, now);
        Ok(())
    }

    /// Lock-free precondition check against the atomic mirrors
    fn check_fast(&self, op: &CasOp) -> Result<()> {
        match op {
            // Reset's precondition is the defunct check, which needs the
            // liveness timestamp behind the lock
            CasOp::Reset { .. } => return Ok(()),
            _ => {
                let state = self.state();
                if !op.expected_states().contains(&state) {
                    return Err(self.state_unmatched(op, state));
                }
            }
        }

        match op {
            CasOp::Occupy(_) | CasOp::Merge { .. } | CasOp::Mark { .. } => {
                if !self.available() {
                    return Err(self.match_error("runtime is abnormal"));
                }
            }
            _ => {}
        }

        match op {
            CasOp::Mark { .. } => self.check_mark_quota()?,
            CasOp::Retrieve { .. } | CasOp::Stop { .. } => {
                if self.concurrency() != 0 {
                    return Err(self.match_error("runtime has in-flight invocations"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn check_mark_quota(&self) -> Result<()> {
        let concurrency = self.concurrency();
        if self.concurrent_mode.load(Ordering::Acquire) {
            let quota = self.concurrent_quota.load(Ordering::Acquire);
            if concurrency >= quota {
                return Err(self.match_error("concurrency quota exhausted"));
            }
        } else if concurrency != 0 {
            return Err(self.match_error("runtime is busy"));
        }
        Ok(())
    }

    /// Authoritative precondition check under the invoke lock
    fn check_locked(&self, core: &RuntimeCore, op: &CasOp) -> Result<()> {
        let state = self.state();

        match op {
            CasOp::Occupy(_) | CasOp::Merge { .. } => {
                if state != RuntimeState::Cold {
                    return Err(self.state_unmatched(op, state));
                }
                if !self.available() {
                    return Err(self.match_error("runtime is abnormal"));
                }
            }
            CasOp::Retrieve { reset_deadline } => {
                if !op.expected_states().contains(&state) {
                    return Err(self.state_unmatched(op, state));
                }
                if self.concurrency() != 0 {
                    return Err(self.match_error("runtime has in-flight invocations"));
                }
                if state == RuntimeState::Reclaiming && core.last_reset_time >= *reset_deadline {
                    return Err(self.match_error("retrieve deadline not yet reached"));
                }
            }
            CasOp::Rollback { commit_id } => {
                if !op.expected_states().contains(&state) {
                    return Err(self.state_unmatched(op, state));
                }
                if core.commit_id.as_deref() != Some(commit_id.as_str()) {
                    return Err(self.match_error("commit does not match"));
                }
            }
            CasOp::Mark { commit_id } => {
                if !op.expected_states().contains(&state) {
                    return Err(self.state_unmatched(op, state));
                }
                if !self.available() {
                    return Err(self.match_error("runtime is abnormal"));
                }
                if core.commit_id.as_deref() != Some(commit_id.as_str()) {
                    return Err(self.match_error("commit does not match"));
                }
                self.check_mark_quota()?;
            }
            CasOp::Stop { idle_deadline } => {
                if state != RuntimeState::Warm {
                    return Err(self.state_unmatched(op, state));
                }
                if self.concurrency() != 0 {
                    return Err(self.match_error("runtime has in-flight invocations"));
                }
                // Strict before: a runtime accessed exactly at the deadline
                // is not yet idle
                if core.last_access_time >= *idle_deadline {
                    return Err(self.match_error("idle deadline not yet reached"));
                }
            }
            CasOp::Reset { liveness_deadline } => {
                if !Self::runner_defunct(core, state, self.is_abnormal(), *liveness_deadline) {
                    return Err(self.match_error("runner is not defunct"));
                }
            }
        }
        Ok(())
    }

    fn apply(&self, core: &mut RuntimeCore, op: &CasOp, now: Instant) {
        match op {
            CasOp::Occupy(OccupyParams {
                commit_id,
                user_id,
                resource,
                stream_mode,
                concurrent_mode,
                concurrent_quota,
            }) => {
                self.set_state(RuntimeState::WarmUp);
                core.commit_id = Some(commit_id.clone());
                core.user_id = Some(user_id.clone());
                core.resource = *resource;
                core.marked = true;
                core.stream_mode = *stream_mode;
                core.last_access_time = now;
                self.concurrent_mode.store(*concurrent_mode, Ordering::Release);
                self.concurrent_quota
                    .store((*concurrent_quota).max(1), Ordering::Release);
                self.concurrency.store(1, Ordering::Release);
            }
            CasOp::Merge { commit_id } => {
                self.set_state(RuntimeState::Merged);
                core.commit_id = Some(commit_id.clone());
            }
            CasOp::Retrieve { .. } => {
                self.set_state(RuntimeState::Reclaiming);
                core.commit_id = None;
                core.user_id = None;
                core.last_reset_time = now;
                self.concurrency.store(0, Ordering::Release);
                self.concurrent_mode
                    .store(core.default_concurrent_mode, Ordering::Release);
            }
            CasOp::Rollback { .. } => {
                self.set_state(RuntimeState::Cold);
                core.commit_id = None;
                core.user_id = None;
                core.resource = Resource::default();
                core.marked = false;
                self.concurrency.store(0, Ordering::Release);
            }
            CasOp::Mark { .. } => {
                core.last_access_time = now;
                self.concurrency.fetch_add(1, Ordering::AcqRel);
            }
            CasOp::Stop { .. } => {
                self.set_state(RuntimeState::Stopping);
                core.commit_id = None;
                core.user_id = None;
                self.concurrency.store(0, Ordering::Release);
                if let Some(transport) = self
                    .transport
                    .lock()
                    .expect("transport lock poisoned")
                    .as_ref()
                {
                    let _ = transport.stop_tx.send(true);
                }
            }
            CasOp::Reset { .. } => {
                core.commit_id = None;
                core.user_id = None;
                core.last_reset_time = now;
                self.concurrency.store(0, Ordering::Release);
            }
        }
    }

    fn set_state(&self, state: RuntimeState) {
        self.state.store(state as u8, Ordering::Release);
        tracing::debug!(runtime_id = %self.runtime_id, state = %state, "runtime state changed");
    }

    fn runner_defunct(
        core: &RuntimeCore,
        state: RuntimeState,
        abnormal: bool,
        liveness_deadline: Instant,
    ) -> bool {
        if core.last_liveness_time >= liveness_deadline {
            return false;
        }
        // Warm runtimes are never defunct on liveness lag alone: killing a
        // sandbox mid-traffic on a missed heartbeat is worse than waiting
        abnormal
            || matches!(
                state,
                RuntimeState::WarmUp
                    | RuntimeState::Stopping
                    | RuntimeState::Stopped
                    | RuntimeState::Closed
            )
    }

    /// Whether the supervising runner has missed its liveness deadline
    pub fn is_runner_defunct(&self, now: Instant, max_defunct: Duration) -> bool {
        let core = self.lock_core();
        let Some(deadline) = now.checked_sub(max_defunct) else {
            return false;
        };
        Self::runner_defunct(&core, self.state(), self.is_abnormal(), deadline)
    }

    /// Unbind one invocation. Double release is a programmer error and is
    /// surfaced, not ignored.
    pub fn release(&self) -> Result<()> {
        let result = self
            .concurrency
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        match result {
            Ok(_) => Ok(()),
            Err(_) => Err(RtctrlError::RuntimeRelease {
                runtime_id: self.runtime_id.clone(),
                reason: "runtime concurrency has been 0".to_string(),
            }),
        }
    }

    /// Bring a Closed or Stopped slot back into allocation as Cold.
    /// Called when the node agent reports the sandbox ready.
    pub fn activate(&self) -> Result<()> {
        let mut core = self.lock_core();
        let state = self.state();
        if !matches!(state, RuntimeState::Closed | RuntimeState::Stopped) {
            return Err(self.state_unmatched_states(
                state,
                vec![RuntimeState::Closed, RuntimeState::Stopped],
            ));
        }
        self.set_state(RuntimeState::Cold);
        core.commit_id = None;
        core.user_id = None;
        core.resource = Resource::default();
        core.marked = false;
        core.last_liveness_time = Instant::now();
        self.concurrency.store(0, Ordering::Release);
        self.clear_abnormal();
        Ok(())
    }

    /// Tear down after the sandbox connection is lost. The slot takes no
    /// new work until the node agent reports the sandbox ready again.
    pub fn close(&self) {
        let mut core = self.lock_core();
        self.set_state(RuntimeState::Closed);
        core.commit_id = None;
        core.user_id = None;
        core.resource = Resource::default();
        core.marked = false;
        self.concurrency.store(0, Ordering::Release);
    }

    /// WarmUp -> Warm once the sandbox reports ready; broadcasts the warm
    /// signal to waiters. Returns whether this call made the transition.
    pub fn mark_warm(&self) -> bool {
        let _core = self.lock_core();
        if self.state() != RuntimeState::WarmUp {
            return false;
        }
        self.set_state(RuntimeState::Warm);
        let _ = self.warm_tx.send(true);
        true
    }

    /// Wait until the runtime reports warm, bounded by `timeout`
    pub async fn wait_warm(&self, timeout: Duration) -> bool {
        if self.state() == RuntimeState::Warm {
            return true;
        }
        let mut rx = self.warm_tx.subscribe();
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }

    /// Attach the generic-mode sender and stop channels for a newly-bound
    /// connection
    pub fn bind_transport(
        &self,
        request_tx: mpsc::Sender<InvocationFrame>,
        stop_tx: watch::Sender<bool>,
    ) {
        *self.transport.lock().expect("transport lock poisoned") = Some(Transport {
            request_tx,
            stop_tx,
        });
    }

    pub(crate) fn clear_transport(&self) {
        *self.transport.lock().expect("transport lock poisoned") = None;
        let _ = self.warm_tx.send(false);
    }

    /// Queue a generic-mode invocation frame for the sender task
    pub fn send_request(&self, frame: InvocationFrame) -> Result<()> {
        let transport = self.transport.lock().expect("transport lock poisoned");
        let Some(transport) = transport.as_ref() else {
            return Err(RtctrlError::NotConnected {
                runtime_id: self.runtime_id.clone(),
            });
        };
        transport.request_tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RtctrlError::QueueFull {
                runtime_id: self.runtime_id.clone(),
            },
            mpsc::error::TrySendError::Closed(_) => RtctrlError::NotConnected {
                runtime_id: self.runtime_id.clone(),
            },
        })
    }

    pub fn register_request(&self, request: Arc<RequestInfo>) {
        self.requests.insert(request.request_id.clone(), request);
    }

    pub fn remove_request(&self, request_id: &str) {
        self.requests.remove(request_id);
    }

    pub fn find_request(&self, request_id: &str) -> Option<Arc<RequestInfo>> {
        self.requests.get(request_id).map(|r| r.clone())
    }

    pub fn in_flight(&self) -> usize {
        self.requests.len()
    }

    /// Force-fail every outstanding request on this runtime; every
    /// RequestInfo always receives a terminal status
    pub fn fail_all_requests(&self, reason: &str) {
        for entry in self.requests.iter() {
            entry.value().invoke_result(
                crate::request::RequestStatus::Failed,
                None,
                Some(reason.to_string()),
            );
        }
    }

    /// First caller wins; the runtime's resource is counted into the used
    /// ledger exactly once per warm cycle
    pub(crate) fn try_set_used(&self) -> bool {
        !self.used.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn try_clear_used(&self) -> bool {
        self.used.swap(false, Ordering::AcqRel)
    }

    pub fn touch_liveness(&self) {
        self.lock_core().last_liveness_time = Instant::now();
    }

    pub fn set_last_access(&self, at: Instant) {
        self.lock_core().last_access_time = at;
    }

    pub fn set_last_liveness(&self, at: Instant) {
        self.lock_core().last_liveness_time = at;
    }

    pub fn set_last_reset(&self, at: Instant) {
        self.lock_core().last_reset_time = at;
    }

    pub fn set_host_ip(&self, ip: impl Into<String>) {
        self.lock_core().host_ip = Some(ip.into());
    }

    pub fn set_init_times(&self, start_ms: i64, done_ms: i64) {
        let mut core = self.lock_core();
        core.init_start_ms = start_ms;
        core.init_done_ms = done_ms;
    }

    pub fn init_times(&self) -> (i64, i64) {
        let core = self.lock_core();
        (core.init_start_ms, core.init_done_ms)
    }

    pub fn describe(&self) -> RuntimeDescription {
        let core = self.lock_core();
        RuntimeDescription {
            runtime_id: self.runtime_id.clone(),
            state: self.state(),
            concurrency: self.concurrency(),
            abnormal: self.is_abnormal(),
            commit_id: core.commit_id.clone(),
            user_id: core.user_id.clone(),
            memory_bytes: core.resource.memory,
            milli_cpus: core.resource.milli_cpus,
            stream_mode: core.stream_mode,
            in_flight: self.requests.len(),
        }
    }

    fn state_unmatched(&self, op: &CasOp, current: RuntimeState) -> RtctrlError {
        tracing::trace!(
            runtime_id = %self.runtime_id,
            op = op.name(),
            state = %current,
            "cas rejected"
        );
        self.state_unmatched_states(current, op.expected_states().to_vec())
    }

    fn state_unmatched_states(
        &self,
        current: RuntimeState,
        expected: Vec<RuntimeState>,
    ) -> RtctrlError {
        RtctrlError::RuntimeStateUnmatched {
            runtime_id: self.runtime_id.clone(),
            current_state: current,
            expected_states: expected,
        }
    }

    fn match_error(&self, reason: &str) -> RtctrlError {
        RtctrlError::RuntimeMatch {
            runtime_id: self.runtime_id.clone(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occupy_params(commit: &str) -> OccupyParams {
        OccupyParams {
            commit_id: commit.to_string(),
            user_id: "acct".to_string(),
            resource: Resource::from_memory_mb(128, 10),
            stream_mode: false,
            concurrent_mode: false,
            concurrent_quota: 1,
        }
    }

    fn cold_runtime(id: &str) -> Arc<RuntimeInfo> {
        let rt = RuntimeInfo::new(id);
        rt.activate().unwrap();
        rt
    }

    #[test]
    fn test_occupy_on_closed_runtime_fails() {
        let rt = RuntimeInfo::new("rt-1");
        let err = rt.cas(&CasOp::Occupy(occupy_params("c1"))).unwrap_err();
        match err {
            RtctrlError::RuntimeStateUnmatched {
                current_state,
                expected_states,
                ..
            } => {
                assert_eq!(current_state, RuntimeState::Closed);
                assert_eq!(expected_states, vec![RuntimeState::Cold]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_occupy_then_rollback() {
        let rt = cold_runtime("rt-1");
        rt.cas(&CasOp::Occupy(occupy_params("c1"))).unwrap();
        assert_eq!(rt.state(), RuntimeState::WarmUp);
        assert_eq!(rt.concurrency(), 1);

        rt.cas(&CasOp::Rollback {
            commit_id: "c1".to_string(),
        })
        .unwrap();
        assert_eq!(rt.state(), RuntimeState::Cold);
        assert_eq!(rt.concurrency(), 0);
        assert_eq!(rt.commit_id(), None);
    }

    #[test]
    fn test_rollback_requires_matching_commit() {
        let rt = cold_runtime("rt-1");
        rt.cas(&CasOp::Occupy(occupy_params("c1"))).unwrap();
        let err = rt
            .cas(&CasOp::Rollback {
                commit_id: "other".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, RtctrlError::RuntimeMatch { .. }));
    }

    #[test]
    fn test_mark_respects_non_concurrent_quota() {
        let rt = cold_runtime("rt-1");
        rt.cas(&CasOp::Occupy(occupy_params("c1"))).unwrap();
        rt.mark_warm();

        // Non-concurrent: one in-flight invocation at a time
        let err = rt
            .cas(&CasOp::Mark {
                commit_id: "c1".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, RtctrlError::RuntimeMatch { .. }));

        rt.release().unwrap();
        rt.cas(&CasOp::Mark {
            commit_id: "c1".to_string(),
        })
        .unwrap();
        assert_eq!(rt.concurrency(), 1);
    }

    #[test]
    fn test_mark_respects_concurrent_quota() {
        let rt = cold_runtime("rt-1");
        let mut params = occupy_params("c1");
        params.concurrent_mode = true;
        params.concurrent_quota = 3;
        rt.cas(&CasOp::Occupy(params)).unwrap();
        rt.mark_warm();

        let mark = CasOp::Mark {
            commit_id: "c1".to_string(),
        };
        rt.cas(&mark).unwrap();
        rt.cas(&mark).unwrap();
        assert_eq!(rt.concurrency(), 3);
        assert!(rt.cas(&mark).unwrap_err().is_state_mismatch());
    }

    #[test]
    fn test_release_at_zero_is_an_error() {
        let rt = cold_runtime("rt-1");
        let err = rt.release().unwrap_err();
        match err {
            RtctrlError::RuntimeRelease { reason, .. } => {
                assert_eq!(reason, "runtime concurrency has been 0");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_stop_requires_strictly_idle() {
        let rt = cold_runtime("rt-1");
        rt.cas(&CasOp::Occupy(occupy_params("c1"))).unwrap();
        rt.mark_warm();
        rt.release().unwrap();

        let now = Instant::now();
        let idle = Duration::from_secs(600);
        let deadline = now - idle;

        // Accessed exactly at the deadline: not yet idle
        rt.set_last_access(deadline);
        assert!(rt
            .cas_at(&CasOp::Stop { idle_deadline: deadline }, now)
            .is_err());

        // One nanosecond past the deadline: idle
        rt.set_last_access(deadline - Duration::from_nanos(1));
        rt.cas_at(&CasOp::Stop { idle_deadline: deadline }, now)
            .unwrap();
        assert_eq!(rt.state(), RuntimeState::Stopping);
        assert_eq!(rt.commit_id(), None);
    }

    #[test]
    fn test_warm_runtime_is_never_defunct_on_liveness_alone() {
        let rt = cold_runtime("rt-1");
        rt.cas(&CasOp::Occupy(occupy_params("c1"))).unwrap();
        rt.mark_warm();

        let now = Instant::now();
        rt.set_last_liveness(now - Duration::from_secs(3600));
        assert!(!rt.is_runner_defunct(now, Duration::from_secs(120)));

        // But an abnormal warm runtime is
        rt.invalidate();
        assert!(rt.is_runner_defunct(now, Duration::from_secs(120)));
    }

    #[test]
    fn test_defunct_warmup_runtime_resets() {
        let rt = cold_runtime("rt-1");
        rt.cas(&CasOp::Occupy(occupy_params("c1"))).unwrap();

        let now = Instant::now();
        rt.set_last_liveness(now - Duration::from_secs(300));
        let deadline = now - Duration::from_secs(120);
        rt.cas_at(&CasOp::Reset { liveness_deadline: deadline }, now)
            .unwrap();
        assert_eq!(rt.commit_id(), None);
        assert_eq!(rt.concurrency(), 0);
        // Reset clears bindings without changing state
        assert_eq!(rt.state(), RuntimeState::WarmUp);
    }

    #[test]
    fn test_merge_and_retrieve() {
        let rt = cold_runtime("rt-1");
        rt.cas(&CasOp::Merge {
            commit_id: "c1".to_string(),
        })
        .unwrap();
        assert_eq!(rt.state(), RuntimeState::Merged);

        let now = Instant::now();
        rt.cas_at(
            &CasOp::Retrieve {
                reset_deadline: now - Duration::from_secs(30),
            },
            now,
        )
        .unwrap();
        assert_eq!(rt.state(), RuntimeState::Reclaiming);

        // A second retrieve before the reset spacing elapses is rejected
        let err = rt
            .cas_at(
                &CasOp::Retrieve {
                    reset_deadline: now - Duration::from_secs(30),
                },
                now,
            )
            .unwrap_err();
        assert!(matches!(err, RtctrlError::RuntimeMatch { .. }));
    }

    #[test]
    fn test_concurrent_cas_never_corrupts_counters() {
        let rt = cold_runtime("rt-1");
        let mut params = occupy_params("c1");
        params.concurrent_mode = true;
        params.concurrent_quota = 8;
        rt.cas(&CasOp::Occupy(params)).unwrap();
        rt.mark_warm();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let rt = Arc::clone(&rt);
            handles.push(std::thread::spawn(move || {
                let mut marks = 0u32;
                for _ in 0..100 {
                    let mark = CasOp::Mark {
                        commit_id: "c1".to_string(),
                    };
                    if rt.cas(&mark).is_ok() {
                        marks += 1;
                        rt.release().unwrap();
                    }
                }
                marks
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // Initial occupy still holds one slot
        assert_eq!(rt.concurrency(), 1);
    }
}
