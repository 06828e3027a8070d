//! Per-invocation request records
//!
//! A `RequestInfo` correlates one invocation attempt with the runtime it is
//! bound to, carries timing and status, and owns the completion signalling:
//! exactly one completion is ever delivered, and a terminal status is final
//! no matter how many paths race to set one.

use crate::logstore::LogStatStore;
use crate::runtime::RuntimeInfo;
use serde::Serialize;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Grace period granted for stdout/stderr EOF markers before an invocation
/// response is finalized with tail logs
pub const LOG_DRAIN_GRACE: Duration = Duration::from_millis(10);

/// Invocation status; moves only forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Created but not yet dispatched
    Normal,
    /// In flight on a runtime
    Running,
    Success,
    Failed,
    Timeout,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Success | RequestStatus::Failed | RequestStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Normal => "normal",
            RequestStatus::Running => "running",
            RequestStatus::Success => "success",
            RequestStatus::Failed => "failed",
            RequestStatus::Timeout => "timeout",
        }
    }
}

/// Terminal outcome of an invocation
#[derive(Debug, Clone, Default)]
pub struct RequestOutcome {
    pub status: Option<RequestStatus>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Wall-clock timing and usage for one invocation
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestTiming {
    pub start_ms: i64,
    pub start_ns: i64,
    pub init_done_ms: i64,
    pub done_ms: i64,
    pub billed_ms: i64,
    pub max_memory_used: i64,
}

struct RequestState {
    status: RequestStatus,
    outcome: RequestOutcome,
    timing: RequestTiming,
}

/// One invocation attempt bound to a runtime
pub struct RequestInfo {
    pub request_id: String,
    pub runtime_id: String,
    /// Correlation only; the manager's pool owns the runtime lifetime
    runtime: Weak<RuntimeInfo>,
    state: Mutex<RequestState>,
    done_tx: mpsc::Sender<()>,
    done_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    cancel_tx: mpsc::Sender<()>,
    cancel_rx: Mutex<Option<mpsc::Receiver<()>>>,
    pub log_store: Arc<LogStatStore>,
}

impl RequestInfo {
    pub fn new(request_id: impl Into<String>, runtime: &Arc<RuntimeInfo>) -> Arc<Self> {
        let request_id = request_id.into();
        let (done_tx, done_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        Arc::new(Self {
            log_store: Arc::new(LogStatStore::new(request_id.clone())),
            request_id,
            runtime_id: runtime.runtime_id.clone(),
            runtime: Arc::downgrade(runtime),
            state: Mutex::new(RequestState {
                status: RequestStatus::Normal,
                outcome: RequestOutcome::default(),
                timing: RequestTiming::default(),
            }),
            done_tx,
            done_rx: tokio::sync::Mutex::new(done_rx),
            cancel_tx,
            cancel_rx: Mutex::new(Some(cancel_rx)),
        })
    }

    /// The runtime this request is bound to, if it still exists
    pub fn runtime(&self) -> Option<Arc<RuntimeInfo>> {
        self.runtime.upgrade()
    }

    pub fn status(&self) -> RequestStatus {
        self.state.lock().expect("request state lock poisoned").status
    }

    pub fn timing(&self) -> RequestTiming {
        self.state.lock().expect("request state lock poisoned").timing
    }

    pub fn outcome(&self) -> RequestOutcome {
        self.state
            .lock()
            .expect("request state lock poisoned")
            .outcome
            .clone()
    }

    /// Transition Normal -> Running and stamp the start time
    pub fn mark_running(&self) {
        let mut state = self.state.lock().expect("request state lock poisoned");
        if state.status == RequestStatus::Normal {
            state.status = RequestStatus::Running;
            state.timing.start_ms = epoch_ms();
            state.timing.start_ns = epoch_ns();
        }
    }

    pub fn set_init_done(&self) {
        let mut state = self.state.lock().expect("request state lock poisoned");
        state.timing.init_done_ms = epoch_ms();
    }

    /// Record a memory-usage sample; keeps the high-water mark
    pub fn observe_memory(&self, bytes: i64) {
        let mut state = self.state.lock().expect("request state lock poisoned");
        if bytes > state.timing.max_memory_used {
            state.timing.max_memory_used = bytes;
        }
    }

    /// Record the terminal status of this invocation.
    ///
    /// Idempotent: only the first call while the request is still live takes
    /// effect; later calls (a late sandbox reply racing the timeout timer)
    /// are no-ops. Returns whether this call set the status.
    pub fn invoke_result(
        &self,
        status: RequestStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> bool {
        debug_assert!(status.is_terminal());
        let mut state = self.state.lock().expect("request state lock poisoned");
        if state.status.is_terminal() {
            return false;
        }
        state.status = status;
        state.outcome = RequestOutcome {
            status: Some(status),
            result,
            error,
        };
        state.timing.done_ms = epoch_ms();
        if state.timing.start_ms > 0 {
            state.timing.billed_ms = state.timing.done_ms - state.timing.start_ms;
        }
        drop(state);

        // Buffered-1, drop-if-full: never blocks the protocol loop, and at
        // most one completion signal is ever delivered
        let _ = self.done_tx.try_send(());
        true
    }

    /// Record an upstream timeout and unblock a stream-mode sender
    pub fn invoke_timeout(&self, timeout: Duration) -> bool {
        let acted = self.invoke_result(
            RequestStatus::Timeout,
            None,
            Some(format!(
                "Task timed out after {:.2} seconds",
                timeout.as_secs_f64()
            )),
        );
        if acted {
            let _ = self.cancel_tx.try_send(());
        }
        acted
    }

    /// Block until the completion signal arrives or `timeout` elapses.
    ///
    /// Returns true on completion, false on timer expiry.
    pub async fn wait_done(&self, timeout: Duration) -> bool {
        let mut rx = self.done_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.is_ok()
    }

    /// Take the stream-mode cancellation receiver (at most once)
    pub fn take_cancel_rx(&self) -> Option<mpsc::Receiver<()>> {
        self.cancel_rx
            .lock()
            .expect("request state lock poisoned")
            .take()
    }

    /// Finalize log capture for this invocation.
    ///
    /// In non-concurrent mode with tail logging the caller is willing to wait
    /// a short grace period for both streams' EOF markers; under concurrent
    /// invocation multiple requests share one stream, so waiting per request
    /// is meaningless and logs are force-marked done immediately.
    pub async fn invoke_report_done(&self, concurrent_mode: bool, log_tail: bool) {
        if !concurrent_mode && log_tail {
            self.log_store.wait(LOG_DRAIN_GRACE).await;
        }
        self.log_store.force_done();
    }
}

pub(crate) fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn epoch_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeInfo;

    fn test_runtime() -> Arc<RuntimeInfo> {
        RuntimeInfo::new("rt-1")
    }

    #[tokio::test]
    async fn test_invoke_result_is_idempotent() {
        let rt = test_runtime();
        let req = RequestInfo::new("req-1", &rt);
        req.mark_running();

        assert!(req.invoke_result(
            RequestStatus::Success,
            Some(serde_json::json!({"ok": true})),
            None
        ));
        // A late timeout must not overwrite the first terminal status
        assert!(!req.invoke_timeout(Duration::from_secs(3)));
        assert!(!req.invoke_result(RequestStatus::Failed, None, Some("boom".into())));

        assert_eq!(req.status(), RequestStatus::Success);
        assert_eq!(req.outcome().error, None);
    }

    #[tokio::test]
    async fn test_exactly_one_completion_signal() {
        let rt = test_runtime();
        let req = RequestInfo::new("req-1", &rt);
        req.mark_running();
        req.invoke_result(RequestStatus::Success, None, None);
        req.invoke_result(RequestStatus::Failed, None, None);

        assert!(req.wait_done(Duration::from_millis(10)).await);
        // The channel is drained; no second signal may arrive
        assert!(!req.wait_done(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_timeout_message_format() {
        let rt = test_runtime();
        let req = RequestInfo::new("req-1", &rt);
        req.mark_running();
        req.invoke_timeout(Duration::from_secs(3));

        assert_eq!(req.status(), RequestStatus::Timeout);
        assert_eq!(
            req.outcome().error.as_deref(),
            Some("Task timed out after 3.00 seconds")
        );
    }

    #[tokio::test]
    async fn test_timeout_signals_cancel_channel() {
        let rt = test_runtime();
        let req = RequestInfo::new("req-1", &rt);
        let mut cancel_rx = req.take_cancel_rx().unwrap();
        req.mark_running();
        req.invoke_timeout(Duration::from_secs(1));
        assert!(cancel_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_report_done_forces_logs_in_concurrent_mode() {
        let rt = test_runtime();
        let req = RequestInfo::new("req-1", &rt);
        req.invoke_report_done(true, true).await;
        assert!(req.log_store.is_done());
    }
}
