//! Invocation orchestration
//!
//! One `invoke` call carries a request through the whole pipeline: match or
//! cold-start a runtime, dispatch over the generic frame protocol or the
//! stream-mode socket, wait bounded by the function timeout, then settle
//! logs, metrics, and the concurrency slot. Every exit path releases the
//! slot exactly once.

use crate::error::{ControllerError, Result};
use cirrus_funclet::{FuncletClient, WarmUpParams};
use cirrus_observability::{CirrusMetrics, LogSink, UserLogRecord};
use cirrus_rtctrl::{
    invoke_stream, runtime_socket_path, InvocationFrame, LogStoreIndex, OccupyInput, RequestInfo,
    RequestStatus, RuntimeInfo, RuntimeManager, StreamRequest,
};
use cirrus_spec::{FunctionConfig, InvokeInput};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// How long to wait for a sandbox to report warm after a warm-up RPC
pub const DEFAULT_WARM_WAIT: Duration = Duration::from_secs(10);

/// Invoker tunables taken from the daemon configuration
#[derive(Debug, Clone)]
pub struct InvokerOptions {
    pub runtime_socket_dir: PathBuf,
    pub default_invoke_timeout: Duration,
    pub warm_wait: Duration,
    /// Directory for per-invocation log files; `None` disables file capture
    pub invocation_log_dir: Option<PathBuf>,
}

impl Default for InvokerOptions {
    fn default() -> Self {
        Self {
            runtime_socket_dir: PathBuf::from("/var/run/faas"),
            default_invoke_timeout: Duration::from_secs(3),
            warm_wait: DEFAULT_WARM_WAIT,
            invocation_log_dir: None,
        }
    }
}

/// Terminal result of one invocation, as returned to the API caller
#[derive(Debug, Clone, Serialize)]
pub struct InvokeResponse {
    pub request_id: String,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub billed_ms: i64,
    pub max_memory_used: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_tail: Option<String>,
}

/// A runtime bound for one invocation. Cold starts carry their merged
/// donors so a sandbox that never comes up can be rolled back whole.
struct AcquiredRuntime {
    runtime: Arc<RuntimeInfo>,
    merged: Option<Vec<Arc<RuntimeInfo>>>,
}

/// Drives invocations end to end
pub struct Invoker {
    manager: Arc<RuntimeManager>,
    funclet: Arc<dyn FuncletClient>,
    logs: Arc<LogStoreIndex>,
    metrics: Arc<CirrusMetrics>,
    sink: Arc<dyn LogSink>,
    options: InvokerOptions,
}

impl Invoker {
    pub fn new(
        manager: Arc<RuntimeManager>,
        funclet: Arc<dyn FuncletClient>,
        logs: Arc<LogStoreIndex>,
        metrics: Arc<CirrusMetrics>,
        sink: Arc<dyn LogSink>,
        options: InvokerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            funclet,
            logs,
            metrics,
            sink,
            options,
        })
    }

    pub fn manager(&self) -> &Arc<RuntimeManager> {
        &self.manager
    }

    /// Run one invocation in its own task so a panic anywhere in the
    /// pipeline becomes an error response instead of tearing down the
    /// connection handler
    pub async fn invoke_guarded(self: &Arc<Self>, input: InvokeInput) -> Result<InvokeResponse> {
        let invoker = self.clone();
        match tokio::spawn(async move { invoker.invoke(input).await }).await {
            Ok(result) => result,
            Err(e) => Err(ControllerError::Internal(format!(
                "invocation task panicked: {e}"
            ))),
        }
    }

    pub async fn invoke(self: &Arc<Self>, input: InvokeInput) -> Result<InvokeResponse> {
        let function = &input.function;
        let acquired = self.acquire_runtime(function).await?;
        let runtime = acquired.runtime.clone();

        if !runtime.wait_warm(self.options.warm_wait).await {
            warn!(
                runtime_id = %runtime.runtime_id,
                request_id = %input.request_id,
                "runtime never reported warm"
            );
            runtime.invalidate();
            match &acquired.merged {
                // Cold start that never came up: undo the occupation so the
                // memory reservation returns with the slots
                Some(merged) => {
                    let resource = runtime.resource();
                    self.manager.rollback_occupation(
                        &runtime,
                        merged,
                        &function.commit_id,
                        &resource,
                    );
                }
                None => self.release_slot(&runtime),
            }
            return Err(ControllerError::WarmUpTimeout(runtime.runtime_id.clone()));
        }

        let request = RequestInfo::new(&input.request_id, &runtime);
        runtime.register_request(request.clone());
        self.logs
            .for_runtime(&runtime.runtime_id)
            .insert(request.log_store.clone());
        self.attach_log_file(&request);
        request.mark_running();

        let timeout = if function.timeout > 0 {
            Duration::from_secs(function.timeout)
        } else {
            self.options.default_invoke_timeout
        };

        if runtime.stream_mode() {
            self.dispatch_stream(&runtime, &request, &input, timeout)
                .await;
        } else {
            self.dispatch_generic(&runtime, &request, &input, timeout)
                .await;
        }

        request
            .invoke_report_done(runtime.is_concurrent_mode(), function.log_tail)
            .await;
        self.settle(&runtime, &request, &input).await
    }

    /// Match a warm runtime or start a cold one for this commit
    async fn acquire_runtime(&self, function: &FunctionConfig) -> Result<AcquiredRuntime> {
        if let Some(runtime) = self.manager.find_warm_runtime(&function.commit_id) {
            debug!(
                runtime_id = %runtime.runtime_id,
                commit_id = %function.commit_id,
                "matched warm runtime"
            );
            return Ok(AcquiredRuntime {
                runtime,
                merged: None,
            });
        }

        let occupy = OccupyInput {
            commit_id: function.commit_id.clone(),
            user_id: function.user_id.clone(),
            memory_mb: function.memory_size,
            stream_mode: function.stream_mode,
            concurrent_mode: function.concurrent_mode,
            concurrent_quota: function.concurrent_quota,
        };
        let Some(occupied) = self.manager.occupy_cold_runtime(&occupy)? else {
            return Err(ControllerError::NoCapacity(function.function_name.clone()));
        };
        self.metrics.cold_starts_total.inc();
        if occupied.recommendation.is_some() {
            self.metrics.scale_up_total.inc();
        }

        let params = WarmUpParams {
            runtime_id: occupied.runtime.runtime_id.clone(),
            commit_id: function.commit_id.clone(),
            user_id: function.user_id.clone(),
            function_name: function.function_name.clone(),
            version: function.version.clone(),
            runtime: function.runtime.clone(),
            handler: function.handler.clone(),
            code_path: None,
            resource: occupied.runtime.resource(),
            stream_mode: function.stream_mode,
            merged: occupied
                .recommendation
                .as_ref()
                .map(|r| r.merged.clone())
                .unwrap_or_default(),
            environment: Vec::new(),
        };
        if let Err(e) = self.funclet.warm_up(&params).await {
            warn!(
                runtime_id = %occupied.runtime.runtime_id,
                error = %e,
                "warm-up RPC failed, rolling back occupation"
            );
            occupied.runtime.invalidate();
            let resource = occupied.runtime.resource();
            self.manager.rollback_occupation(
                &occupied.runtime,
                &occupied.merged,
                &function.commit_id,
                &resource,
            );
            return Err(e.into());
        }
        info!(
            runtime_id = %occupied.runtime.runtime_id,
            commit_id = %function.commit_id,
            merged = occupied.merged.len(),
            "cold start warm-up dispatched"
        );
        Ok(AcquiredRuntime {
            runtime: occupied.runtime,
            merged: Some(occupied.merged),
        })
    }

    /// Open the per-invocation log file when file capture is configured
    fn attach_log_file(&self, request: &Arc<RequestInfo>) {
        let Some(dir) = &self.options.invocation_log_dir else {
            return;
        };
        let path = dir.join(format!("{}.log", request.request_id));
        match std::fs::File::create(&path) {
            Ok(file) => request.log_store.set_file(file),
            Err(e) => {
                warn!(
                    request_id = %request.request_id,
                    path = %path.display(),
                    error = %e,
                    "invocation log file create failed"
                );
            }
        }
    }

    /// Generic mode: queue the frame and wait for the completion signal
    async fn dispatch_generic(
        &self,
        runtime: &Arc<RuntimeInfo>,
        request: &Arc<RequestInfo>,
        input: &InvokeInput,
        timeout: Duration,
    ) {
        let frame = InvocationFrame {
            requestid: request.request_id.clone(),
            version: input.function.version.clone(),
            access_key: None,
            secret_key: None,
            security_token: None,
            client_context: input.client_context.clone(),
            event_object: input.event_object.clone(),
        };
        match runtime.send_request(frame) {
            Ok(()) => {
                if !request.wait_done(timeout).await {
                    request.invoke_timeout(timeout);
                }
            }
            Err(e) => {
                request.invoke_result(RequestStatus::Failed, None, Some(e.to_string()));
            }
        }
    }

    /// Stream mode: proxy the event over the sandbox's HTTP socket; the
    /// upstream timeout fires the request's cancel channel to abort retries
    async fn dispatch_stream(
        &self,
        runtime: &Arc<RuntimeInfo>,
        request: &Arc<RequestInfo>,
        input: &InvokeInput,
        timeout: Duration,
    ) {
        let Some(mut cancel) = request.take_cancel_rx() else {
            request.invoke_result(
                RequestStatus::Failed,
                None,
                Some("stream cancel channel already taken".to_string()),
            );
            return;
        };

        let body = match serde_json::to_vec(&input.event_object) {
            Ok(body) => body,
            Err(e) => {
                request.invoke_result(RequestStatus::Failed, None, Some(e.to_string()));
                return;
            }
        };
        let stream_request = StreamRequest {
            method: http::Method::POST,
            path: "/invoke".to_string(),
            headers: vec![(
                "x-cirrus-request-id".to_string(),
                request.request_id.clone(),
            )],
            body: body.into(),
        };
        let socket = runtime_socket_path(&self.options.runtime_socket_dir, &runtime.runtime_id);
        let deadline = Instant::now() + timeout;

        tokio::select! {
            result = invoke_stream(&socket, &request.request_id, &stream_request, deadline, &mut cancel) => {
                match result {
                    Ok(response) => {
                        let status = if response.status < 400 {
                            RequestStatus::Success
                        } else {
                            RequestStatus::Failed
                        };
                        let result = serde_json::from_slice(&response.body).unwrap_or_else(|_| {
                            serde_json::Value::String(
                                String::from_utf8_lossy(&response.body).into_owned(),
                            )
                        });
                        let error = (status == RequestStatus::Failed)
                            .then(|| format!("sandbox returned HTTP {}", response.status));
                        request.invoke_result(status, Some(result), error);
                    }
                    Err(e) => {
                        request.invoke_result(RequestStatus::Failed, None, Some(e.to_string()));
                    }
                }
            }
            _ = tokio::time::sleep(timeout) => {
                request.invoke_timeout(timeout);
            }
        }
    }

    /// Release the slot, flush user logs, record metrics, and build the
    /// caller-facing response
    async fn settle(
        &self,
        runtime: &Arc<RuntimeInfo>,
        request: &Arc<RequestInfo>,
        input: &InvokeInput,
    ) -> Result<InvokeResponse> {
        let outcome = request.outcome();
        let timing = request.timing();
        let status = outcome.status.unwrap_or(RequestStatus::Failed);

        let captured = request.log_store.contents();
        self.flush_user_logs(runtime, request, input, &captured);

        if let Err(e) = runtime.release() {
            // Indicates a double-release bug upstream; the invocation result
            // is still valid, so report and continue
            warn!(runtime_id = %runtime.runtime_id, error = %e, "release failed");
        }
        runtime.remove_request(&request.request_id);
        if let Some(stores) = self.logs.get(&runtime.runtime_id) {
            stores.remove(&request.request_id);
        }

        self.metrics
            .invocations_total
            .with_label_values(&[&input.function.function_name, status.as_str()])
            .inc();
        if timing.billed_ms > 0 {
            self.metrics
                .invocation_duration_seconds
                .with_label_values(&[&input.function.function_name])
                .observe(timing.billed_ms as f64 / 1000.0);
        }

        let log_tail = (input.function.log_tail && !captured.is_empty())
            .then(|| String::from_utf8_lossy(&captured).into_owned());

        Ok(InvokeResponse {
            request_id: request.request_id.clone(),
            status,
            result: outcome.result,
            error: outcome.error,
            billed_ms: timing.billed_ms,
            max_memory_used: timing.max_memory_used,
            log_tail,
        })
    }

    fn flush_user_logs(
        &self,
        runtime: &Arc<RuntimeInfo>,
        request: &Arc<RequestInfo>,
        input: &InvokeInput,
        captured: &[u8],
    ) {
        if captured.is_empty() {
            return;
        }
        let trigger = input.trigger.to_string();
        let record = UserLogRecord {
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
            request_id: &request.request_id,
            trigger: &trigger,
            runtime_id: &runtime.runtime_id,
            source: "stdout",
            user_id: &input.function.user_id,
            function_brn: &input.function.function_brn,
            message: captured,
        };
        if let Err(e) = self.sink.write_record(&record) {
            warn!(request_id = %request.request_id, error = %e, "user log sink write failed");
        }
    }

    /// Release the concurrency slot taken at match/occupy time without an
    /// associated request record
    fn release_slot(&self, runtime: &Arc<RuntimeInfo>) {
        if let Err(e) = runtime.release() {
            warn!(runtime_id = %runtime.runtime_id, error = %e, "release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_funclet::{FuncletCall, MockFunclet};
    use cirrus_observability::PlainSink;
    use cirrus_rtctrl::ManagerOptions;
    use cirrus_spec::{Resource, TriggerType};

    const BASE_MB: i64 = 128;

    struct Harness {
        invoker: Arc<Invoker>,
        manager: Arc<RuntimeManager>,
        funclet: Arc<MockFunclet>,
    }

    fn harness(pool: usize) -> Harness {
        let manager = Arc::new(RuntimeManager::new(ManagerOptions::default()));
        manager.update_capacity(
            Resource::from_memory_mb(BASE_MB * 16, 10),
            Resource::from_memory_mb(BASE_MB * 16, 10),
        );
        let ids: Vec<String> = (0..pool).map(|i| format!("runtime-{i}")).collect();
        manager.init_runtime_list(ids.clone());
        let funclet = Arc::new(MockFunclet::new(ids));
        let invoker = Invoker::new(
            manager.clone(),
            funclet.clone(),
            Arc::new(LogStoreIndex::new()),
            Arc::new(CirrusMetrics::new().unwrap()),
            Arc::new(PlainSink),
            InvokerOptions {
                warm_wait: Duration::from_millis(50),
                default_invoke_timeout: Duration::from_millis(100),
                ..InvokerOptions::default()
            },
        );
        Harness {
            invoker,
            manager,
            funclet,
        }
    }

    fn sample_input(request_id: &str, memory_mb: i64) -> InvokeInput {
        InvokeInput {
            request_id: request_id.to_string(),
            function: FunctionConfig {
                function_brn: "brn:cirrus:function:echo".to_string(),
                function_name: "echo".to_string(),
                version: "1".to_string(),
                commit_id: "commit-1".to_string(),
                user_id: "acct".to_string(),
                memory_size: memory_mb,
                timeout: 1,
                runtime: "python3".to_string(),
                handler: "index.handler".to_string(),
                concurrent_mode: false,
                concurrent_quota: 1,
                stream_mode: false,
                log_tail: false,
            },
            trigger: TriggerType::Generic,
            event_object: serde_json::json!({"k": 1}),
            client_context: None,
        }
    }

    #[tokio::test]
    async fn test_cold_start_calls_funclet_then_times_out_waiting_for_warm() {
        let h = harness(2);
        let err = h
            .invoker
            .invoke(sample_input("req-1", BASE_MB))
            .await
            .unwrap_err();
        // Warm-up was dispatched, but no sandbox ever connected back
        assert!(matches!(err, ControllerError::WarmUpTimeout(_)));
        assert!(matches!(
            h.funclet.calls().as_slice(),
            [FuncletCall::WarmUp { .. }]
        ));
    }

    #[tokio::test]
    async fn test_warm_wait_timeout_rolls_back_the_reservation() {
        let h = harness(3);
        let marked_before = h.manager.resource_overview().marked.memory;

        let err = h
            .invoker
            .invoke(sample_input("req-1", 2 * BASE_MB))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::WarmUpTimeout(_)));

        // The occupy-time reservation came back with the slots; nothing was
        // ever confirmed warm
        let overview = h.manager.resource_overview();
        assert_eq!(overview.marked.memory, marked_before);
        assert_eq!(overview.used.memory, 0);

        // The next oversized cold start still fits: the donor returned to
        // Cold and only the invalidated target is held out
        let occupied = h
            .manager
            .occupy_cold_runtime(&OccupyInput {
                commit_id: "commit-2".to_string(),
                user_id: "acct".to_string(),
                memory_mb: 2 * BASE_MB,
                stream_mode: false,
                concurrent_mode: false,
                concurrent_quota: 1,
            })
            .unwrap();
        assert!(occupied.is_some());
    }

    #[tokio::test]
    async fn test_failed_warm_up_rolls_back_and_surfaces_error() {
        let h = harness(2);
        h.funclet.fail_warm_ups();
        let marked_before = h.manager.resource_overview().marked.memory;

        let err = h
            .invoker
            .invoke(sample_input("req-1", 2 * BASE_MB))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Funclet(_)));
        // Reservation fully released, pool returned to Cold
        assert_eq!(h.manager.resource_overview().marked.memory, marked_before);
    }

    #[tokio::test]
    async fn test_warm_runtime_invocation_completes() {
        let h = harness(2);

        // Occupy and hand-warm a runtime, standing in for the dispatch server
        let occupied = h
            .manager
            .occupy_cold_runtime(&OccupyInput {
                commit_id: "commit-1".to_string(),
                user_id: "acct".to_string(),
                memory_mb: BASE_MB,
                stream_mode: false,
                concurrent_mode: false,
                concurrent_quota: 1,
            })
            .unwrap()
            .unwrap();
        let runtime = occupied.runtime.clone();
        let (request_tx, mut request_rx) =
            tokio::sync::mpsc::channel::<InvocationFrame>(8);
        let (stop_tx, _stop_rx) = tokio::sync::watch::channel(false);
        runtime.bind_transport(request_tx, stop_tx);
        runtime.mark_warm();
        runtime.release().unwrap();

        // Echo sandbox: answer each frame with success
        let echo_runtime = runtime.clone();
        tokio::spawn(async move {
            while let Some(frame) = request_rx.recv().await {
                if let Some(request) = echo_runtime.find_request(&frame.requestid) {
                    request.invoke_result(
                        RequestStatus::Success,
                        Some(serde_json::json!({"echo": frame.event_object})),
                        None,
                    );
                }
            }
        });

        let response = h
            .invoker
            .invoke(sample_input("req-1", BASE_MB))
            .await
            .unwrap();
        assert_eq!(response.status, RequestStatus::Success);
        assert!(response.error.is_none());
        assert_eq!(runtime.concurrency(), 0);
        assert_eq!(runtime.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unanswered_invocation_times_out_with_wire_message() {
        let h = harness(2);
        let occupied = h
            .manager
            .occupy_cold_runtime(&OccupyInput {
                commit_id: "commit-1".to_string(),
                user_id: "acct".to_string(),
                memory_mb: BASE_MB,
                stream_mode: false,
                concurrent_mode: false,
                concurrent_quota: 1,
            })
            .unwrap()
            .unwrap();
        let runtime = occupied.runtime.clone();
        // Transport accepts frames but nothing ever answers
        let (request_tx, _request_rx) = tokio::sync::mpsc::channel::<InvocationFrame>(8);
        let (stop_tx, _stop_rx) = tokio::sync::watch::channel(false);
        runtime.bind_transport(request_tx, stop_tx);
        runtime.mark_warm();
        runtime.release().unwrap();

        let response = h
            .invoker
            .invoke(sample_input("req-1", BASE_MB))
            .await
            .unwrap();
        assert_eq!(response.status, RequestStatus::Timeout);
        assert_eq!(
            response.error.as_deref(),
            Some("Task timed out after 1.00 seconds")
        );
    }
}
