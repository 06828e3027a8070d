//! Runtime-facing dispatch server
//!
//! Sandboxes dial in to the controller over HTTP/1.1 and upgrade each
//! channel to a raw byte stream: `/invoke` carries the generic-mode frame
//! protocol, `/stdout` and `/stderr` carry multiplexed log lines,
//! `/statistic` carries per-request memory samples as JSON lines, and
//! `/status` carries runner heartbeat lines.

use crate::demux::{LogDemux, LOG_READ_BUFFER};
use crate::error::Result;
use crate::logstore::{LogSource, LogStoreIndex};
use crate::manager::RuntimeManager;
use crate::protocol::{write_frame, FrameDecoder, ResponseFrame};
use crate::request::RequestStatus;
use crate::runtime::{RuntimeInfo, REQUEST_CHANNEL_CAPACITY};
use crate::state::RuntimeState;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Identifies the sandbox on every runtime-initiated request
pub const HEADER_RUNTIME_ID: &str = "x-cfc-runtimeid";
/// Function version the sandbox believes it is bound to
pub const HEADER_COMMIT_ID: &str = "x-cfc-commitid";
/// Host address of the node running the sandbox
pub const HEADER_HOST_IP: &str = "x-cfc-hostip";

/// One memory sample on the `/statistic` channel
#[derive(Debug, Deserialize)]
struct StatisticRecord {
    requestid: String,
    memory: i64,
}

/// One heartbeat line on the `/status` channel; init timestamps appear
/// once code loading finishes
#[derive(Debug, Default, Deserialize)]
struct StatusRecord {
    #[serde(default)]
    initstart: i64,
    #[serde(default)]
    initdone: i64,
}

/// Accepts and services sandbox connections
pub struct Dispatcher {
    manager: Arc<RuntimeManager>,
    logs: Arc<LogStoreIndex>,
}

impl Dispatcher {
    pub fn new(manager: Arc<RuntimeManager>, logs: Arc<LogStoreIndex>) -> Arc<Self> {
        Arc::new(Self { manager, logs })
    }

    pub fn logs(&self) -> &Arc<LogStoreIndex> {
        &self.logs
    }

    /// Accept loop for the runtime-facing listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "runtime dispatch listening");
        loop {
            let (stream, remote) = listener.accept().await?;
            let dispatcher = self.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = hyper::service::service_fn({
                    let dispatcher = dispatcher.clone();
                    move |req| {
                        let dispatcher = dispatcher.clone();
                        async move {
                            Ok::<_, std::convert::Infallible>(dispatcher.route(req).await)
                        }
                    }
                });
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, svc)
                    .with_upgrades()
                    .await
                {
                    debug!(remote = %remote, error = %e, "runtime connection ended");
                }
            });
        }
    }

    pub async fn route<B>(self: &Arc<Self>, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Send + 'static,
    {
        match req.uri().path() {
            "/invoke" => self.handle_invoke(req),
            "/stdout" => self.handle_log(req, LogSource::Stdout),
            "/stderr" => self.handle_log(req, LogSource::Stderr),
            "/statistic" => self.handle_statistic(req),
            "/status" => self.handle_status(req),
            _ => respond(StatusCode::NOT_FOUND, "no such channel"),
        }
    }

    /// Upgrade the invocation channel and run the frame protocol on it
    fn handle_invoke<B>(self: &Arc<Self>, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Send + 'static,
    {
        let runtime = match self.identify(&req) {
            Ok(runtime) => runtime,
            Err(response) => return response,
        };
        if !matches!(runtime.state(), RuntimeState::Cold | RuntimeState::WarmUp) {
            return respond(
                StatusCode::CONFLICT,
                format!("runtime {} is {}", runtime.runtime_id, runtime.state()),
            );
        }

        if let Some(ip) = header(&req, HEADER_HOST_IP) {
            runtime.set_host_ip(ip);
        }
        let query = req.uri().query();
        let init_start = query_param_i64(query, "initstart");
        let init_done = query_param_i64(query, "initdone");
        if init_start != 0 || init_done != 0 {
            runtime.set_init_times(init_start, init_done);
        }
        if let Some(mode) = query_param(query, "concurrentmode") {
            let concurrent = mode == "true" || mode == "1";
            if concurrent != runtime.is_concurrent_mode() {
                warn!(
                    runtime_id = %runtime.runtime_id,
                    reported = concurrent,
                    "sandbox reports a different concurrency mode than assigned"
                );
            }
        }

        let dispatcher = self.clone();
        let on_upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => dispatcher.run_invoke_loop(runtime, upgraded).await,
                Err(e) => {
                    debug!(runtime_id = %runtime.runtime_id, error = %e, "invoke upgrade failed")
                }
            }
        });
        switching_protocols()
    }

    fn handle_log<B>(self: &Arc<Self>, req: Request<B>, source: LogSource) -> Response<Full<Bytes>>
    where
        B: Send + 'static,
    {
        let runtime = match self.identify(&req) {
            Ok(runtime) => runtime,
            Err(response) => return response,
        };

        let dispatcher = self.clone();
        let on_upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    dispatcher
                        .run_log_loop(&runtime.runtime_id, source, upgraded)
                        .await
                }
                Err(e) => {
                    debug!(runtime_id = %runtime.runtime_id, error = %e, "log upgrade failed")
                }
            }
        });
        switching_protocols()
    }

    fn handle_statistic<B>(self: &Arc<Self>, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Send + 'static,
    {
        let runtime = match self.identify(&req) {
            Ok(runtime) => runtime,
            Err(response) => return response,
        };

        let on_upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => run_statistic_loop(runtime, upgraded).await,
                Err(e) => {
                    debug!(runtime_id = %runtime.runtime_id, error = %e, "statistic upgrade failed")
                }
            }
        });
        switching_protocols()
    }

    /// Upgrade the runner heartbeat channel; every line on it refreshes
    /// liveness
    fn handle_status<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Send + 'static,
    {
        let runtime = match self.identify(&req) {
            Ok(runtime) => runtime,
            Err(response) => return response,
        };

        // Connecting at all counts as a heartbeat; init timestamps may also
        // ride on the upgrade request itself
        runtime.touch_liveness();
        let query = req.uri().query();
        let init_start = query_param_i64(query, "initstart");
        let init_done = query_param_i64(query, "initdone");
        if init_start != 0 || init_done != 0 {
            runtime.set_init_times(init_start, init_done);
        }

        let on_upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => run_status_loop(runtime, TokioIo::new(upgraded)).await,
                Err(e) => {
                    debug!(runtime_id = %runtime.runtime_id, error = %e, "status upgrade failed")
                }
            }
        });
        switching_protocols()
    }

    /// Resolve the runtime named by the request headers, checking that the
    /// sandbox's claimed commit matches its assignment
    fn identify<B>(&self, req: &Request<B>) -> Result<Arc<RuntimeInfo>, Response<Full<Bytes>>> {
        let Some(runtime_id) = header(req, HEADER_RUNTIME_ID) else {
            return Err(respond(
                StatusCode::BAD_REQUEST,
                format!("missing {HEADER_RUNTIME_ID} header"),
            ));
        };
        let Some(runtime) = self.manager.get(runtime_id) else {
            return Err(respond(
                StatusCode::NOT_FOUND,
                format!("unknown runtime {runtime_id}"),
            ));
        };
        if let Some(claimed) = header(req, HEADER_COMMIT_ID) {
            let assigned = runtime.commit_id();
            if assigned.as_deref() != Some(claimed) {
                return Err(respond(
                    StatusCode::CONFLICT,
                    format!(
                        "runtime {runtime_id} claims commit {claimed} but is assigned {}",
                        assigned.as_deref().unwrap_or("none")
                    ),
                ));
            }
        }
        Ok(runtime)
    }

    /// Generic-mode protocol loop: pump queued invocation frames out, decode
    /// response frames in, and tear the runtime down when the stream ends
    async fn run_invoke_loop(self: &Arc<Self>, runtime: Arc<RuntimeInfo>, upgraded: Upgraded) {
        let (mut reader, mut writer) = tokio::io::split(TokioIo::new(upgraded));

        let (request_tx, mut request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        runtime.bind_transport(request_tx, stop_tx);
        runtime.touch_liveness();
        info!(runtime_id = %runtime.runtime_id, "runtime invoke channel bound");

        // The connection itself is the sandbox's ready signal when it was
        // already occupied; a Cold-connected runtime warms later
        if runtime.mark_warm() {
            self.manager.confirm_runtime_warm(&runtime);
        }
        let warm_task = {
            let runtime = runtime.clone();
            let manager = self.manager.clone();
            let mut stop = stop_rx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    warmed = runtime.wait_warm(Duration::from_secs(3600)) => {
                        if warmed {
                            manager.confirm_runtime_warm(&runtime);
                        }
                    }
                    _ = stop.changed() => {}
                }
            })
        };

        let sender = {
            let runtime_id = runtime.runtime_id.clone();
            let mut stop = stop_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        frame = request_rx.recv() => match frame {
                            Some(frame) => {
                                if let Err(e) = write_frame(&mut writer, &frame).await {
                                    debug!(runtime_id = %runtime_id, error = %e,
                                        "invocation frame write failed");
                                    break;
                                }
                            }
                            None => break,
                        },
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        let mut stop = stop_rx;
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; LOG_READ_BUFFER];
        loop {
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        runtime.touch_liveness();
                        match decoder.feed(&buf[..n]) {
                            Ok(frames) => {
                                for frame in frames {
                                    self.complete(&runtime, frame);
                                }
                            }
                            Err(e) => {
                                warn!(runtime_id = %runtime.runtime_id, error = %e,
                                    "corrupt frame on invoke channel");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        debug!(runtime_id = %runtime.runtime_id, error = %e,
                            "invoke channel read failed");
                        break;
                    }
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        self.stop_runtime(&runtime);
        sender.abort();
        warm_task.abort();
    }

    /// Route one response frame to its request; unknown IDs are stale
    /// replies from a request that already timed out and was removed
    fn complete(&self, runtime: &Arc<RuntimeInfo>, frame: ResponseFrame) {
        let Some(request) = runtime.find_request(&frame.requestid) else {
            debug!(
                runtime_id = %runtime.runtime_id,
                request_id = %frame.requestid,
                "response frame for unknown request"
            );
            return;
        };
        let status = if frame.success {
            RequestStatus::Success
        } else {
            RequestStatus::Failed
        };
        request.invoke_result(status, frame.result, frame.error);
    }

    /// Tear down a runtime whose invoke channel closed: every in-flight
    /// request gets a terminal failure, log waiters are released, and the
    /// slot goes back to Closed
    pub fn stop_runtime(&self, runtime: &Arc<RuntimeInfo>) {
        info!(runtime_id = %runtime.runtime_id, "runtime invoke channel closed");
        runtime.fail_all_requests("runtime connection lost");
        runtime.clear_transport();
        if let Some(stores) = self.logs.get(&runtime.runtime_id) {
            stores.mark_all_done(LogSource::Stdout);
            stores.mark_all_done(LogSource::Stderr);
        }
        // Release used accounting before close clears the resource binding
        self.manager.confirm_runtime_closed(runtime);
        runtime.close();
    }

    async fn run_log_loop(&self, runtime_id: &str, source: LogSource, upgraded: Upgraded) {
        let stores = self.logs.for_runtime(runtime_id);
        let mut demux = LogDemux::new(source, stores.clone());
        let mut reader = TokioIo::new(upgraded);
        let mut buf = vec![0u8; LOG_READ_BUFFER];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => demux.feed(&buf[..n]),
                Err(e) => {
                    debug!(runtime_id, stream = source.as_str(), error = %e,
                        "log channel read failed");
                    break;
                }
            }
        }
        demux.finish();
        stores.mark_all_done(source);
        debug!(runtime_id, stream = source.as_str(), "log channel closed");
    }
}

/// JSON-lines loop on the statistic channel; each record refreshes the
/// request's memory high-water mark
async fn run_statistic_loop(runtime: Arc<RuntimeInfo>, upgraded: Upgraded) {
    let mut lines = BufReader::new(TokioIo::new(upgraded)).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<StatisticRecord>(&line) {
                    Ok(record) => {
                        runtime.touch_liveness();
                        if let Some(request) = runtime.find_request(&record.requestid) {
                            request.observe_memory(record.memory);
                        }
                    }
                    Err(e) => {
                        debug!(runtime_id = %runtime.runtime_id, error = %e,
                            "unparseable statistic record");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(runtime_id = %runtime.runtime_id, error = %e,
                    "statistic channel read failed");
                break;
            }
        }
    }
}

/// Heartbeat loop on the status channel. Every line refreshes the runner's
/// liveness; lines carrying init timestamps record them on the runtime.
async fn run_status_loop<R>(runtime: Arc<RuntimeInfo>, reader: R)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                runtime.touch_liveness();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<StatusRecord>(line) {
                    Ok(record) => {
                        if record.initstart != 0 || record.initdone != 0 {
                            runtime.set_init_times(record.initstart, record.initdone);
                        }
                    }
                    Err(e) => {
                        debug!(runtime_id = %runtime.runtime_id, error = %e,
                            "unparseable status line");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(runtime_id = %runtime.runtime_id, error = %e,
                    "status channel read failed");
                break;
            }
        }
    }
    debug!(runtime_id = %runtime.runtime_id, "status channel closed");
}

fn header<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
    req.headers().get(name)?.to_str().ok()
}

fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

fn query_param_i64(query: Option<&str>, name: &str) -> i64 {
    query_param(query, name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn switching_protocols() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(http::header::CONNECTION, "upgrade")
        .header(http::header::UPGRADE, "runtime")
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerOptions;
    use crate::request::RequestInfo;

    fn dispatcher_with_runtime(id: &str) -> (Arc<Dispatcher>, Arc<RuntimeInfo>) {
        let manager = Arc::new(RuntimeManager::new(ManagerOptions::default()));
        let runtime = manager.add_runtime(id);
        runtime.activate().unwrap();
        let dispatcher = Dispatcher::new(manager, Arc::new(LogStoreIndex::new()));
        (dispatcher, runtime)
    }

    fn request_for(path: &str, runtime_id: Option<&str>) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().uri(path);
        if let Some(id) = runtime_id {
            builder = builder.header(HEADER_RUNTIME_ID, id);
        }
        builder.body(Full::new(Bytes::new())).unwrap()
    }

    #[test]
    fn test_query_param_parsing() {
        let query = Some("initstart=1700000000000&initdone=1700000000100&concurrentmode=true");
        assert_eq!(query_param_i64(query, "initstart"), 1_700_000_000_000);
        assert_eq!(query_param_i64(query, "initdone"), 1_700_000_000_100);
        assert_eq!(query_param(query, "concurrentmode"), Some("true"));
        assert_eq!(query_param(query, "missing"), None);
        assert_eq!(query_param_i64(None, "initstart"), 0);
    }

    #[tokio::test]
    async fn test_route_rejects_missing_runtime_header() {
        let (dispatcher, _runtime) = dispatcher_with_runtime("rt-1");
        let response = dispatcher.route(request_for("/status", None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_route_rejects_unknown_runtime() {
        let (dispatcher, _runtime) = dispatcher_with_runtime("rt-1");
        let response = dispatcher
            .route(request_for("/status", Some("rt-nope")))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_route_rejects_unknown_path() {
        let (dispatcher, _runtime) = dispatcher_with_runtime("rt-1");
        let response = dispatcher.route(request_for("/nope", Some("rt-1"))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_upgrade_touches_liveness() {
        let (dispatcher, runtime) = dispatcher_with_runtime("rt-1");
        runtime.set_last_liveness(std::time::Instant::now() - Duration::from_secs(3600));

        let response = dispatcher.route(request_for("/status", Some("rt-1"))).await;
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert!(!runtime.is_runner_defunct(std::time::Instant::now(), Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn test_status_lines_refresh_liveness_and_init_times() {
        use tokio::io::AsyncWriteExt;

        let (_dispatcher, runtime) = dispatcher_with_runtime("rt-1");
        runtime.set_last_liveness(std::time::Instant::now() - Duration::from_secs(3600));

        let (mut client, server) = tokio::io::duplex(1024);
        let loop_task = tokio::spawn(run_status_loop(runtime.clone(), server));

        client.write_all(b"{}\n").await.unwrap();
        client
            .write_all(b"{\"initstart\":1700000000000,\"initdone\":1700000000100}\n")
            .await
            .unwrap();
        drop(client);
        loop_task.await.unwrap();

        assert!(!runtime.is_runner_defunct(std::time::Instant::now(), Duration::from_secs(120)));
        assert_eq!(runtime.init_times(), (1_700_000_000_000, 1_700_000_000_100));
    }

    #[tokio::test]
    async fn test_commit_mismatch_is_a_conflict() {
        let (dispatcher, _runtime) = dispatcher_with_runtime("rt-1");
        let req = Request::builder()
            .uri("/status")
            .header(HEADER_RUNTIME_ID, "rt-1")
            .header(HEADER_COMMIT_ID, "commit-x")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = dispatcher.route(req).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_complete_maps_frame_to_terminal_status() {
        let (dispatcher, runtime) = dispatcher_with_runtime("rt-1");
        let request = RequestInfo::new("req-1", &runtime);
        runtime.register_request(request.clone());

        dispatcher.complete(
            &runtime,
            ResponseFrame {
                requestid: "req-1".to_string(),
                success: false,
                result: None,
                error: Some("handler raised".to_string()),
            },
        );
        assert_eq!(request.status(), RequestStatus::Failed);
        assert_eq!(request.outcome().error.as_deref(), Some("handler raised"));

        // A frame for an unknown request is ignored
        dispatcher.complete(
            &runtime,
            ResponseFrame {
                requestid: "req-gone".to_string(),
                success: true,
                result: None,
                error: None,
            },
        );
    }

    #[tokio::test]
    async fn test_stop_runtime_fails_in_flight_requests() {
        let (dispatcher, runtime) = dispatcher_with_runtime("rt-1");
        let request = RequestInfo::new("req-1", &runtime);
        runtime.register_request(request.clone());

        dispatcher.stop_runtime(&runtime);
        assert_eq!(request.status(), RequestStatus::Failed);
        assert_eq!(
            request.outcome().error.as_deref(),
            Some("runtime connection lost")
        );
        assert_eq!(runtime.state(), RuntimeState::Closed);
    }
}
