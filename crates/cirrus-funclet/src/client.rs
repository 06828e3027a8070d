//! Funclet RPC client
//!
//! The funclet is the per-node agent that owns sandbox processes. The
//! controller drives it over a Unix socket with a small REST surface; every
//! call is request/response JSON with a hard timeout. Warm-up gets a longer
//! budget than the rest because it pulls code into the sandbox.

use crate::error::{FuncletError, Result};
use crate::types::{
    CoolDownParams, FuncletAck, NodeInfo, RebornParams, RunnerInfo, WarmUpParams,
};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::debug;

/// Default budget for lightweight funclet calls
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// Budget for warm-up, which loads function code into the sandbox
pub const WARM_UP_TIMEOUT: Duration = Duration::from_secs(30);

/// RPC surface of the node agent
#[async_trait]
pub trait FuncletClient: Send + Sync {
    async fn node_info(&self) -> Result<NodeInfo>;
    async fn list_runtimes(&self) -> Result<Vec<RunnerInfo>>;
    async fn runtime_info(&self, runtime_id: &str) -> Result<RunnerInfo>;
    async fn warm_up(&self, params: &WarmUpParams) -> Result<FuncletAck>;
    async fn cool_down(&self, params: &CoolDownParams) -> Result<FuncletAck>;
    async fn reborn(&self, params: &RebornParams) -> Result<FuncletAck>;
}

/// Funclet client over the node-local Unix socket
pub struct UdsFuncletClient {
    socket: PathBuf,
    call_timeout: Duration,
    warm_up_timeout: Duration,
}

impl UdsFuncletClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            warm_up_timeout: WARM_UP_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, call: Duration, warm_up: Duration) -> Self {
        self.call_timeout = call;
        self.warm_up_timeout = warm_up;
        self
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn call<B, T>(
        &self,
        name: &'static str,
        method: Method,
        path: &str,
        body: Option<&B>,
        timeout: Duration,
    ) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let fut = self.send(method, path, body);
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(FuncletError::Timeout {
                call: name,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let stream = UnixStream::connect(&self.socket).await?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| FuncletError::Transport(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "funclet connection closed with error");
            }
        });

        let payload = match body {
            Some(body) => Bytes::from(serde_json::to_vec(body)?),
            None => Bytes::new(),
        };
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::HOST, "funclet")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Full::new(payload))
            .map_err(|e| FuncletError::Transport(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| FuncletError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| FuncletError::Transport(e.to_string()))?
            .to_bytes();

        if status != StatusCode::OK {
            return Err(FuncletError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl FuncletClient for UdsFuncletClient {
    async fn node_info(&self) -> Result<NodeInfo> {
        self.call::<(), _>("node_info", Method::GET, "/node", None, self.call_timeout)
            .await
    }

    async fn list_runtimes(&self) -> Result<Vec<RunnerInfo>> {
        self.call::<(), _>(
            "list_runtimes",
            Method::GET,
            "/runtimes",
            None,
            self.call_timeout,
        )
        .await
    }

    async fn runtime_info(&self, runtime_id: &str) -> Result<RunnerInfo> {
        let path = format!("/runtimes/{runtime_id}");
        self.call::<(), _>("runtime_info", Method::GET, &path, None, self.call_timeout)
            .await
    }

    async fn warm_up(&self, params: &WarmUpParams) -> Result<FuncletAck> {
        self.call(
            "warm_up",
            Method::POST,
            "/runtimes/warmup",
            Some(params),
            self.warm_up_timeout,
        )
        .await
    }

    async fn cool_down(&self, params: &CoolDownParams) -> Result<FuncletAck> {
        self.call(
            "cool_down",
            Method::POST,
            "/runtimes/cooldown",
            Some(params),
            self.call_timeout,
        )
        .await
    }

    async fn reborn(&self, params: &RebornParams) -> Result<FuncletAck> {
        self.call(
            "reborn",
            Method::POST,
            "/runtimes/reborn",
            Some(params),
            self.call_timeout,
        )
        .await
    }
}
