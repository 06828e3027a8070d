//! Stream-mode invocation transport
//!
//! Instead of the JSON-framed generic protocol, stream-mode functions get
//! the proxied request delivered as a native HTTP/1.1 request over a Unix
//! socket dedicated to the sandbox. Connection failures are retried with
//! linear backoff until the per-invocation retry deadline, except that an
//! upstream timeout cancels the attempt immediately.

use crate::error::{Result, RtctrlError};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

/// First retry delay; grows linearly by this step
pub const STREAM_RETRY_STEP: Duration = Duration::from_millis(100);
/// Backoff cap
pub const STREAM_RETRY_MAX: Duration = Duration::from_secs(1);

/// Well-known stream-mode socket name inside a sandbox's runtime directory
const RUNTIME_HTTP_SOCKET: &str = ".runtime-http.sock";

/// Path of a sandbox's stream-mode socket under the runtime socket dir
pub fn runtime_socket_path(dir: &Path, runtime_id: &str) -> PathBuf {
    dir.join(runtime_id).join(RUNTIME_HTTP_SOCKET)
}

/// A proxied request ready for HTTP passthrough
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub method: http::Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// The sandbox's HTTP reply
#[derive(Debug, Clone)]
pub struct StreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Deliver one stream-mode invocation, retrying with linear backoff.
///
/// `cancel` fires when the upstream invocation timeout elapses; it aborts
/// both in-flight attempts and backoff sleeps.
pub async fn invoke_stream(
    socket: &Path,
    request_id: &str,
    request: &StreamRequest,
    retry_deadline: Instant,
    cancel: &mut mpsc::Receiver<()>,
) -> Result<StreamResponse> {
    let mut backoff = STREAM_RETRY_STEP;
    loop {
        let attempt = send_once(socket, request);
        tokio::pin!(attempt);
        let result = tokio::select! {
            result = &mut attempt => result,
            _ = cancel.recv() => {
                return Err(RtctrlError::Canceled {
                    request_id: request_id.to_string(),
                });
            }
        };

        let err = match result {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        if Instant::now() >= retry_deadline {
            tracing::warn!(
                request_id,
                error = %err,
                "stream invocation retries exhausted"
            );
            return Err(RtctrlError::RetryDeadline {
                request_id: request_id.to_string(),
            });
        }
        tracing::debug!(request_id, error = %err, backoff_ms = backoff.as_millis() as u64,
            "stream invocation attempt failed, retrying");

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = cancel.recv() => {
                return Err(RtctrlError::Canceled {
                    request_id: request_id.to_string(),
                });
            }
        }
        backoff = (backoff + STREAM_RETRY_STEP).min(STREAM_RETRY_MAX);
    }
}

async fn send_once(socket: &Path, request: &StreamRequest) -> Result<StreamResponse> {
    let stream = UnixStream::connect(socket).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| transport_error(socket, e))?;

    // Drive the connection until the exchange completes
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "stream-mode connection closed with error");
        }
    });

    let mut builder = http::Request::builder()
        .method(request.method.clone())
        .uri(&request.path);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    let req = builder
        .body(Full::new(request.body.clone()))
        .map_err(|e| transport_error(socket, e))?;

    let response = sender
        .send_request(req)
        .await
        .map_err(|e| transport_error(socket, e))?;

    let (parts, body) = response.into_parts();
    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = body
        .collect()
        .await
        .map_err(|e| transport_error(socket, e))?
        .to_bytes();

    Ok(StreamResponse {
        status: parts.status.as_u16(),
        headers,
        body,
    })
}

fn transport_error(socket: &Path, err: impl std::fmt::Display) -> RtctrlError {
    RtctrlError::Transport {
        runtime_id: socket.display().to_string(),
        reason: err.to_string(),
    }
}
