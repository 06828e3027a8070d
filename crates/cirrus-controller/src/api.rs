//! Controller HTTP API
//!
//! The caller-facing surface: synchronous invocation plus pool inspection
//! and health/metrics endpoints. Runtime-facing traffic does not come
//! through here; sandboxes speak to the dispatch server.

use crate::error::ControllerError;
use crate::invoker::Invoker;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use cirrus_meta::{FunctionStore, MetaError};
use cirrus_observability::CirrusMetrics;
use cirrus_rtctrl::{RtctrlError, RuntimeManager};
use cirrus_spec::{InvokeInput, TriggerType};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Caller-supplied request ID; generated when absent
pub const HEADER_REQUEST_ID: &str = "x-cirrus-request-id";
/// Base64 client context forwarded verbatim to the sandbox
pub const HEADER_CLIENT_CONTEXT: &str = "x-cirrus-client-context";

pub struct ApiState {
    pub invoker: Arc<Invoker>,
    pub manager: Arc<RuntimeManager>,
    pub store: Arc<dyn FunctionStore>,
    pub metrics: Arc<CirrusMetrics>,
    pub started: Instant,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/v1/functions/{name}/invocations", post(invoke))
        .route("/v1/runtimes", get(list_runtimes))
        .route("/v1/runtimes/{id}/invalidate", post(invalidate_runtime))
        .route("/v1/resources", get(resources))
        .route("/health/live", get(health))
        .route("/health/ready", get(ready))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct InvokeQuery {
    /// Version number or alias; absent means latest
    qualifier: Option<String>,
}

async fn invoke(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Query(query): Query<InvokeQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request_id = headers
        .get(HEADER_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let event_object = if body.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("event payload is not valid JSON: {e}")))?
    };
    let client_context = headers
        .get(HEADER_CLIENT_CONTEXT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // Unqualified references resolve "latest" fresh every time; pinned
    // versions and aliases are stable enough to serve from cache
    let qualifier = query.qualifier.as_deref();
    let (function, from_cache) = state
        .store
        .get_function(&name, qualifier, qualifier.is_some())
        .await
        .map_err(ControllerError::from)?;
    info!(
        request_id,
        function = %function.function_name,
        version = %function.version,
        from_cache,
        "invocation accepted"
    );

    let response = state
        .invoker
        .invoke_guarded(InvokeInput {
            request_id: request_id.clone(),
            function,
            trigger: TriggerType::Http,
            event_object,
            client_context,
        })
        .await?;

    let mut reply = Json(response).into_response();
    if let Ok(value) = request_id.parse() {
        reply.headers_mut().insert(HEADER_REQUEST_ID, value);
    }
    Ok(reply)
}

async fn list_runtimes(State(state): State<Arc<ApiState>>) -> Response {
    Json(state.manager.runtime_descriptions()).into_response()
}

async fn resources(State(state): State<Arc<ApiState>>) -> Response {
    Json(state.manager.resource_overview()).into_response()
}

/// Flag a runtime abnormal so allocation skips it; the reaper will reset
/// it once its liveness deadline lapses
async fn invalidate_runtime(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let Some(runtime) = state.manager.get(&id) else {
        return Err(ApiError::NotFound(format!("runtime {id} not found")));
    };
    runtime.invalidate();
    info!(runtime_id = %id, "runtime invalidated by operator");
    Ok(StatusCode::NO_CONTENT)
}

async fn health() -> &'static str {
    "ok"
}

/// Ready once the node agent has reported its sandbox inventory; a
/// degraded start with an empty pool cannot serve invocations
async fn ready(State(state): State<Arc<ApiState>>) -> Response {
    if state.manager.is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "runtime pool is empty").into_response()
    } else {
        "ok".into_response()
    }
}

async fn metrics(State(state): State<Arc<ApiState>>) -> Result<Response, ApiError> {
    state
        .metrics
        .uptime_seconds
        .set(state.started.elapsed().as_secs_f64());
    let text = state
        .metrics
        .render()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(([("content-type", "text/plain; version=0.0.4")], text).into_response())
}

/// API-layer error with its HTTP mapping
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    TooBusy(String),
    Upstream(String),
    Timeout(String),
    Internal(String),
}

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        match &err {
            ControllerError::Meta(MetaError::NotFound { .. }) => ApiError::NotFound(err.to_string()),
            ControllerError::Meta(_) => ApiError::Upstream(err.to_string()),
            ControllerError::NoCapacity(_) => ApiError::TooBusy(err.to_string()),
            ControllerError::Rtctrl(RtctrlError::QueueFull { .. }) => {
                ApiError::TooBusy(err.to_string())
            }
            ControllerError::Funclet(_) => ApiError::Upstream(err.to_string()),
            ControllerError::WarmUpTimeout(_) => ApiError::Timeout(err.to_string()),
            ControllerError::Rtctrl(_) | ControllerError::Internal(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::TooBusy(message) => (StatusCode::TOO_MANY_REQUESTS, message),
            ApiError::Upstream(message) => (StatusCode::BAD_GATEWAY, message),
            ApiError::Timeout(message) => (StatusCode::GATEWAY_TIMEOUT, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let err = ApiError::from(ControllerError::NoCapacity("echo".to_string()));
        assert!(matches!(err, ApiError::TooBusy(_)));

        let err = ApiError::from(ControllerError::Meta(MetaError::NotFound {
            kind: "function",
            key: "echo".to_string(),
        }));
        assert!(matches!(err, ApiError::NotFound(_)));

        let err = ApiError::from(ControllerError::Rtctrl(RtctrlError::QueueFull {
            runtime_id: "rt-1".to_string(),
        }));
        assert!(matches!(err, ApiError::TooBusy(_)));

        let err = ApiError::from(ControllerError::WarmUpTimeout("rt-1".to_string()));
        assert!(matches!(err, ApiError::Timeout(_)));
    }
}
