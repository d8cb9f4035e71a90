use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use loom_core::error::LoomError;
use loom_core::types::ExecutionId;
use loom_engine::TriggerOutcome;

use crate::state::AppState;

const CORRELATION_HEADER: &str = "x-correlation-id";

/// Map a runtime error onto a status code and a JSON error body.
fn error_response(err: LoomError) -> Response {
    let status = match &err {
        LoomError::EntryPointNotFound(_) | LoomError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
        LoomError::RuntimeNotRunning | LoomError::StreamNotRunning(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        LoomError::SecurityViolation { .. } => StatusCode::BAD_REQUEST,
        LoomError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %err, "Request failed");
    }
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// Empty bodies trigger with `{}`.
fn parse_input(body: &Bytes) -> Result<serde_json::Value, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("invalid JSON body: {}", e) })),
        )
            .into_response()
    })
}

// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// GET /status
pub async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": state.runtime.status(),
        "bind": state.config.bind,
    }))
}

// POST /trigger/{id}
pub async fn trigger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let input = match parse_input(&body) {
        Ok(input) => input,
        Err(response) => return response,
    };
    let correlation_id = headers.get(CORRELATION_HEADER).and_then(|v| v.to_str().ok());

    match state.runtime.trigger(&id, input, correlation_id) {
        Ok(execution_id) => {
            info!(entry_point = %id, execution_id = %execution_id, "Trigger accepted");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "execution_id": execution_id.to_string() })),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
pub struct WaitQuery {
    /// Overrides the runtime's default deadline.
    pub timeout_ms: Option<u64>,
}

// POST /trigger/{id}/wait?timeout_ms=5000
pub async fn trigger_and_wait(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<WaitQuery>,
    body: Bytes,
) -> Response {
    let input = match parse_input(&body) {
        Ok(input) => input,
        Err(response) => return response,
    };
    let timeout = q.timeout_ms.map(Duration::from_millis);

    match state.runtime.trigger_and_wait(&id, input, timeout).await {
        Ok(TriggerOutcome::Completed(result)) => (StatusCode::OK, Json(result)).into_response(),
        Ok(TriggerOutcome::TimedOut { execution_id }) => (
            StatusCode::REQUEST_TIMEOUT,
            Json(json!({
                "status": "timeout",
                "execution_id": execution_id.to_string(),
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

// GET /executions/{id}/{execution_id}
pub async fn execution_result(
    State(state): State<Arc<AppState>>,
    Path((id, execution_id)): Path<(String, String)>,
) -> Response {
    let execution_id = ExecutionId::from_string(&execution_id);
    match state.runtime.get_result(&id, &execution_id).await {
        Some(result) => (StatusCode::OK, Json(result)).into_response(),
        None => error_response(LoomError::ExecutionNotFound(execution_id.to_string())),
    }
}

// POST /stop
pub async fn stop(State(state): State<Arc<AppState>>) -> Response {
    if !state.runtime.is_running() {
        return (StatusCode::OK, Json(json!({ "status": "stopped" }))).into_response();
    }

    let runtime = state.runtime.clone();
    tokio::spawn(async move {
        if let Err(e) = runtime.stop().await {
            warn!(error = %e, "Runtime stop failed");
        }
    });
    info!("Runtime stop requested");
    (StatusCode::ACCEPTED, Json(json!({ "status": "stopping" }))).into_response()
}
