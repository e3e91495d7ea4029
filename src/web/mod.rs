//! HTTP surface
//!
//! Operational endpoints (health, stats, manual dispatch), the provider
//! webhook, and the worker-facing registration, heartbeat and room
//! acknowledgement routes.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::core::{CallRoom, DispatchError, Worker, WorkerHealth};
use crate::ingest::IngestOutcome;
use crate::orchestrator::Orchestrator;
use crate::stats::StatsSnapshot;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub enum WebError {
    Dispatch(DispatchError),
    Input(String),
}

impl From<DispatchError> for WebError {
    fn from(err: DispatchError) -> Self {
        WebError::Dispatch(err)
    }
}

impl WebError {
    fn status(&self) -> StatusCode {
        match self {
            WebError::Input(_) => StatusCode::UNPROCESSABLE_ENTITY,
            WebError::Dispatch(err) => match err {
                DispatchError::WorkerNotFound(_) | DispatchError::RoomNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                DispatchError::MalformedEvent(_) | DispatchError::InvalidConfig(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                DispatchError::DuplicateWorker(_) | DispatchError::InvalidTransition { .. } => {
                    StatusCode::CONFLICT
                }
                DispatchError::CapacityExceeded(_)
                | DispatchError::WorkerUnavailable(_)
                | DispatchError::HealthCheckStale(_) => StatusCode::SERVICE_UNAVAILABLE,
                DispatchError::DispatchAttemptsExhausted { .. }
                | DispatchError::QueueError(_)
                | DispatchError::LockError(_)
                | DispatchError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
                DispatchError::TargetError(_) => StatusCode::BAD_GATEWAY,
            },
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, code) = match self {
            WebError::Input(msg) => (msg, "input_error".to_string()),
            WebError::Dispatch(err) => (err.to_string(), err.code().to_string()),
        };
        if status.is_server_error() {
            warn!(%status, code = %code, error = %message, "request failed");
        }

        let body = Json(ErrorResponse {
            error: message,
            code,
        });
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WebError>;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

pub fn build_router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/stats", get(stats))
        .route("/manual/dispatch", post(manual_dispatch))
        .route("/webhooks/livekit", post(webhook))
        .route("/workers", get(list_workers).post(register_worker))
        .route("/workers/:worker_id/heartbeat", post(heartbeat))
        .route("/rooms/:room_id", get(room_status))
        .route("/rooms/:room_id/ack", post(acknowledge_room))
        .route("/rooms/:room_id/complete", post(complete_room))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { orchestrator })
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "status": "healthy" }))
}

async fn stats(State(state): State<AppState>) -> Result<Json<StatsSnapshot>> {
    Ok(Json(state.orchestrator.stats().await?))
}

#[derive(Debug, Deserialize)]
pub struct ManualDispatchParams {
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub participant_identity: String,
}

#[derive(Debug, Serialize)]
struct DispatchAccepted {
    ok: bool,
    #[serde(flatten)]
    outcome: IngestOutcome,
}

async fn manual_dispatch(
    State(state): State<AppState>,
    Query(params): Query<ManualDispatchParams>,
) -> Result<Json<DispatchAccepted>> {
    let outcome = state
        .orchestrator
        .manual_dispatch(&params.room, &params.participant_identity)
        .await?;
    Ok(Json(DispatchAccepted { ok: true, outcome }))
}

/// Always answers 200 so the provider never retries on our account.
async fn webhook(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    match state.orchestrator.ingest_webhook(&body).await {
        Ok(outcome) => Json(json!({ "ok": true, "outcome": outcome })),
        Err(err) => {
            warn!(error = %err, "webhook not accepted");
            Json(json!({ "ok": false, "err": err.to_string(), "code": err.code() }))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker_id: String,
    pub max_capacity: u32,
    #[serde(default)]
    pub endpoint: Option<String>,
}

async fn register_worker(
    State(state): State<AppState>,
    Json(request): Json<RegisterWorkerRequest>,
) -> Result<(StatusCode, Json<Worker>)> {
    let endpoint = request.endpoint.filter(|url| !url.trim().is_empty());
    if let Some(url) = &endpoint
        && !(url.starts_with("http://") || url.starts_with("https://"))
    {
        return Err(WebError::Input(format!("endpoint '{}' must be an http(s) URL", url)));
    }
    let worker = state
        .orchestrator
        .register_worker(&request.worker_id, request.max_capacity, endpoint)?;
    Ok((StatusCode::CREATED, Json(worker)))
}

async fn list_workers(State(state): State<AppState>) -> Result<Json<Vec<Worker>>> {
    Ok(Json(state.orchestrator.workers()?))
}

#[derive(Debug, Serialize)]
struct HeartbeatAck {
    worker_id: String,
    health: WorkerHealth,
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> Result<Json<HeartbeatAck>> {
    let health = state.orchestrator.heartbeat(&worker_id)?;
    Ok(Json(HeartbeatAck { worker_id, health }))
}

async fn room_status(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<CallRoom>> {
    Ok(Json(state.orchestrator.room(&room_id)?))
}

async fn acknowledge_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<CallRoom>> {
    Ok(Json(state.orchestrator.acknowledge(&room_id)?))
}

async fn complete_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<CallRoom>> {
    Ok(Json(state.orchestrator.complete(&room_id)?))
}
