//! Worker transport routes: registration, the SSE command stream, and the
//! checkpoint callbacks
//!
//! All routes after registration are authenticated by the Bearer session
//! token issued in the `REGISTER_ACK`.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use flux_core::FluxError;
use flux_protocol::{
    CheckpointAck, CheckpointPayload, HeartbeatPayload, RegisterAck, RegisterRequest,
    WorkerGateway,
};
use flux_storage::{WorkerRecord, WorkerStatus};

use super::{ApiResult, AppState, ListResponse};

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/workers", get(list_workers))
        .route("/v1/workers/register", post(register))
        .route("/v1/workers/:id/stream", get(stream))
        .route("/v1/workers/:id/heartbeat", post(heartbeat))
        .route("/v1/workers/:id/checkpoint", post(checkpoint))
        .route("/v1/workers/:id/drain", post(drain))
        .route("/v1/workers/:id", delete(deregister))
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Result<String, FluxError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or_else(|| FluxError::validation("missing bearer session token"))
}

#[derive(Debug, Serialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub session_name: String,
    pub status: WorkerStatus,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

impl From<WorkerRecord> for WorkerSummary {
    fn from(record: WorkerRecord) -> Self {
        Self {
            worker_id: record.worker_id,
            session_name: record.session_name,
            status: record.status,
            last_seen: record.last_seen,
        }
    }
}

/// GET /v1/workers - admin view of the registry
async fn list_workers(
    State(state): State<AppState>,
) -> ApiResult<Json<ListResponse<WorkerSummary>>> {
    let records = state.registry.list().await?;
    Ok(Json(
        records
            .into_iter()
            .map(WorkerSummary::from)
            .collect::<Vec<_>>()
            .into(),
    ))
}

/// POST /v1/workers/register
async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Json<RegisterAck>> {
    Ok(Json(state.gateway.register(request).await?))
}

/// GET /v1/workers/{id}/stream - the server-pushed execution stream
///
/// Commands are SSE messages whose data is the protocol envelope.
async fn stream(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let token = bearer_token(&headers)?;
    let rx = state.gateway.open_stream(&worker_id, &token).await?;

    let stream = ReceiverStream::new(rx).filter_map(|command| async move {
        let envelope = command.to_envelope().ok()?;
        let sse = SseEvent::default()
            .event(format!("{:?}", envelope.message_type))
            .data(serde_json::to_string(&envelope).ok()?);
        Some(Ok(sse))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// POST /v1/workers/{id}/heartbeat
async fn heartbeat(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<HeartbeatPayload>,
) -> ApiResult<Json<serde_json::Value>> {
    let token = bearer_token(&headers)?;
    state
        .gateway
        .heartbeat(&worker_id, &token, payload.in_flight)
        .await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

#[derive(Debug, serde::Deserialize)]
pub struct CheckpointRequest {
    pub execution_id: Uuid,
    #[serde(flatten)]
    pub payload: CheckpointPayload,
}

/// POST /v1/workers/{id}/checkpoint - deliver newly produced events
async fn checkpoint(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CheckpointRequest>,
) -> ApiResult<Json<CheckpointAck>> {
    let token = bearer_token(&headers)?;
    let ack = state
        .gateway
        .checkpoint(
            &worker_id,
            &token,
            request.execution_id,
            request.payload.events,
        )
        .await?;
    Ok(Json(ack))
}

/// POST /v1/workers/{id}/drain
async fn drain(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let token = bearer_token(&headers)?;
    state.gateway.drain(&worker_id, &token).await?;
    Ok(Json(serde_json::json!({"draining": worker_id})))
}

/// DELETE /v1/workers/{id}
async fn deregister(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let token = bearer_token(&headers)?;
    state.gateway.deregister(&worker_id, &token).await?;
    Ok(Json(serde_json::json!({"deregistered": worker_id})))
}
