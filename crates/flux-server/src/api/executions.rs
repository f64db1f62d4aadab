//! Execution routes: run, status, events, stream, resume, cancel

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use flux_core::{Event, FluxError};
use flux_storage::ExecutionRecord;

use super::{ApiError, ApiResult, AppState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Async,
    Sync,
    Stream,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub workflow_name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub execution_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ExecutionResponse {
    #[serde(flatten)]
    pub record: ExecutionRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<Event>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub detailed: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub mode: CancelMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    #[default]
    Async,
    Sync,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/executions", post(run))
        .route("/v1/executions/:id", get(status))
        .route("/v1/executions/:id/events", get(list_events))
        .route("/v1/executions/:id/stream", get(stream_events))
        .route("/v1/executions/:id/resume", post(resume))
        .route("/v1/executions/:id/cancel", post(cancel))
        .with_state(state)
}

/// POST /v1/executions - start a workflow execution
///
/// `mode=async` returns the execution id immediately, `mode=sync` waits for
/// the terminal state, `mode=stream` responds with the live event stream.
async fn run(State(state): State<AppState>, Json(request): Json<RunRequest>) -> Response {
    let record = match state
        .executions
        .run(&request.workflow_name, request.input, request.priority)
        .await
    {
        Ok(record) => record,
        Err(error) => return ApiError(error).into_response(),
    };

    match request.mode {
        RunMode::Async => Json(RunResponse {
            execution_id: record.execution_id,
        })
        .into_response(),
        RunMode::Sync => match state
            .executions
            .wait_terminal(record.execution_id, None)
            .await
        {
            Ok(record) => Json(ExecutionResponse {
                record,
                events: None,
            })
            .into_response(),
            Err(error) => ApiError(error).into_response(),
        },
        RunMode::Stream => match event_stream(&state, record.execution_id).await {
            Ok(sse) => sse.into_response(),
            Err(error) => ApiError(error).into_response(),
        },
    }
}

/// GET /v1/executions/{id}?detailed= - execution record, optionally with
/// the full event log
async fn status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<ExecutionResponse>> {
    let record = state.executions.get(id).await?;
    let events = if query.detailed {
        Some(state.executions.events(id).await?)
    } else {
        None
    };
    Ok(Json(ExecutionResponse { record, events }))
}

/// GET /v1/executions/{id}/events - the stored event log
async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Event>>> {
    // Surface not_found for unknown executions rather than an empty log
    state.executions.get(id).await?;
    Ok(Json(state.executions.events(id).await?))
}

/// GET /v1/executions/{id}/stream - SSE feed of events, replay then live
async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    state.executions.get(id).await?;
    event_stream(&state, id).await.map_err(ApiError)
}

async fn event_stream(
    state: &AppState,
    id: Uuid,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, FluxError> {
    let (stored, live) = state.executions.stream_events(id).await?;

    let live = BroadcastStream::new(live).filter_map(|item| async { item.ok() });
    let combined = sequenced_events(stream::iter(stored).chain(live)).map(|event| {
        let sse = SseEvent::default()
            .event(event.kind.to_string())
            .data(serde_json::to_string(&event).unwrap_or_default());
        Ok(sse)
    });

    Ok(Sse::new(combined).keep_alive(KeepAlive::default()))
}

/// Pass events in sequence order exactly once, closing after the terminal
/// event.
///
/// The live subscription is opened before the stored prefix is loaded, so
/// an event appended in that window arrives twice: once in the stored
/// snapshot and again on the broadcast feed. Tracking the next expected
/// sequence from 0 drops any redelivery of an already-emitted sequence,
/// wherever it came from.
fn sequenced_events<S>(events: S) -> impl Stream<Item = Event>
where
    S: Stream<Item = Event>,
{
    events
        .scan(0u64, |next, event| {
            let pass = event.sequence >= *next;
            if pass {
                *next = event.sequence + 1;
            }
            futures::future::ready(Some((pass, event)))
        })
        .filter_map(|(pass, event)| async move { pass.then_some(event) })
        .scan(false, |done, event| {
            if *done {
                return futures::future::ready(None);
            }
            *done = event.kind.is_terminal();
            futures::future::ready(Some(event))
        })
}

/// POST /v1/executions/{id}/resume - only valid while paused
async fn resume(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ExecutionResponse>> {
    let record = state.executions.resume(id).await?;
    Ok(Json(ExecutionResponse {
        record,
        events: None,
    }))
}

/// POST /v1/executions/{id}/cancel - request cancellation
async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<Json<ExecutionResponse>> {
    let record = state
        .executions
        .cancel(id, request.mode == CancelMode::Sync)
        .await?;
    Ok(Json(ExecutionResponse {
        record,
        events: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_core::{EventKind, ScopePath};
    use serde_json::json;

    fn ev(seq: u64, kind: EventKind) -> Event {
        Event::new(Uuid::nil(), seq, kind, &ScopePath::root("wf"), json!(null))
    }

    async fn sequences_of(events: Vec<Event>) -> Vec<u64> {
        sequenced_events(stream::iter(events))
            .map(|e| e.sequence)
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_live_redelivery_of_stored_events_is_dropped() {
        // Sequences 1 and 2 were appended between subscribe and load, so
        // they show up in the stored snapshot and again on the live feed.
        let events = vec![
            ev(0, EventKind::WorkflowStarted),
            ev(1, EventKind::TaskStarted),
            ev(2, EventKind::TaskCompleted),
            ev(1, EventKind::TaskStarted),
            ev(2, EventKind::TaskCompleted),
            ev(3, EventKind::WorkflowCompleted),
        ];

        assert_eq!(sequences_of(events).await, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stream_closes_after_terminal_event() {
        let events = vec![
            ev(0, EventKind::WorkflowStarted),
            ev(1, EventKind::WorkflowCompleted),
            ev(2, EventKind::TaskStarted),
        ];

        let kinds: Vec<EventKind> = sequenced_events(stream::iter(events))
            .map(|e| e.kind)
            .collect()
            .await;
        assert_eq!(
            kinds,
            vec![EventKind::WorkflowStarted, EventKind::WorkflowCompleted]
        );
    }

    #[tokio::test]
    async fn test_live_only_events_pass_in_order() {
        let events = vec![
            ev(0, EventKind::WorkflowStarted),
            ev(0, EventKind::WorkflowStarted),
            ev(1, EventKind::TaskStarted),
            ev(2, EventKind::TaskCompleted),
        ];

        assert_eq!(sequences_of(events).await, vec![0, 1, 2]);
    }
}
