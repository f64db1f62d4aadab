//! Schedule routes

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use flux_core::FluxError;
use flux_storage::{CatchUpPolicy, ScheduleRecord, ScheduleTrigger};

use crate::scheduler::{next_fire, validate_trigger};

use super::{ApiResult, AppState, ListResponse};

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub workflow_name: String,
    pub trigger: ScheduleTrigger,
    #[serde(default)]
    pub input_template: Value,
    #[serde(default)]
    pub allow_overlap: bool,
    #[serde(default)]
    pub catch_up: CatchUpPolicy,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/schedules", post(create_schedule).get(list_schedules))
        .route("/v1/schedules/:id", get(get_schedule).delete(delete_schedule))
        .route("/v1/schedules/:id/enable", post(enable_schedule))
        .route("/v1/schedules/:id/disable", post(disable_schedule))
        .with_state(state)
}

/// POST /v1/schedules - create a schedule for a registered workflow
async fn create_schedule(
    State(state): State<AppState>,
    Json(request): Json<CreateScheduleRequest>,
) -> ApiResult<Json<ScheduleRecord>> {
    validate_trigger(&request.trigger)?;
    // The workflow must exist up front; versions resolve at fire time
    state.catalog.get(&request.workflow_name, None).await?;

    let mut record = ScheduleRecord::new(request.workflow_name, request.trigger);
    record.input_template = request.input_template;
    record.allow_overlap = request.allow_overlap;
    record.catch_up = request.catch_up;
    record.next_fire_at = next_fire(&record.trigger, Utc::now())?;

    state
        .schedules
        .create(record.clone())
        .await
        .map_err(FluxError::from)?;
    Ok(Json(record))
}

/// GET /v1/schedules
async fn list_schedules(
    State(state): State<AppState>,
) -> ApiResult<Json<ListResponse<ScheduleRecord>>> {
    let records = state.schedules.list().await.map_err(FluxError::from)?;
    Ok(Json(records.into()))
}

/// GET /v1/schedules/{id}
async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ScheduleRecord>> {
    let record = state.schedules.get(id).await.map_err(FluxError::from)?;
    Ok(Json(record))
}

async fn set_enabled(state: &AppState, id: Uuid, enabled: bool) -> Result<ScheduleRecord, FluxError> {
    let mut record = state.schedules.get(id).await.map_err(FluxError::from)?;
    record.enabled = enabled;
    if enabled {
        // Re-arm from now; a long-disabled schedule should not backfill
        record.next_fire_at = next_fire(&record.trigger, Utc::now())?;
    }
    state
        .schedules
        .update(&record)
        .await
        .map_err(FluxError::from)?;
    Ok(record)
}

/// POST /v1/schedules/{id}/enable
async fn enable_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ScheduleRecord>> {
    Ok(Json(set_enabled(&state, id, true).await?))
}

/// POST /v1/schedules/{id}/disable
async fn disable_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ScheduleRecord>> {
    Ok(Json(set_enabled(&state, id, false).await?))
}

/// DELETE /v1/schedules/{id}
async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.schedules.delete(id).await.map_err(FluxError::from)?;
    Ok(Json(serde_json::json!({"deleted": id})))
}
