//! Operator surface for the lane registry.
//!
//! These are the only handlers allowed to mutate lane state, and they do it
//! through the registry's atomic `apply` operation, the same funnel the
//! health-probe and capacity callbacks use.  Protected by the admin bearer
//! token.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::Value;
use tracing::info;

use kiln_core::{
    DiagnosticEventType, FallbackReason, LaneEvent, LaneMode, LaneSnapshot, MemoryDiagnosticEvent,
};

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/lanes", get(list_lanes))
        .route("/lanes/{model}/fallback", post(force_fallback))
        .route("/lanes/{model}/restore", post(restore_lane))
}

/// Snapshot of every execution lane.
#[utoipa::path(
    get,
    path = "/admin/lanes",
    tag = "admin",
    responses((status = 200, description = "All lane snapshots", body = Value))
)]
pub async fn list_lanes(State(state): State<Arc<AppState>>) -> Json<Vec<LaneSnapshot>> {
    let mut lanes = state.lanes.snapshot_all();
    lanes.sort_by(|a, b| a.lane_key.cmp(&b.lane_key));
    Json(lanes)
}

/// Force a lane into degraded-shared routing (`reason = manual`).
#[utoipa::path(
    post,
    path = "/admin/lanes/{model}/fallback",
    tag = "admin",
    params(("model" = String, Path, description = "Lane key / model name")),
    responses(
        (status = 200, description = "Updated lane snapshot", body = Value),
        (status = 404, description = "Unknown lane", body = crate::error::ErrorBody),
    )
)]
pub async fn force_fallback(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> Result<Json<LaneSnapshot>, ServerError> {
    let snapshot = state
        .lanes
        .apply(&model, LaneEvent::ManualFallback, Utc::now())
        .map_err(|e| ServerError::NotFound(e.to_string()))?;

    state.diagnostics.emit(
        MemoryDiagnosticEvent::new(DiagnosticEventType::FallbackActivated, LaneMode::DegradedShared)
            .model(model.as_str())
            .reason(FallbackReason::Manual),
    );
    info!(model = %model, "lane manually forced to degraded routing");
    Ok(Json(snapshot))
}

/// Return a lane to dedicated routing after capacity recovery.
#[utoipa::path(
    post,
    path = "/admin/lanes/{model}/restore",
    tag = "admin",
    params(("model" = String, Path, description = "Lane key / model name")),
    responses(
        (status = 200, description = "Updated lane snapshot", body = Value),
        (status = 404, description = "Unknown lane", body = crate::error::ErrorBody),
    )
)]
pub async fn restore_lane(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> Result<Json<LaneSnapshot>, ServerError> {
    let snapshot = state
        .lanes
        .apply(&model, LaneEvent::CapacityRestored, Utc::now())
        .map_err(|e| ServerError::NotFound(e.to_string()))?;
    info!(model = %model, "lane restored to dedicated routing");
    Ok(Json(snapshot))
}
