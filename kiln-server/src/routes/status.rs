//! Task status polling (`GET /status/{task_id}`).
//!
//! Pull-based: the response reflects the persisted task row, which both the
//! worker callback path and the stale-task reaper update with a single
//! write.  Status values are exactly `pending|processing|done|failed`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use kiln_core::{TaskStatus, TaskStore};

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/status/{task_id}", get(get_status))
}

/// Response body for `GET /status/{task_id}`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    #[schema(value_type = String, example = "processing")]
    pub status: TaskStatus,
    /// 0–100.
    pub progress: u8,
    /// Present iff the task failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

/// Poll one task's lifecycle state.
#[utoipa::path(
    get,
    path = "/status/{task_id}",
    tag = "status",
    params(("task_id" = String, Path, description = "Task identifier returned by POST /generate")),
    responses(
        (status = 200, description = "Current task state", body = StatusResponse),
        (status = 404, description = "Unknown task", body = crate::error::ErrorBody),
    )
)]
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<StatusResponse>, ServerError> {
    let task = state
        .store
        .get(&task_id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("task {task_id} not found")))?;

    Ok(Json(StatusResponse {
        status: task.status,
        progress: task.progress,
        error_msg: task.error_msg,
    }))
}

#[cfg(test)]
mod tests {
    use crate::routes::testing::{body_json, test_app};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn unknown_task_is_404_with_the_error_triple() {
        let rig = test_app().await;
        let response = rig
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/status/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["code"], "not_found");
        assert!(body["detail"].as_str().unwrap().contains("does-not-exist"));
        assert!(body["user_action"].as_str().is_some());
    }
}
