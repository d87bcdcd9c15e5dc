//! Worker-facing callbacks.
//!
//! GPU workers report generation progress here while a task is
//! `processing`.  Shares the admin bearer token; workers hold the same
//! service credential as operators.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use kiln_core::TaskStore;

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/internal/tasks/{task_id}/progress", post(report_progress))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ProgressReport {
    /// 0–100.
    pub progress: u8,
}

/// Record worker-reported progress for a running task.  Ignored once the
/// task is terminal.
#[utoipa::path(
    post,
    path = "/internal/tasks/{task_id}/progress",
    tag = "internal",
    params(("task_id" = String, Path, description = "Task identifier")),
    request_body = ProgressReport,
    responses(
        (status = 204, description = "Progress recorded"),
        (status = 404, description = "Unknown task", body = crate::error::ErrorBody),
    )
)]
pub async fn report_progress(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Json(report): Json<ProgressReport>,
) -> Result<StatusCode, ServerError> {
    if state.store.get(&task_id).await?.is_none() {
        return Err(ServerError::NotFound(format!("task {task_id} not found")));
    }
    state.store.set_progress(&task_id, report.progress).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use crate::routes::testing::{body_json, post_json, test_app};
    use axum::http::StatusCode;
    use kiln_core::{TaskStatus, TaskStore};
    use std::time::Duration;
    use tower::ServiceExt;

    #[tokio::test]
    async fn progress_report_for_unknown_task_is_404() {
        let rig = test_app().await;
        let response = rig
            .app
            .clone()
            .oneshot(post_json(
                "/internal/tasks/missing/progress",
                serde_json::json!({ "progress": 40 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "not_found");
    }

    #[tokio::test]
    async fn progress_report_updates_a_running_task() {
        let rig = test_app().await;
        rig.gate.close();

        let response = rig
            .app
            .clone()
            .oneshot(post_json(
                "/generate",
                serde_json::json!({
                    "model": "sdxl-turbo",
                    "parameters": { "prompt": "harbour" }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let task_id = body_json(response).await["task_id"].as_str().unwrap().to_owned();

        // Wait for the execution future to mark the task processing.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let task = rig.state.store.get(&task_id).await.unwrap().unwrap();
                if task.status == TaskStatus::Processing {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task should start");

        let response = rig
            .app
            .clone()
            .oneshot(post_json(
                &format!("/internal/tasks/{task_id}/progress"),
                serde_json::json!({ "progress": 55 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let task = rig.state.store.get(&task_id).await.unwrap().unwrap();
        assert_eq!(task.progress, 55);

        rig.gate.open();
    }
}
