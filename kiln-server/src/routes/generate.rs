//! Generation submission (`POST /generate`).
//!
//! Validation order is a hard contract: request shape, then the model's
//! fixed parameters, and only then any lane or queue state.  A rejected
//! request never creates a task.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use kiln_core::{DispatchOutcome, GenerationParams, GenerationRequest};

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/generate", post(generate))
}

/// Request body for `POST /generate`.
#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
pub struct GenerateRequest {
    /// Catalog model identifier.
    #[validate(length(min = 1))]
    pub model: String,
    #[validate(nested)]
    pub parameters: ParamsBody,
}

/// Generation parameters.  `steps` / `cfg` are checked against the model's
/// fixed values by the scheduler.
#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
pub struct ParamsBody {
    #[validate(length(min = 1, max = 2000))]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    /// Additional model-specific options, forwarded verbatim to the worker.
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl From<ParamsBody> for GenerationParams {
    fn from(body: ParamsBody) -> Self {
        GenerationParams {
            prompt: body.prompt,
            steps: body.steps,
            cfg: body.cfg,
            seed: body.seed,
            extra: body.extra,
        }
    }
}

/// `202` response body.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct GenerateAccepted {
    pub task_id: String,
    /// Always `"pending"` at submission time.
    pub status: String,
}

/// Submit a generation request.
///
/// Routed to the model's dedicated lane when it is warm and available, or
/// admitted into the bounded degraded queue otherwise.
#[utoipa::path(
    post,
    path = "/generate",
    tag = "generate",
    request_body = GenerateRequest,
    responses(
        (status = 202, description = "Task accepted", body = GenerateAccepted),
        (status = 422, description = "Fixed-parameter violation", body = crate::error::ErrorBody),
        (status = 503, description = "Degraded queue overloaded", body = crate::error::ErrorBody),
    )
)]
pub async fn generate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> Result<impl IntoResponse, ServerError> {
    req.validate()
        .map_err(|e| ServerError::Validation(e.to_string()))?;

    let outcome = state
        .router
        .dispatch(GenerationRequest {
            model: req.model,
            params: req.parameters.into(),
        })
        .await?;

    match outcome {
        DispatchOutcome::AcceptedDedicated { task_id }
        | DispatchOutcome::AcceptedDegraded { task_id } => Ok((
            StatusCode::ACCEPTED,
            Json(GenerateAccepted {
                task_id,
                status: "pending".to_owned(),
            }),
        )),
        DispatchOutcome::RejectedInvalid(violation) => Err(violation.into()),
        DispatchOutcome::RejectedOverloaded(rejection) => Err(rejection.into()),
    }
}
