//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`].  All non-2xx responses carry the same
//! machine-readable triple: `{code, detail, user_action}`.
//!
//! **Security note:** Internal errors (store, database, worker plumbing) are
//! logged with full detail but only a generic message is returned to the
//! caller so that file paths, SQL, or other implementation details never
//! leak to clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;
use utoipa::ToSchema;

use kiln_core::{AdmissionRejection, ConstraintViolation, SchedulerError, StoreError};

/// The error body contract.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Machine-readable code, e.g. `"validation_error"`.
    pub code: &'static str,
    /// Human-readable description of what went wrong.
    pub detail: String,
    /// What the caller can do about it.
    pub user_action: &'static str,
}

/// All errors that can occur in the kiln-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Fixed-parameter (or request-shape) violation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Degraded-queue depth or wait breach.
    #[error("queue overloaded: {0}")]
    Overloaded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    /// Propagated from the task store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Propagated from sqlx directly (connection setup and the like).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An unclassified internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ConstraintViolation> for ServerError {
    fn from(v: ConstraintViolation) -> Self {
        ServerError::Validation(v.to_string())
    }
}

impl From<AdmissionRejection> for ServerError {
    fn from(r: AdmissionRejection) -> Self {
        ServerError::Overloaded(r.to_string())
    }
}

impl From<SchedulerError> for ServerError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Validation(v) => v.into(),
            SchedulerError::Overloaded(r) => r.into(),
            SchedulerError::TaskNotFound(id) => ServerError::NotFound(format!("task {id} not found")),
            SchedulerError::Store(e) => ServerError::Store(e),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ServerError::Validation(detail) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorBody {
                    code: "validation_error",
                    detail: detail.clone(),
                    user_action: "Use the model's fixed generation parameters and resubmit.",
                },
            ),
            ServerError::Overloaded(detail) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    code: "queue_overloaded",
                    detail: detail.clone(),
                    user_action: "The system is saturated; retry after a short backoff.",
                },
            ),
            ServerError::NotFound(detail) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    code: "not_found",
                    detail: detail.clone(),
                    user_action: "Check the identifier and try again.",
                },
            ),
            ServerError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    code: "unauthorized",
                    detail: "missing or invalid credentials".to_owned(),
                    user_action: "Provide a valid API key.",
                },
            ),
            ServerError::Store(e) => {
                error!(error = %e, "task store error");
                internal_body()
            }
            ServerError::Database(e) => {
                error!(error = %e, "database error");
                internal_body()
            }
            ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                internal_body()
            }
        };
        (status, Json(body)).into_response()
    }
}

fn internal_body() -> (StatusCode, ErrorBody) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorBody {
            code: "internal_error",
            detail: "internal server error".to_owned(),
            user_action: "Retry later; contact the operator if the problem persists.",
        },
    )
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        error!(error = ?e, "converting anyhow error to ServerError::Internal");
        ServerError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_rejections_map_to_client_errors() {
        let e: ServerError = ConstraintViolation::UnknownModel {
            model: "x".to_owned(),
        }
        .into();
        assert!(matches!(e, ServerError::Validation(_)));

        let e: ServerError = AdmissionRejection::DepthExceeded { max_depth: 25 }.into();
        assert!(matches!(e, ServerError::Overloaded(_)));
    }
}
