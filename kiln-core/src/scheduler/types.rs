use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::TaskKind;
use crate::scheduler::admission::AdmissionRejection;
use crate::scheduler::constraints::ConstraintViolation;
use crate::scheduler::lanes::LaneMode;

/// Unique identifier for a generation task (UUID v4, stored as text).
pub type TaskId = String;

/// Lifecycle state of a [`Task`].
///
/// Transitions are monotonic: `Pending → Processing → {Done | Failed}`.
/// Terminal states are sticky; the store rejects any later transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

/// Generation parameters as submitted by the caller.
///
/// `steps` and `cfg` are checked against the model's fixed values by the
/// constraint validator; everything else is carried opaquely to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    /// Additional model-specific options, forwarded verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One generation request's lifecycle record.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub model: String,
    pub kind: TaskKind,
    /// Routing mode the task was admitted under.
    pub lane_mode: LaneMode,
    pub params: GenerationParams,
    pub status: TaskStatus,
    /// 0–100.
    pub progress: u8,
    /// Set iff `status == Failed`.
    pub error_msg: Option<String>,
    /// Set iff `status == Done`.
    pub result_location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a fresh `Pending` task with a v4 id.
    pub fn new(model: impl Into<String>, kind: TaskKind, lane_mode: LaneMode, params: GenerationParams) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            model: model.into(),
            kind,
            lane_mode,
            params,
            status: TaskStatus::Pending,
            progress: 0,
            error_msg: None,
            result_location: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Errors produced by the task store.
///
/// The store interface is persistence-agnostic; backends wrap their native
/// error (sqlx, io, …) in [`StoreError::Backend`].
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
}

/// Errors produced by the scheduler layer.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The request violates a model's fixed generation parameters.
    #[error(transparent)]
    Validation(#[from] ConstraintViolation),

    /// Degraded-queue admission refused the request.
    #[error(transparent)]
    Overloaded(#[from] AdmissionRejection),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),
}
