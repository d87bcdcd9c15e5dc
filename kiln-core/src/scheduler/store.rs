//! Task persistence interface.
//!
//! The scheduler reads and writes task records through [`TaskStore`] but
//! does not own the persistence engine; the server wires in a SQLite
//! implementation, tests use [`MemoryTaskStore`].
//!
//! The store is where the lifecycle invariants live, not caller discipline:
//! transitions are monotonic (`pending → processing → {done | failed}`) and
//! terminal states are sticky.  `mark_processing`, `complete` and `fail`
//! return whether the transition was applied; applying either terminal
//! transition to an already-terminal task is a no-op (`Ok(false)`), never an
//! error, which makes the reaper and worker completion callbacks idempotent
//! against each other.
//!
//! All trait methods use `impl Future` signatures so no extra `async-trait`
//! box is needed (stable since Rust 1.75).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::scheduler::types::{StoreError, Task, TaskStatus};

pub trait TaskStore: Send + Sync + 'static {
    /// Persist a freshly admitted task (status `pending`).
    fn insert(&self, task: Task) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get(&self, id: &str) -> impl Future<Output = Result<Option<Task>, StoreError>> + Send;

    /// `pending → processing`, recording `started_at`.  Returns `false` when
    /// the task is not `pending` anymore.
    fn mark_processing(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Record worker-reported progress (0–100).  Ignored once terminal.
    fn set_progress(
        &self,
        id: &str,
        progress: u8,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// `processing → done`.  Returns `false` when the task was not
    /// `processing` (already terminal, or never started).
    fn complete(
        &self,
        id: &str,
        result_location: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// `pending|processing → failed`.  Returns `false` when the task is
    /// already terminal.
    fn fail(
        &self,
        id: &str,
        error_msg: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Every task currently in `processing`, for the stale-task sweep.
    fn list_processing(&self) -> impl Future<Output = Result<Vec<Task>, StoreError>> + Send;
}

/// In-memory reference implementation of the transition rules.
#[derive(Debug, Clone, Default)]
pub struct MemoryTaskStore {
    inner: Arc<RwLock<HashMap<String, Task>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks; used by tests asserting that rejected
    /// requests never create records.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: Task) -> Result<(), StoreError> {
        self.inner.write().await.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.read().await.get(id).cloned())
    }

    async fn mark_processing(&self, id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        let task = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.to_owned()))?;
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        task.status = TaskStatus::Processing;
        task.started_at = Some(at);
        task.updated_at = at;
        Ok(true)
    }

    async fn set_progress(&self, id: &str, progress: u8) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let task = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.to_owned()))?;
        if task.status == TaskStatus::Processing {
            task.progress = progress.min(100);
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn complete(&self, id: &str, result_location: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        let task = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.to_owned()))?;
        if task.status != TaskStatus::Processing {
            return Ok(false);
        }
        task.status = TaskStatus::Done;
        task.result_location = Some(result_location.to_owned());
        task.progress = 100;
        task.finished_at = Some(at);
        task.updated_at = at;
        Ok(true)
    }

    async fn fail(&self, id: &str, error_msg: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        let task = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.to_owned()))?;
        if task.status.is_terminal() {
            return Ok(false);
        }
        task.status = TaskStatus::Failed;
        task.error_msg = Some(error_msg.to_owned());
        task.finished_at = Some(at);
        task.updated_at = at;
        Ok(true)
    }

    async fn list_processing(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .values()
            .filter(|t| t.status == TaskStatus::Processing)
            .cloned()
            .collect())
    }
}
