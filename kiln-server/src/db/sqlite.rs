//! SQLite implementation of the core [`TaskStore`] trait.
//!
//! Uses [`sqlx`] with the `sqlite` feature.  Migrations are run
//! automatically on startup via [`SqliteStore::connect`];
//! `sqlx::migrate!("./migrations")` resolves the path at compile time
//! relative to the crate root, so the directory is embedded in the binary.
//!
//! The lifecycle invariants live in the SQL itself: every transition UPDATE
//! carries a `WHERE status = …` guard, so monotonic ordering and sticky
//! terminal states hold even across concurrent writers (the reaper racing a
//! worker completion callback resolves to exactly one applied transition).
//! Each transition is one UPDATE: a status read immediately after either
//! writer commits sees the terminal state.
//!
//! The `sqlx::query` (runtime-verified) form is used deliberately so that no
//! `DATABASE_URL` environment variable is needed at compile time.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::warn;

use kiln_core::{GenerationParams, LaneMode, StoreError, Task, TaskKind, TaskStatus, TaskStore};

/// SQLite-backed task store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

type TaskRow = (
    String,         // id
    String,         // model
    String,         // kind
    String,         // lane_mode
    String,         // params (JSON)
    String,         // status
    i64,            // progress
    Option<String>, // error_msg
    Option<String>, // result_location
    String,         // created_at
    String,         // updated_at
    Option<String>, // started_at
    Option<String>, // finished_at
);

const TASK_COLUMNS: &str = "id, model, kind, lane_mode, params, status, progress, \
     error_msg, result_location, created_at, updated_at, started_at, finished_at";

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending
    /// migrations.
    ///
    /// `url` should be a sqlx-compatible SQLite URL, e.g.
    /// `"sqlite://kiln.db?mode=rwc"` or `"sqlite::memory:"` for tests.
    /// The pool is capped at one connection: SQLite serializes writers
    /// anyway, and `:memory:` databases exist per connection.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn parse_datetime(raw: &str, field: &str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|e: chrono::ParseError| {
        warn!(raw = %raw, field = %field, error = %e, "failed to parse task timestamp; using now");
        Utc::now()
    })
}

fn row_to_task(row: TaskRow) -> Result<Task, StoreError> {
    let (
        id,
        model,
        kind,
        lane_mode,
        params,
        status,
        progress,
        error_msg,
        result_location,
        created_at,
        updated_at,
        started_at,
        finished_at,
    ) = row;

    let kind: TaskKind = kind
        .parse()
        .map_err(|_| StoreError::Backend(format!("task {id}: unknown kind '{kind}'")))?;
    let lane_mode: LaneMode = lane_mode
        .parse()
        .map_err(|_| StoreError::Backend(format!("task {id}: unknown lane_mode '{lane_mode}'")))?;
    let status: TaskStatus = status
        .parse()
        .map_err(|_| StoreError::Backend(format!("task {id}: unknown status '{status}'")))?;
    let params: GenerationParams = serde_json::from_str(&params)
        .map_err(|e| StoreError::Backend(format!("task {id}: bad params json: {e}")))?;

    Ok(Task {
        created_at: parse_datetime(&created_at, "created_at"),
        updated_at: parse_datetime(&updated_at, "updated_at"),
        started_at: started_at.map(|s| parse_datetime(&s, "started_at")),
        finished_at: finished_at.map(|s| parse_datetime(&s, "finished_at")),
        progress: progress.clamp(0, 100) as u8,
        id,
        model,
        kind,
        lane_mode,
        params,
        status,
        error_msg,
        result_location,
    })
}

impl TaskStore for SqliteStore {
    async fn insert(&self, task: Task) -> Result<(), StoreError> {
        let params = serde_json::to_string(&task.params)
            .map_err(|e| StoreError::Backend(format!("params serialization: {e}")))?;
        sqlx::query(
            "INSERT INTO tasks (id, model, kind, lane_mode, params, status, progress, \
             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&task.id)
        .bind(&task.model)
        .bind(task.kind.to_string())
        .bind(task.lane_mode.to_string())
        .bind(&params)
        .bind(task.status.to_string())
        .bind(task.progress as i64)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.map(row_to_task).transpose()
    }

    async fn mark_processing(&self, id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'processing', started_at = ?1, updated_at = ?1 \
             WHERE id = ?2 AND status = 'pending'",
        )
        .bind(at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_progress(&self, id: &str, progress: u8) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE tasks SET progress = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status = 'processing'",
        )
        .bind(progress.min(100) as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn complete(&self, id: &str, result_location: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'done', result_location = ?1, progress = 100, \
             finished_at = ?2, updated_at = ?2 WHERE id = ?3 AND status = 'processing'",
        )
        .bind(result_location)
        .bind(at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail(&self, id: &str, error_msg: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'failed', error_msg = ?1, finished_at = ?2, \
             updated_at = ?2 WHERE id = ?3 AND status IN ('pending', 'processing')",
        )
        .bind(error_msg)
        .bind(at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_processing(&self) -> Result<Vec<Task>, StoreError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'processing' ORDER BY started_at"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(row_to_task).collect()
    }
}
