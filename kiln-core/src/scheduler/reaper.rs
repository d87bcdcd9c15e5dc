//! Stale-task reaping.
//!
//! The backstop against partial failure: no task stays `processing` forever
//! just because its worker never reported back.  A periodic sweep
//! force-fails every `processing` task older than its kind's time-to-live,
//! aborts the in-flight execution (releasing its queue slot and lane
//! guard), and emits a `queue_timeout` diagnostic.
//!
//! The sweep relies on the store's sticky-terminal semantics: if a worker
//! completion lands in the same instant, exactly one terminal transition is
//! applied and the other is a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::catalog::TaskKind;
use crate::scheduler::diagnostics::{DiagnosticEventType, DiagnosticsEmitter, MemoryDiagnosticEvent};
use crate::scheduler::handles::TaskManager;
use crate::scheduler::store::TaskStore;
use crate::scheduler::types::StoreError;

/// Per-kind time-to-live for `processing` tasks, and the sweep cadence.
#[derive(Debug, Clone, Copy)]
pub struct ReaperPolicy {
    pub image_ttl: Duration,
    pub video_ttl: Duration,
    pub interval: Duration,
}

impl Default for ReaperPolicy {
    fn default() -> Self {
        Self {
            image_ttl: Duration::from_secs(10 * 60),
            video_ttl: Duration::from_secs(30 * 60),
            interval: Duration::from_secs(30),
        }
    }
}

impl ReaperPolicy {
    pub fn ttl_for(&self, kind: TaskKind) -> Duration {
        match kind {
            TaskKind::Image => self.image_ttl,
            TaskKind::Video => self.video_ttl,
        }
    }
}

#[derive(Debug)]
pub struct StaleTaskReaper<S: TaskStore> {
    store: Arc<S>,
    policy: ReaperPolicy,
    diagnostics: DiagnosticsEmitter,
    tasks: Arc<TaskManager>,
}

impl<S: TaskStore> StaleTaskReaper<S> {
    pub fn new(
        store: Arc<S>,
        policy: ReaperPolicy,
        diagnostics: DiagnosticsEmitter,
        tasks: Arc<TaskManager>,
    ) -> Self {
        Self {
            store,
            policy,
            diagnostics,
            tasks,
        }
    }

    /// One sweep over all `processing` tasks at `now`.  Returns how many
    /// tasks were force-failed.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut reaped = 0;

        for task in self.store.list_processing().await? {
            let Some(started_at) = task.started_at else {
                // Processing without a start timestamp cannot age out; skip
                // rather than guess.
                warn!(task_id = %task.id, "processing task has no started_at");
                continue;
            };

            let ttl = self.policy.ttl_for(task.kind);
            let elapsed = match now.signed_duration_since(started_at).to_std() {
                Ok(elapsed) => elapsed,
                Err(_) => continue, // started in the future; clock skew
            };
            if elapsed <= ttl {
                continue;
            }

            let message = timeout_message(ttl);
            match self.store.fail(&task.id, &message, now).await {
                Ok(true) => {
                    self.tasks.cancel(&task.id);
                    self.diagnostics.emit(
                        MemoryDiagnosticEvent::new(DiagnosticEventType::QueueTimeout, task.lane_mode)
                            .task(task.id.as_str())
                            .model(task.model.as_str())
                            .value(elapsed.as_secs()),
                    );
                    info!(
                        task_id = %task.id,
                        model = %task.model,
                        elapsed_secs = elapsed.as_secs(),
                        "stale task force-failed"
                    );
                    reaped += 1;
                }
                // Terminal already; the worker callback won the race.
                Ok(false) => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "failed to reap stale task"),
            }
        }

        Ok(reaped)
    }

    /// Run the sweep on a fixed cadence until the handle is aborted.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.policy.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_once(Utc::now()).await {
                    warn!(error = %e, "stale-task sweep failed");
                }
            }
        })
    }
}

fn timeout_message(ttl: Duration) -> String {
    format!("generation timed out after {} minutes", ttl.as_secs() / 60)
}
