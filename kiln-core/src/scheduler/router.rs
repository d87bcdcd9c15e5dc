//! Request routing.
//!
//! One decision per incoming request, in fixed order:
//!
//! 1. constraint validation, before any lane or queue state is touched;
//! 2. dedicated dispatch: when the model's lane is `ready` in `dedicated`
//!    mode, the request goes straight to the warm lane;
//! 3. degraded admission: otherwise the request enters the bounded shared
//!    queue, emitting a `fallback_activated` diagnostic with the lane's
//!    recorded reason;
//! 4. deterministic overload: admission refusal surfaces as
//!    `queue_overloaded`; RAII permits guarantee nothing is left half
//!    reserved.
//!
//! Accepted requests get a `pending` task record and an execution future
//! spawned in the background; the future drives the store transitions
//! (`processing` → terminal) and emits a post-generation diagnostic on
//! every attempt.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::catalog::ModelCatalog;
use crate::scheduler::admission::{AdmissionController, AdmissionRejection, DegradedSlot};
use crate::scheduler::constraints::{ConstraintValidator, ConstraintViolation};
use crate::scheduler::diagnostics::{DiagnosticEventType, DiagnosticsEmitter, MemoryDiagnosticEvent};
use crate::scheduler::handles::TaskManager;
use crate::scheduler::lanes::{FallbackReason, LaneAvailability, LaneEvent, LaneMode, LaneRegistry};
use crate::scheduler::store::TaskStore;
use crate::scheduler::types::{GenerationParams, SchedulerError, Task, TaskId};
use crate::worker::{DedicatedLane, GpuWorker, SharedWorker};

/// An already-authenticated generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub params: GenerationParams,
}

/// The four observable dispatch outcomes.
#[derive(Debug)]
pub enum DispatchOutcome {
    AcceptedDedicated { task_id: TaskId },
    AcceptedDegraded { task_id: TaskId },
    RejectedInvalid(ConstraintViolation),
    RejectedOverloaded(AdmissionRejection),
}

/// The routing core.  Cheap to share behind an `Arc`; all mutable state
/// lives in the registry, the admission controller, and the store.
pub struct Router<S: TaskStore> {
    validator: ConstraintValidator,
    lanes: Arc<LaneRegistry>,
    admission: AdmissionController,
    store: Arc<S>,
    diagnostics: DiagnosticsEmitter,
    dedicated: HashMap<String, Arc<DedicatedLane>>,
    shared: Arc<SharedWorker>,
    tasks: Arc<TaskManager>,
}

impl<S: TaskStore> Router<S> {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        lanes: Arc<LaneRegistry>,
        admission: AdmissionController,
        store: Arc<S>,
        diagnostics: DiagnosticsEmitter,
        worker: Arc<dyn GpuWorker>,
    ) -> Self {
        let dedicated = catalog
            .iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    Arc::new(DedicatedLane::new(spec.name.clone(), Arc::clone(&worker))),
                )
            })
            .collect();
        let shared = Arc::new(SharedWorker::new(Arc::clone(&worker), diagnostics.clone()));
        Self {
            validator: ConstraintValidator::new(catalog),
            lanes,
            admission,
            store,
            diagnostics,
            dedicated,
            shared,
            tasks: Arc::new(TaskManager::new()),
        }
    }

    /// Abort-handle registry for in-flight executions (shared with the
    /// stale-task reaper).
    pub fn task_manager(&self) -> Arc<TaskManager> {
        Arc::clone(&self.tasks)
    }

    /// Route one request.  `Err` is reserved for store failures; every
    /// scheduling decision, including rejections, is an `Ok` outcome.
    pub async fn dispatch(&self, req: GenerationRequest) -> Result<DispatchOutcome, SchedulerError> {
        // 1. Parameter legality precedes any resource reservation.
        let spec = match self.validator.validate(&req.model, &req.params) {
            Ok(spec) => spec,
            Err(violation) => {
                debug!(model = %req.model, error = %violation, "request rejected by validator");
                return Ok(DispatchOutcome::RejectedInvalid(violation));
            }
        };
        let kind = spec.kind;

        let Some(lane) = self.lanes.resolve(&req.model) else {
            // Catalog and registry are built from the same source; a miss
            // here means the model was never registered.
            return Ok(DispatchOutcome::RejectedInvalid(ConstraintViolation::UnknownModel {
                model: req.model.clone(),
            }));
        };

        // 2. Warm dedicated lane: straight dispatch, no queueing.
        if lane.availability == LaneAvailability::Ready && lane.mode == LaneMode::Dedicated {
            let task = Task::new(req.model.as_str(), kind, LaneMode::Dedicated, req.params);
            let task_id = task.id.clone();
            self.store.insert(task.clone()).await?;
            self.spawn_dedicated(task);
            info!(task_id = %task_id, model = %req.model, "dispatched to dedicated lane");
            return Ok(DispatchOutcome::AcceptedDedicated { task_id });
        }

        // 3. Fallback: bounded degraded-shared admission.
        let reason = lane.fallback_reason.unwrap_or(FallbackReason::Capacity);
        self.diagnostics.emit(
            MemoryDiagnosticEvent::new(DiagnosticEventType::FallbackActivated, LaneMode::DegradedShared)
                .model(req.model.as_str())
                .value(self.admission.queued() as u64)
                .reason(reason),
        );

        let slot = match self.admission.admit().await {
            Ok(slot) => slot,
            Err(rejection) => {
                self.emit_overload(&req.model, &rejection);
                warn!(model = %req.model, error = %rejection, "degraded admission refused");
                return Ok(DispatchOutcome::RejectedOverloaded(rejection));
            }
        };

        let task = Task::new(req.model.as_str(), kind, LaneMode::DegradedShared, req.params);
        let task_id = task.id.clone();
        self.store.insert(task.clone()).await?;
        self.spawn_degraded(task, slot);
        info!(task_id = %task_id, model = %req.model, reason = %reason, "dispatched to degraded shared worker");
        Ok(DispatchOutcome::AcceptedDegraded { task_id })
    }

    fn emit_overload(&self, model: &str, rejection: &AdmissionRejection) {
        let event = match rejection {
            AdmissionRejection::DepthExceeded { max_depth } => {
                MemoryDiagnosticEvent::new(DiagnosticEventType::QueueOverloaded, LaneMode::DegradedShared)
                    .model(model)
                    .value(*max_depth as u64)
            }
            AdmissionRejection::WaitExpired { max_wait } => {
                MemoryDiagnosticEvent::new(DiagnosticEventType::QueueTimeout, LaneMode::DegradedShared)
                    .model(model)
                    .value(max_wait.as_secs())
            }
        };
        self.diagnostics.emit(event);
    }

    fn spawn_dedicated(&self, task: Task) {
        let Some(lane_exec) = self.dedicated.get(&task.model).cloned() else {
            // Unreachable for cataloged models; leave the task pending for
            // the reaper rather than panic.
            warn!(model = %task.model, "no dedicated executor for model");
            return;
        };
        let store = Arc::clone(&self.store);
        let lanes = Arc::clone(&self.lanes);
        let diagnostics = self.diagnostics.clone();
        let tasks = Arc::clone(&self.tasks);
        let task_id = task.id.clone();

        let handle = tokio::spawn(async move {
            run_dedicated(task, lane_exec, store, lanes, diagnostics, &tasks).await;
        });
        self.tasks.insert(task_id, handle.abort_handle());
    }

    fn spawn_degraded(&self, task: Task, slot: DegradedSlot) {
        let shared = Arc::clone(&self.shared);
        let store = Arc::clone(&self.store);
        let diagnostics = self.diagnostics.clone();
        let tasks = Arc::clone(&self.tasks);
        let task_id = task.id.clone();

        let handle = tokio::spawn(async move {
            run_degraded(task, slot, shared, store, diagnostics, &tasks).await;
        });
        self.tasks.insert(task_id, handle.abort_handle());
    }
}

impl<S: TaskStore> std::fmt::Debug for Router<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("lanes", &self.dedicated.len())
            .finish()
    }
}

async fn run_dedicated<S: TaskStore>(
    task: Task,
    lane_exec: Arc<DedicatedLane>,
    store: Arc<S>,
    lanes: Arc<LaneRegistry>,
    diagnostics: DiagnosticsEmitter,
    tasks: &TaskManager,
) {
    let Task { id, model, params, .. } = task;

    if !begin(&*store, &id).await {
        tasks.remove(&id);
        return;
    }

    let result = lane_exec.run(&id, &params).await;

    let outcome = match result {
        Ok(run) => {
            if run.cold_start {
                if let Err(e) = lanes.apply(&model, LaneEvent::PipelineLoaded, Utc::now()) {
                    warn!(model = %model, error = %e, "failed to record pipeline load");
                }
            }
            finish_ok(&*store, &id, &run.result_location).await
        }
        Err(e) => finish_err(&*store, &id, &e.to_string()).await,
    };

    diagnostics.emit(
        MemoryDiagnosticEvent::new(DiagnosticEventType::MemoryPostGeneration, LaneMode::Dedicated)
            .task(id.as_str())
            .model(model.as_str())
            .value(outcome),
    );
    tasks.remove(&id);
}

async fn run_degraded<S: TaskStore>(
    task: Task,
    slot: DegradedSlot,
    shared: Arc<SharedWorker>,
    store: Arc<S>,
    diagnostics: DiagnosticsEmitter,
    tasks: &TaskManager,
) {
    let Task { id, model, params, .. } = task;

    if !begin(&*store, &id).await {
        tasks.remove(&id);
        return;
    }

    let result = shared.run(&id, &model, &params).await;

    let outcome = match result {
        Ok(location) => finish_ok(&*store, &id, &location).await,
        Err(e) => finish_err(&*store, &id, &e.to_string()).await,
    };

    diagnostics.emit(
        MemoryDiagnosticEvent::new(DiagnosticEventType::MemoryPostGeneration, LaneMode::DegradedShared)
            .task(id.as_str())
            .model(model.as_str())
            .value(outcome),
    );
    tasks.remove(&id);
    drop(slot);
}

/// `pending → processing`; `false` means the task is already terminal (the
/// reaper got there first) and execution must not start.
async fn begin<S: TaskStore>(store: &S, id: &str) -> bool {
    match store.mark_processing(id, Utc::now()).await {
        Ok(true) => true,
        Ok(false) => {
            debug!(task_id = %id, "task already terminal before start; skipping");
            false
        }
        Err(e) => {
            warn!(task_id = %id, error = %e, "failed to mark task processing");
            false
        }
    }
}

async fn finish_ok<S: TaskStore>(store: &S, id: &str, location: &str) -> &'static str {
    match store.complete(id, location, Utc::now()).await {
        Ok(true) => "done",
        Ok(false) => {
            // The reaper already failed this task; terminal state is sticky.
            debug!(task_id = %id, "completion after terminal state; no-op");
            "done_after_terminal"
        }
        Err(e) => {
            warn!(task_id = %id, error = %e, "failed to persist completion");
            "store_error"
        }
    }
}

async fn finish_err<S: TaskStore>(store: &S, id: &str, message: &str) -> &'static str {
    match store.fail(id, message, Utc::now()).await {
        Ok(true) => "failed",
        Ok(false) => {
            debug!(task_id = %id, "failure report after terminal state; no-op");
            "failed_after_terminal"
        }
        Err(e) => {
            warn!(task_id = %id, error = %e, "failed to persist failure");
            "store_error"
        }
    }
}
