//! GPU worker contract and residency discipline.
//!
//! The actual inference workers are external processes; the scheduler talks
//! to them through the narrow [`GpuWorker`] contract and owns only the
//! residency bookkeeping around it:
//!
//! - [`DedicatedLane`] serves exactly one model and never unloads it between
//!   requests; the pipeline leaves the worker only through recycling or
//!   idle eviction, never to make room for a same-model request;
//! - [`SharedWorker`] is the degraded-mode executor: one resident pipeline
//!   at a time, and switching pipelines releases the previous model's
//!   memory and runs the cache-cleanup step before the next model loads.
//!   That ordering is mandatory.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::scheduler::diagnostics::{DiagnosticEventType, DiagnosticsEmitter, MemoryDiagnosticEvent};
use crate::scheduler::lanes::LaneMode;
use crate::scheduler::types::GenerationParams;

#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    #[error("worker unreachable: {0}")]
    Unreachable(String),

    #[error("pipeline load failed for '{model}': {message}")]
    LoadFailed { model: String, message: String },

    /// The worker's own failure report, passed through verbatim.
    #[error("{0}")]
    Inference(String),
}

/// What a GPU worker process can do for the scheduler.
#[async_trait]
pub trait GpuWorker: Send + Sync + 'static {
    /// Lightweight health probe.
    async fn probe(&self) -> Result<(), WorkerError>;

    /// Load the model's pipeline into worker memory.
    async fn load(&self, model: &str) -> Result<(), WorkerError>;

    /// Fully release the model's memory.
    async fn release(&self, model: &str) -> Result<(), WorkerError>;

    /// Allocator cache cleanup; returns freed bytes.
    async fn cleanup_cache(&self) -> Result<u64, WorkerError>;

    /// Run inference for a loaded pipeline; returns the result location.
    async fn infer(
        &self,
        task_id: &str,
        model: &str,
        params: &GenerationParams,
    ) -> Result<String, WorkerError>;
}

/// Outcome of one dedicated-lane run.
#[derive(Debug)]
pub struct LaneRun {
    pub result_location: String,
    /// Whether this run performed the lane's cold-start load.
    pub cold_start: bool,
}

/// Warm residency slot for a single model.
///
/// The internal mutex serializes runs on the lane and guards the loaded
/// flag: two requests can never both believe they own the lane.
pub struct DedicatedLane {
    model: String,
    worker: Arc<dyn GpuWorker>,
    loaded: Mutex<bool>,
}

impl DedicatedLane {
    pub fn new(model: impl Into<String>, worker: Arc<dyn GpuWorker>) -> Self {
        Self {
            model: model.into(),
            worker,
            loaded: Mutex::new(false),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one generation on the lane, loading the pipeline only if it is
    /// not already resident.
    pub async fn run(&self, task_id: &str, params: &GenerationParams) -> Result<LaneRun, WorkerError> {
        let mut loaded = self.loaded.lock().await;
        let cold_start = !*loaded;
        if cold_start {
            info!(model = %self.model, "dedicated lane cold start");
            self.worker.load(&self.model).await?;
            *loaded = true;
        }
        let result_location = self.worker.infer(task_id, &self.model, params).await?;
        Ok(LaneRun {
            result_location,
            cold_start,
        })
    }

    /// Idle eviction / worker recycling: drop the resident pipeline.
    pub async fn evict(&self) -> Result<(), WorkerError> {
        let mut loaded = self.loaded.lock().await;
        if *loaded {
            self.worker.release(&self.model).await?;
            *loaded = false;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DedicatedLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedicatedLane").field("model", &self.model).finish()
    }
}

/// Degraded-mode executor: one resident pipeline per worker.
pub struct SharedWorker {
    worker: Arc<dyn GpuWorker>,
    resident: Mutex<Option<String>>,
    diagnostics: DiagnosticsEmitter,
}

impl SharedWorker {
    pub fn new(worker: Arc<dyn GpuWorker>, diagnostics: DiagnosticsEmitter) -> Self {
        Self {
            worker,
            resident: Mutex::new(None),
            diagnostics,
        }
    }

    /// Run one generation on the shared worker, switching the resident
    /// pipeline if needed.
    ///
    /// Switch order: release the previous model, run the cache cleanup,
    /// then load the new model.  The resident lock is held across the whole
    /// run, so at most one pipeline is ever active.
    pub async fn run(
        &self,
        task_id: &str,
        model: &str,
        params: &GenerationParams,
    ) -> Result<String, WorkerError> {
        let mut resident = self.resident.lock().await;
        if resident.as_deref() != Some(model) {
            if let Some(prev) = resident.take() {
                info!(from = %prev, to = %model, "shared worker pipeline switch");
                self.worker.release(&prev).await?;
            }
            let freed = self.worker.cleanup_cache().await?;
            self.diagnostics.emit(
                MemoryDiagnosticEvent::new(DiagnosticEventType::MemoryCleanup, LaneMode::DegradedShared)
                    .task(task_id)
                    .model(model)
                    .value(freed),
            );
            self.worker.load(model).await?;
            *resident = Some(model.to_owned());
        }
        self.worker.infer(task_id, model, params).await
    }

    /// The currently resident model, if any.
    pub async fn resident(&self) -> Option<String> {
        self.resident.lock().await.clone()
    }
}

impl std::fmt::Debug for SharedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedWorker").finish()
    }
}
