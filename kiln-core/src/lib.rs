pub mod catalog;
pub mod scheduler;
pub mod worker;

pub use catalog::{ModelCatalog, ModelSpec, TaskKind};
pub use scheduler::admission::{AdmissionController, AdmissionRejection, DegradedQueuePolicy};
pub use scheduler::constraints::{ConstraintValidator, ConstraintViolation};
pub use scheduler::diagnostics::{
    DiagnosticEventType, DiagnosticsEmitter, DiagnosticsSink, MemoryDiagnosticEvent, RecordingSink,
    TracingSink,
};
pub use scheduler::handles::TaskManager;
pub use scheduler::lanes::{
    FallbackReason, LaneAvailability, LaneEvent, LaneMode, LanePolicy, LaneRegistry, LaneSnapshot,
};
pub use scheduler::reaper::{ReaperPolicy, StaleTaskReaper};
pub use scheduler::router::{DispatchOutcome, GenerationRequest, Router};
pub use scheduler::store::{MemoryTaskStore, TaskStore};
pub use scheduler::types::{GenerationParams, SchedulerError, StoreError, Task, TaskId, TaskStatus};
pub use worker::{GpuWorker, WorkerError};
