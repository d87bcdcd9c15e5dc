use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use crate::catalog::ModelCatalog;
use crate::scheduler::admission::{AdmissionController, AdmissionRejection, DegradedQueuePolicy};
use crate::scheduler::diagnostics::{
    DiagnosticEventType, DiagnosticsEmitter, DiagnosticsSink, RecordingSink,
};
use crate::scheduler::lanes::{FallbackReason, LaneEvent, LanePolicy, LaneRegistry};
use crate::scheduler::reaper::{ReaperPolicy, StaleTaskReaper};
use crate::scheduler::router::{DispatchOutcome, GenerationRequest, Router};
use crate::scheduler::store::{MemoryTaskStore, TaskStore};
use crate::scheduler::types::{GenerationParams, TaskStatus};
use crate::worker::{GpuWorker, WorkerError};

const VIDEO_A: &str = "wan-video-14b"; // fixed steps=8
const VIDEO_B: &str = "ltx-video-2b"; // fixed steps=4, cfg=1.0

/// Scripted worker: records every operation, can hold inference open behind
/// a gate, and can fail inference for a chosen model.
struct MockWorker {
    ops: Mutex<Vec<String>>,
    load_count: AtomicUsize,
    gate: watch::Sender<bool>,
    // Keep a receiver alive so `gate.send` always has a subscriber and
    // actually updates the stored value, even before any `infer` subscribes.
    _gate_keepalive: watch::Receiver<bool>,
    fail_model: Mutex<Option<String>>,
}

impl MockWorker {
    fn new() -> Self {
        let (gate, gate_keepalive) = watch::channel(true);
        Self {
            ops: Mutex::new(Vec::new()),
            load_count: AtomicUsize::new(0),
            gate,
            _gate_keepalive: gate_keepalive,
            fail_model: Mutex::new(None),
        }
    }

    fn push(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn close_gate(&self) {
        let _ = self.gate.send(false);
    }

    fn open_gate(&self) {
        let _ = self.gate.send(true);
    }

    fn fail_inference_for(&self, model: &str) {
        *self.fail_model.lock().unwrap() = Some(model.to_owned());
    }
}

#[async_trait]
impl GpuWorker for MockWorker {
    async fn probe(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn load(&self, model: &str) -> Result<(), WorkerError> {
        self.push(format!("load:{model}"));
        self.load_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self, model: &str) -> Result<(), WorkerError> {
        self.push(format!("release:{model}"));
        Ok(())
    }

    async fn cleanup_cache(&self) -> Result<u64, WorkerError> {
        self.push("cleanup".to_owned());
        Ok(512 * 1024 * 1024)
    }

    async fn infer(
        &self,
        task_id: &str,
        model: &str,
        _params: &GenerationParams,
    ) -> Result<String, WorkerError> {
        self.push(format!("infer:{model}"));
        let mut rx = self.gate.subscribe();
        while !*rx.borrow() {
            rx.changed().await.map_err(|_| WorkerError::Unreachable("gate dropped".to_owned()))?;
        }
        if self.fail_model.lock().unwrap().as_deref() == Some(model) {
            return Err(WorkerError::Inference("CUDA out of memory".to_owned()));
        }
        Ok(format!("results/{task_id}"))
    }
}

struct Rig {
    store: Arc<MemoryTaskStore>,
    lanes: Arc<LaneRegistry>,
    sink: Arc<RecordingSink>,
    worker: Arc<MockWorker>,
    admission: AdmissionController,
    router: Router<MemoryTaskStore>,
}

fn rig(policy: DegradedQueuePolicy) -> Rig {
    let catalog = Arc::new(ModelCatalog::builtin());
    let store = Arc::new(MemoryTaskStore::new());
    let lanes = Arc::new(LaneRegistry::new(&catalog, LanePolicy::default()));
    let sink = Arc::new(RecordingSink::default());
    let diagnostics = DiagnosticsEmitter::start(Arc::clone(&sink) as Arc<dyn DiagnosticsSink>);
    let worker = Arc::new(MockWorker::new());
    let admission = AdmissionController::new(policy);
    let router = Router::new(
        Arc::clone(&catalog),
        Arc::clone(&lanes),
        admission.clone(),
        Arc::clone(&store),
        diagnostics,
        Arc::clone(&worker) as Arc<dyn GpuWorker>,
    );
    Rig {
        store,
        lanes,
        sink,
        worker,
        admission,
        router,
    }
}

fn request(model: &str, steps: Option<u32>, cfg: Option<f32>) -> GenerationRequest {
    GenerationRequest {
        model: model.to_owned(),
        params: GenerationParams {
            prompt: "a lighthouse in fog".to_owned(),
            steps,
            cfg,
            seed: None,
            extra: serde_json::Map::new(),
        },
    }
}

async fn await_status(store: &MemoryTaskStore, id: &str, expected: TaskStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(task) = store.get(id).await.unwrap() {
                if task.status == expected {
                    break;
                }
                assert!(
                    !task.status.is_terminal(),
                    "task reached terminal {:?} while waiting for {expected:?}",
                    task.status
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {id} did not reach {expected:?} in time"));
}

// ── Dedicated lane behaviour ─────────────────────────────────────────────────

#[tokio::test]
async fn consecutive_same_model_requests_keep_the_lane_warm() {
    let rig = rig(DegradedQueuePolicy::default());

    for _ in 0..3 {
        let outcome = rig.router.dispatch(request(VIDEO_A, Some(8), None)).await.unwrap();
        let DispatchOutcome::AcceptedDedicated { task_id } = outcome else {
            panic!("expected dedicated dispatch, got {outcome:?}");
        };
        await_status(&rig.store, &task_id, TaskStatus::Done).await;
    }

    // One cold start, then the pipeline stays resident: no unload/reload.
    assert_eq!(rig.worker.load_count.load(Ordering::SeqCst), 1);
    assert!(!rig.worker.ops().iter().any(|op| op.starts_with("release:")));
    let lane = rig.lanes.resolve(VIDEO_A).unwrap();
    assert!(lane.warm);
}

#[tokio::test]
async fn dedicated_dispatch_records_result_location() {
    let rig = rig(DegradedQueuePolicy::default());
    let outcome = rig.router.dispatch(request(VIDEO_A, Some(8), None)).await.unwrap();
    let DispatchOutcome::AcceptedDedicated { task_id } = outcome else {
        panic!("expected dedicated dispatch");
    };
    await_status(&rig.store, &task_id, TaskStatus::Done).await;

    let task = rig.store.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.result_location.as_deref(), Some(format!("results/{task_id}").as_str()));
    assert_eq!(task.progress, 100);
    assert!(task.started_at.is_some());
    assert!(task.finished_at.is_some());
}

#[tokio::test]
async fn worker_failure_is_passed_through_verbatim() {
    let rig = rig(DegradedQueuePolicy::default());
    rig.worker.fail_inference_for(VIDEO_A);

    let outcome = rig.router.dispatch(request(VIDEO_A, Some(8), None)).await.unwrap();
    let DispatchOutcome::AcceptedDedicated { task_id } = outcome else {
        panic!("expected dedicated dispatch");
    };
    await_status(&rig.store, &task_id, TaskStatus::Failed).await;

    let task = rig.store.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.error_msg.as_deref(), Some("CUDA out of memory"));
    assert_eq!(task.result_location, None);
}

// ── Validation ordering ──────────────────────────────────────────────────────

#[tokio::test]
async fn invalid_parameters_touch_no_scheduler_state() {
    let rig = rig(DegradedQueuePolicy::default());
    let before = rig.lanes.resolve(VIDEO_A).unwrap();

    let outcome = rig.router.dispatch(request(VIDEO_A, Some(6), None)).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::RejectedInvalid(_)));

    // No task row, no worker traffic, no queue slot, no lane change.
    assert_eq!(rig.store.len().await, 0);
    assert!(rig.worker.ops().is_empty());
    assert_eq!(rig.admission.queued(), 0);
    let after = rig.lanes.resolve(VIDEO_A).unwrap();
    assert_eq!(after.updated_at, before.updated_at);
    assert!(rig.sink.events().is_empty());
}

// ── Degraded fallback ────────────────────────────────────────────────────────

#[tokio::test]
async fn quota_denied_lane_falls_back_with_reason() {
    let rig = rig(DegradedQueuePolicy::default());
    rig.lanes.apply(VIDEO_A, LaneEvent::QuotaDenied, Utc::now()).unwrap();

    let outcome = rig.router.dispatch(request(VIDEO_A, Some(8), None)).await.unwrap();
    let DispatchOutcome::AcceptedDegraded { task_id } = outcome else {
        panic!("expected degraded dispatch, got {outcome:?}");
    };
    await_status(&rig.store, &task_id, TaskStatus::Done).await;

    tokio::time::timeout(Duration::from_secs(2), async {
        while rig.sink.of_type(DiagnosticEventType::FallbackActivated).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("fallback diagnostic should drain");

    let fallback = rig.sink.of_type(DiagnosticEventType::FallbackActivated);
    assert_eq!(fallback[0].reason, Some(FallbackReason::Quota));
    assert_eq!(fallback[0].model.as_deref(), Some(VIDEO_A));
}

#[tokio::test]
async fn pipeline_switch_releases_then_cleans_then_loads() {
    let rig = rig(DegradedQueuePolicy::default());
    rig.lanes.apply(VIDEO_A, LaneEvent::CapacityDenied, Utc::now()).unwrap();
    rig.lanes.apply(VIDEO_B, LaneEvent::CapacityDenied, Utc::now()).unwrap();

    for (model, steps, cfg) in [(VIDEO_A, 8, None), (VIDEO_B, 4, Some(1.0))] {
        let outcome = rig.router.dispatch(request(model, Some(steps), cfg)).await.unwrap();
        let DispatchOutcome::AcceptedDegraded { task_id } = outcome else {
            panic!("expected degraded dispatch");
        };
        await_status(&rig.store, &task_id, TaskStatus::Done).await;
    }

    let ops = rig.worker.ops();
    let pos = |op: &str| {
        ops.iter()
            .position(|o| o == op)
            .unwrap_or_else(|| panic!("missing op {op} in {ops:?}"))
    };
    // Switching from A to B: release A, cache cleanup, then load B.
    let release_a = pos(&format!("release:{VIDEO_A}"));
    let load_b = pos(&format!("load:{VIDEO_B}"));
    let cleanup_between = ops[release_a..load_b].iter().any(|o| o == "cleanup");
    assert!(release_a < load_b, "release must precede the next load");
    assert!(cleanup_between, "cache cleanup must run between release and load: {ops:?}");
}

#[tokio::test]
async fn same_model_degraded_requests_reuse_the_resident_pipeline() {
    let rig = rig(DegradedQueuePolicy::default());
    rig.lanes.apply(VIDEO_A, LaneEvent::CapacityDenied, Utc::now()).unwrap();

    for _ in 0..2 {
        let outcome = rig.router.dispatch(request(VIDEO_A, Some(8), None)).await.unwrap();
        let DispatchOutcome::AcceptedDegraded { task_id } = outcome else {
            panic!("expected degraded dispatch");
        };
        await_status(&rig.store, &task_id, TaskStatus::Done).await;
    }
    assert_eq!(rig.worker.load_count.load(Ordering::SeqCst), 1);
}

// ── Overload ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn request_26_against_a_full_queue_is_rejected() {
    let rig = rig(DegradedQueuePolicy {
        max_depth: 25,
        max_wait: Duration::from_secs(30),
    });
    rig.lanes.apply(VIDEO_A, LaneEvent::CapacityDenied, Utc::now()).unwrap();
    rig.worker.close_gate();

    // First request occupies the shared worker.
    let outcome = rig.router.dispatch(request(VIDEO_A, Some(8), None)).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::AcceptedDegraded { .. }));

    // 25 more fill every queue position.
    let rig = Arc::new(rig);
    let mut waiters = tokio::task::JoinSet::new();
    for _ in 0..25 {
        let r = Arc::clone(&rig);
        waiters.spawn(async move { r.router.dispatch(request(VIDEO_A, Some(8), None)).await });
    }
    tokio::time::timeout(Duration::from_secs(5), async {
        while rig.admission.queued() < 25 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("all 25 waiters should claim a queue position");

    // The 26th bounces immediately, without waiting.
    let outcome = rig.router.dispatch(request(VIDEO_A, Some(8), None)).await.unwrap();
    assert!(matches!(
        outcome,
        DispatchOutcome::RejectedOverloaded(AdmissionRejection::DepthExceeded { max_depth: 25 })
    ));

    waiters.abort_all();
    rig.worker.open_gate();
}

#[tokio::test]
async fn bounded_wait_expires_into_queue_overloaded() {
    let rig = rig(DegradedQueuePolicy {
        max_depth: 25,
        max_wait: Duration::from_millis(80),
    });
    rig.lanes.apply(VIDEO_A, LaneEvent::CapacityDenied, Utc::now()).unwrap();
    rig.worker.close_gate();

    let outcome = rig.router.dispatch(request(VIDEO_A, Some(8), None)).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::AcceptedDegraded { .. }));

    // The slot never frees: the second request must resolve to overload,
    // not hang and not silently succeed.
    let outcome = rig.router.dispatch(request(VIDEO_A, Some(8), None)).await.unwrap();
    assert!(matches!(
        outcome,
        DispatchOutcome::RejectedOverloaded(AdmissionRejection::WaitExpired { .. })
    ));

    // Only the running request ever produced a task row.
    assert_eq!(rig.store.len().await, 1);

    tokio::time::timeout(Duration::from_secs(2), async {
        while rig.sink.of_type(DiagnosticEventType::QueueTimeout).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue timeout diagnostic should drain");

    rig.worker.open_gate();
}

// ── Reaper integration ───────────────────────────────────────────────────────

#[tokio::test]
async fn reaper_cuts_a_hung_execution_loose() {
    let rig = rig(DegradedQueuePolicy::default());
    rig.worker.close_gate();

    let outcome = rig.router.dispatch(request(VIDEO_A, Some(8), None)).await.unwrap();
    let DispatchOutcome::AcceptedDedicated { task_id } = outcome else {
        panic!("expected dedicated dispatch");
    };
    await_status(&rig.store, &task_id, TaskStatus::Processing).await;

    let reaper = StaleTaskReaper::new(
        Arc::clone(&rig.store),
        ReaperPolicy::default(),
        DiagnosticsEmitter::start(Arc::clone(&rig.sink) as Arc<dyn DiagnosticsSink>),
        rig.router.task_manager(),
    );

    // Pretend 31 minutes have passed.
    let future = Utc::now() + chrono::Duration::minutes(31);
    assert_eq!(reaper.sweep_once(future).await.unwrap(), 1);

    let task = rig.store.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error_msg.as_deref(), Some("generation timed out after 30 minutes"));

    // The gate opens after the abort; the dead execution must not overwrite
    // the terminal state.
    rig.worker.open_gate();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let task = rig.store.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
}

// ── Post-generation diagnostics ──────────────────────────────────────────────

#[tokio::test]
async fn every_attempt_emits_a_post_generation_event() {
    let rig = rig(DegradedQueuePolicy::default());

    let ok = rig.router.dispatch(request(VIDEO_A, Some(8), None)).await.unwrap();
    let DispatchOutcome::AcceptedDedicated { task_id } = ok else {
        panic!("expected dedicated dispatch");
    };
    await_status(&rig.store, &task_id, TaskStatus::Done).await;

    rig.worker.fail_inference_for(VIDEO_B);
    let failed = rig.router.dispatch(request(VIDEO_B, Some(4), Some(1.0))).await.unwrap();
    let DispatchOutcome::AcceptedDedicated { task_id } = failed else {
        panic!("expected dedicated dispatch");
    };
    await_status(&rig.store, &task_id, TaskStatus::Failed).await;

    tokio::time::timeout(Duration::from_secs(2), async {
        while rig.sink.of_type(DiagnosticEventType::MemoryPostGeneration).len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("both attempts should emit a post-generation event");
}
