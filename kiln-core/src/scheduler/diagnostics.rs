//! Operational diagnostics.
//!
//! The emitter is fire-and-forget: `emit` never blocks, never fails, and a
//! lost event never affects task state or routing decisions.  Events go
//! through a bounded channel to a background drain task which hands them to
//! a [`DiagnosticsSink`]; on overflow the event is dropped with a warning.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::Display;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::scheduler::lanes::{FallbackReason, LaneMode};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticEventType {
    MemoryCleanup,
    MemoryPostGeneration,
    FallbackActivated,
    QueueTimeout,
    QueueOverloaded,
}

/// Append-only operational record.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryDiagnosticEvent {
    pub event_type: DiagnosticEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub lane_mode: LaneMode,
    /// Numeric or string payload: freed bytes, queue depth, wait seconds, …
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Required when `event_type == FallbackActivated`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FallbackReason>,
    pub timestamp: DateTime<Utc>,
}

impl MemoryDiagnosticEvent {
    pub fn new(event_type: DiagnosticEventType, lane_mode: LaneMode) -> Self {
        Self {
            event_type,
            task_id: None,
            model: None,
            lane_mode,
            value: None,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn value(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn reason(mut self, reason: FallbackReason) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// Destination for drained diagnostic events.
pub trait DiagnosticsSink: Send + Sync + 'static {
    fn record(&self, event: &MemoryDiagnosticEvent);
}

/// Production sink: one structured log line per event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn record(&self, event: &MemoryDiagnosticEvent) {
        info!(
            event_type = %event.event_type,
            task_id = event.task_id.as_deref().unwrap_or("-"),
            model = event.model.as_deref().unwrap_or("-"),
            lane_mode = %event.lane_mode,
            value = ?event.value,
            reason = event.reason.map(|r| r.to_string()).unwrap_or_default(),
            "diagnostic"
        );
    }
}

/// Test sink that keeps every recorded event.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<MemoryDiagnosticEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<MemoryDiagnosticEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn of_type(&self, event_type: DiagnosticEventType) -> Vec<MemoryDiagnosticEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

impl DiagnosticsSink for RecordingSink {
    fn record(&self, event: &MemoryDiagnosticEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Handle used by the scheduler to publish events.
#[derive(Debug, Clone)]
pub struct DiagnosticsEmitter {
    tx: mpsc::Sender<MemoryDiagnosticEvent>,
}

impl DiagnosticsEmitter {
    /// Spawn the drain loop and return the emitter handle.
    pub fn start(sink: Arc<dyn DiagnosticsSink>) -> Self {
        let (tx, mut rx) = mpsc::channel::<MemoryDiagnosticEvent>(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.record(&event);
            }
        });
        Self { tx }
    }

    /// Publish one event.  Never blocks; on channel overflow the event is
    /// dropped and a warning logged.
    pub fn emit(&self, event: MemoryDiagnosticEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "diagnostic event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn emitted_events_reach_the_sink() {
        let sink = Arc::new(RecordingSink::default());
        let emitter = DiagnosticsEmitter::start(Arc::clone(&sink) as Arc<dyn DiagnosticsSink>);

        emitter.emit(
            MemoryDiagnosticEvent::new(DiagnosticEventType::FallbackActivated, LaneMode::DegradedShared)
                .model("wan-video-14b")
                .reason(FallbackReason::Quota),
        );

        tokio::time::timeout(Duration::from_secs(2), async {
            while sink.events().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("event should drain");

        let events = sink.of_type(DiagnosticEventType::FallbackActivated);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, Some(FallbackReason::Quota));
    }

    #[tokio::test]
    async fn emit_survives_a_saturated_channel() {
        // Current-thread runtime and no awaits between emits: the drain task
        // cannot run, so the channel fills past capacity.  Overflow must drop
        // events silently rather than block or panic.
        let sink = Arc::new(RecordingSink::default());
        let emitter = DiagnosticsEmitter::start(Arc::clone(&sink) as Arc<dyn DiagnosticsSink>);
        for _ in 0..(CHANNEL_CAPACITY * 2) {
            emitter.emit(MemoryDiagnosticEvent::new(
                DiagnosticEventType::MemoryCleanup,
                LaneMode::DegradedShared,
            ));
        }
    }
}
