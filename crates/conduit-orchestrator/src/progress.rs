use crate::types::{ProgressEvent, StageStatus, WorkflowStage};
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Fan-out of workflow progress events.
///
/// Emission never blocks and never fails: with no subscribers the event is
/// dropped, and slow subscribers lag rather than stall the workflow.
pub struct ProgressReporter {
    tx: broadcast::Sender<ProgressEvent>,
    emitted: AtomicU64,
}

impl ProgressReporter {
    /// `capacity` is the per-subscriber backlog before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            emitted: AtomicU64::new(0),
        }
    }

    /// A receiver for every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Publish one event. Dropped silently when nobody listens.
    pub fn emit(&self, workflow_id: Uuid, stage: WorkflowStage, status: StageStatus, detail: Value) {
        let event = ProgressEvent {
            workflow_id,
            stage,
            status,
            detail,
            timestamp: Utc::now(),
        };
        debug!(workflow_id = %workflow_id, event = %event.label(), "Progress");
        self.emitted.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(event);
    }

    /// Events emitted since creation.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(256)
    }
}
