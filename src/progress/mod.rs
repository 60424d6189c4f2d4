//! Fan-out of lifecycle events from any pipeline step to all connected
//! control-UI clients, in FIFO order per pipeline (§4.B, C7).

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Bound on each subscriber's queue; a slow reader has its oldest events
/// dropped rather than blocking producers (§4.B, §5).
const SUBSCRIBER_CAPACITY: usize = 1024;

/// A single pipeline-run event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Monotonically increasing per-process sequence number, used to detect
    /// subscriber drops.
    pub sequence: u64,
    /// The pipeline-run this event belongs to (I-PR1: FIFO within one id).
    pub pipeline_id: Uuid,
    /// Worktree the pipeline is operating on.
    pub worktree: String,
    /// Pipeline step name (e.g. `"git_worktree_add"`).
    pub step: String,
    /// Event severity/kind.
    pub kind: ProgressEventKind,
    /// Human-readable message, already sanitized.
    pub message: String,
    /// Wall-clock time the event was emitted.
    pub timestamp: DateTime<Utc>,
}

/// Kind of a single progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    /// A step started.
    Started,
    /// A step completed successfully.
    Completed,
    /// A best-effort step failed; the pipeline continues.
    Warning,
    /// A fatal step failed; the pipeline aborts.
    Failed,
    /// The whole pipeline finished (terminal event for its id).
    PipelineFinished,
}

/// Single-writer-per-pipeline, multi-reader broadcast bus. No durability:
/// subscribers connected after an event was emitted never see it (§4.B).
pub struct ProgressBus {
    sender: broadcast::Sender<ProgressEvent>,
    sequence: AtomicU64,
}

impl ProgressBus {
    /// Creates a bus with the default per-subscriber queue bound.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Emits one event, stamping it with the next sequence number and the
    /// current time. Best-effort: if there are no subscribers, the event is
    /// simply dropped (broadcast semantics), which is correct since no
    /// durability is promised.
    pub fn emit(&self, pipeline_id: Uuid, worktree: &str, step: &str, kind: ProgressEventKind, message: impl Into<String>) {
        let event = ProgressEvent {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            pipeline_id,
            worktree: worktree.to_owned(),
            step: step.to_owned(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        };
        // Err means no receivers; that's fine, not an error condition.
        let _ = self.sender.send(event);
    }

    /// Subscribes a new client; it receives only events emitted after this
    /// call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle scoped to one pipeline run, so call sites don't have to repeat
/// `pipeline_id`/`worktree` on every `emit` call.
pub struct PipelineProgress<'a> {
    bus: &'a ProgressBus,
    pipeline_id: Uuid,
    worktree: String,
}

impl<'a> PipelineProgress<'a> {
    /// Starts a new pipeline-run id against `bus`.
    #[must_use]
    pub fn start(bus: &'a ProgressBus, worktree: impl Into<String>) -> Self {
        Self {
            bus,
            pipeline_id: Uuid::new_v4(),
            worktree: worktree.into(),
        }
    }

    /// The generated pipeline-run id.
    #[must_use]
    pub fn pipeline_id(&self) -> Uuid {
        self.pipeline_id
    }

    /// Emits a `Started` event for `step`.
    pub fn step_started(&self, step: &str) {
        self.bus.emit(self.pipeline_id, &self.worktree, step, ProgressEventKind::Started, format!("starting {step}"));
    }

    /// Emits a `Completed` event for `step`.
    pub fn step_completed(&self, step: &str, message: impl Into<String>) {
        self.bus.emit(self.pipeline_id, &self.worktree, step, ProgressEventKind::Completed, message);
    }

    /// Emits a `Warning` event for a best-effort step that failed.
    pub fn step_warning(&self, step: &str, message: impl Into<String>) {
        self.bus.emit(self.pipeline_id, &self.worktree, step, ProgressEventKind::Warning, message);
    }

    /// Emits a `Failed` event for a fatal step, then the terminal
    /// `PipelineFinished` event, since once a pipeline fails no further
    /// events are expected under its id (I-PR1).
    pub fn step_failed(&self, step: &str, message: impl Into<String>) {
        let message = message.into();
        self.bus.emit(self.pipeline_id, &self.worktree, step, ProgressEventKind::Failed, message);
        self.finished();
    }

    /// Emits the terminal event for this pipeline-run id.
    pub fn finished(&self) {
        self.bus.emit(self.pipeline_id, &self.worktree, "finished", ProgressEventKind::PipelineFinished, "pipeline finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_fifo_per_pipeline() {
        let bus = ProgressBus::new();
        let mut rx = bus.subscribe();
        let progress = PipelineProgress::start(&bus, "feat-a");

        progress.step_started("slugify");
        progress.step_completed("slugify", "ok");
        progress.step_started("git_worktree_add");

        let e1 = rx.recv().await.unwrap();
        let e2 = rx.recv().await.unwrap();
        let e3 = rx.recv().await.unwrap();

        assert!(e1.sequence < e2.sequence);
        assert!(e2.sequence < e3.sequence);
        assert_eq!(e1.pipeline_id, e3.pipeline_id);
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus = ProgressBus::new();
        let progress = PipelineProgress::start(&bus, "feat-a");
        progress.step_started("slugify");

        let mut rx = bus.subscribe();
        progress.step_completed("slugify", "ok");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.step, "slugify");
        assert_eq!(event.kind, ProgressEventKind::Completed);
    }
}
