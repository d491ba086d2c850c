//! Live event channel and the per-build log sink.
//!
//! Every log line goes two ways: out on the [`EventBus`] immediately, and
//! into the sink's pending buffer until the flusher persists it.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagehand_state::{Breakpoints, BuildId, BuildStatus};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

/// Events published to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PipelineEvent {
    Log {
        timestamp: DateTime<Utc>,
        tag: String,
        message: String,
        build_id: BuildId,
    },
    #[serde(rename = "active-stage-update")]
    ActiveStage { build_id: BuildId, stage: String },
    BuildStarted {
        build_id: BuildId,
        repository: String,
        display_name: String,
    },
    BuildFinished {
        build_id: BuildId,
        status: BuildStatus,
        duration_ms: u64,
    },
    PauseConfigured {
        build_id: BuildId,
        breakpoints: Breakpoints,
    },
    BreakpointsUpdated {
        build_id: BuildId,
        breakpoints: Breakpoints,
    },
    /// Whether clients may edit breakpoints (true while paused).
    AllowBreakpointEdit { build_id: BuildId, allowed: bool },
    DebugSessionStarted {
        build_id: BuildId,
        container: String,
        cwd: String,
    },
    ConsoleOutput { build_id: BuildId, text: String },
}

impl PipelineEvent {
    pub fn build_id(&self) -> &BuildId {
        match self {
            PipelineEvent::Log { build_id, .. }
            | PipelineEvent::ActiveStage { build_id, .. }
            | PipelineEvent::BuildStarted { build_id, .. }
            | PipelineEvent::BuildFinished { build_id, .. }
            | PipelineEvent::PauseConfigured { build_id, .. }
            | PipelineEvent::BreakpointsUpdated { build_id, .. }
            | PipelineEvent::AllowBreakpointEdit { build_id, .. }
            | PipelineEvent::DebugSessionStarted { build_id, .. }
            | PipelineEvent::ConsoleOutput { build_id, .. } => build_id,
        }
    }
}

/// Process-wide broadcast channel for [`PipelineEvent`]s.
///
/// Publishing never blocks; slow subscribers lag and lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Per-build log sink. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LogSink {
    build_id: BuildId,
    bus: EventBus,
    pending: Arc<Mutex<Vec<String>>>,
}

impl LogSink {
    pub fn new(build_id: BuildId, bus: EventBus) -> Self {
        Self {
            build_id,
            bus,
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    /// Record one line of build output for `tag`.
    pub fn emit(&self, tag: &str, message: &str) {
        let timestamp = Utc::now();
        let line = format!("[{}] [{tag}] {message}\n", timestamp.format("%H:%M:%S"));
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
        self.bus.publish(PipelineEvent::Log {
            timestamp,
            tag: tag.to_string(),
            message: message.to_string(),
            build_id: self.build_id.clone(),
        });
    }

    /// Drain lines not yet persisted.
    pub fn take_pending(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Put back lines whose persistence failed, ahead of anything newer.
    pub fn requeue(&self, mut lines: Vec<String>) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        lines.append(&mut pending);
        *pending = lines;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_names() {
        let event = PipelineEvent::ActiveStage {
            build_id: BuildId::from("b-1"),
            stage: "build".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "active-stage-update");
        assert_eq!(json["build_id"], "b-1");

        let event = PipelineEvent::AllowBreakpointEdit {
            build_id: BuildId::from("b-1"),
            allowed: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "allow-breakpoint-edit");
    }

    #[tokio::test]
    async fn test_sink_publishes_and_buffers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let sink = LogSink::new(BuildId::from("b-2"), bus);

        sink.emit("test", "collected 3 items");

        match rx.recv().await.unwrap() {
            PipelineEvent::Log { tag, message, .. } => {
                assert_eq!(tag, "test");
                assert_eq!(message, "collected 3 items");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let lines = sink.take_pending();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("[test] collected 3 items\n"));
        assert!(sink.take_pending().is_empty());
    }

    #[test]
    fn test_requeue_keeps_order() {
        let sink = LogSink::new(BuildId::from("b-3"), EventBus::default());
        sink.emit("build", "one");
        let failed = sink.take_pending();
        sink.emit("build", "two");
        sink.requeue(failed);

        let lines = sink.take_pending();
        assert!(lines[0].contains("one"));
        assert!(lines[1].contains("two"));
    }
}
