//! Background persistence of build log lines.

use std::sync::Arc;
use std::time::Duration;

use stagehand_state::{ExecutionStore, StorageError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::LogSink;

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// Keep flushing.
    Live,
    /// The record is terminal or gone; stop.
    Closed,
}

/// Persist whatever the sink has buffered.
///
/// Lines that fail to persist are requeued for the next pass. Once the
/// record has left `Pending` nothing more is appended.
pub async fn flush_once(store: &dyn ExecutionStore, sink: &LogSink) -> FlushState {
    let lines = sink.take_pending();
    if lines.is_empty() {
        return FlushState::Live;
    }

    let text = lines.concat();
    match store
        .update(
            sink.build_id(),
            Box::new(move |record| {
                record.append_log(&text);
            }),
        )
        .await
    {
        Ok(record) if record.status.is_terminal() => FlushState::Closed,
        Ok(_) => FlushState::Live,
        Err(StorageError::NotFound { .. }) => FlushState::Closed,
        Err(e) => {
            warn!(build_id = %sink.build_id(), error = %e, "log flush failed, retrying next tick");
            sink.requeue(lines);
            FlushState::Live
        }
    }
}

/// Periodic flusher bound to one build.
pub struct LogFlusher {
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl LogFlusher {
    pub fn spawn(store: Arc<dyn ExecutionStore>, sink: LogSink, interval: Duration) -> Self {
        let stop = Arc::new(Notify::new());
        let stopped = stop.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stopped.notified() => break,
                    _ = ticker.tick() => {
                        if flush_once(store.as_ref(), &sink).await == FlushState::Closed {
                            debug!(build_id = %sink.build_id(), "log flusher closed");
                            break;
                        }
                    }
                }
            }
        });
        Self { stop, handle }
    }

    /// Stop the task and wait for an in-flight pass to finish.
    pub async fn shutdown(self) {
        self.stop.notify_one();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "log flusher task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use chrono::Utc;
    use stagehand_state::fakes::MemoryExecutionStore;
    use stagehand_state::{BuildId, BuildStatus, ExecutionRecord};

    async fn setup() -> (Arc<MemoryExecutionStore>, LogSink) {
        let store = Arc::new(MemoryExecutionStore::new());
        let id = BuildId::from("flush-1");
        store
            .create(ExecutionRecord::new(id.clone(), "acme/w", "main", "sha", "PR"))
            .await
            .unwrap();
        (store, LogSink::new(id, EventBus::default()))
    }

    #[tokio::test]
    async fn test_flush_appends_pending_lines() {
        let (store, sink) = setup().await;
        sink.emit("setup", "cloning");
        sink.emit("setup", "done");

        assert_eq!(flush_once(store.as_ref(), &sink).await, FlushState::Live);
        let record = store.get(sink.build_id()).await.unwrap().unwrap();
        assert!(record.logs.contains("[setup] cloning"));
        assert!(record.logs.contains("[setup] done"));
    }

    #[tokio::test]
    async fn test_flush_requeues_on_backend_error() {
        let (store, sink) = setup().await;
        sink.emit("build", "step 1");

        store.set_offline(true);
        assert_eq!(flush_once(store.as_ref(), &sink).await, FlushState::Live);

        store.set_offline(false);
        flush_once(store.as_ref(), &sink).await;
        let record = store.get(sink.build_id()).await.unwrap().unwrap();
        assert!(record.logs.contains("step 1"));
    }

    #[tokio::test]
    async fn test_flush_stops_after_terminal() {
        let (store, sink) = setup().await;
        store
            .update(
                sink.build_id(),
                Box::new(|r| {
                    r.finish(BuildStatus::Passed, Utc::now());
                }),
            )
            .await
            .unwrap();

        sink.emit("test", "late line");
        assert_eq!(flush_once(store.as_ref(), &sink).await, FlushState::Closed);
        let record = store.get(sink.build_id()).await.unwrap().unwrap();
        assert!(!record.logs.contains("late line"));
    }

    #[tokio::test]
    async fn test_background_flusher_persists_and_shuts_down() {
        let (store, sink) = setup().await;
        let flusher = LogFlusher::spawn(store.clone(), sink.clone(), Duration::from_millis(5));
        sink.emit("lint", "rated at 9.00/10");

        for _ in 0..100 {
            let record = store.get(sink.build_id()).await.unwrap().unwrap();
            if record.logs.contains("rated at") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        flusher.shutdown().await;

        let record = store.get(sink.build_id()).await.unwrap().unwrap();
        assert!(record.logs.contains("rated at 9.00/10"));
    }
}
