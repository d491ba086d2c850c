//! Breakpoints and the pause/resume protocol.
//!
//! A paused build parks its executor on a oneshot channel registered here.
//! Resume either fires that channel (same process) or, when no executor is
//! waiting (after a restart), reports where the build must be re-entered.
//!
//! The execution record is the source of truth for pause state; the waiter
//! and pause-request tables are a cache of the live process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use stagehand_state::{
    Breakpoints, BuildId, CheckpointStage, ExecutionRecord, ExecutionStore, PausePoint,
    StorageError,
};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::debug::DebugSessions;
use crate::error::{CheckpointError, PipelineError, PipelineResult};
use crate::events::{EventBus, LogSink, PipelineEvent};
use crate::obs;

/// Result of a resume request.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// The build was not paused; nothing happened.
    NotPaused,
    /// A waiting executor in this process was released.
    Signalled,
    /// No executor is waiting; the caller must restart from this checkpoint.
    /// `record` is the record as written when the pause was cleared.
    Detached {
        stage: CheckpointStage,
        point: PausePoint,
        record: Box<ExecutionRecord>,
    },
    /// The stored pause location is not a known checkpoint. The pause was
    /// cleared and nothing else happened.
    Unrecognized { stage: String, point: String },
}

/// Per-process pause/resume coordinator, keyed by build.
pub struct Coordinator {
    store: Arc<dyn ExecutionStore>,
    bus: EventBus,
    sessions: Arc<DebugSessions>,
    waiters: Mutex<HashMap<BuildId, oneshot::Sender<()>>>,
    requested: Mutex<HashSet<BuildId>>,
    resume_lock: Mutex<()>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn ExecutionStore>, bus: EventBus, sessions: Arc<DebugSessions>) -> Self {
        Self {
            store,
            bus,
            sessions,
            waiters: Mutex::new(HashMap::new()),
            requested: Mutex::new(HashSet::new()),
            resume_lock: Mutex::new(()),
        }
    }

    /// Announce and persist the checkpoint, then block here if a breakpoint
    /// or a pause request applies. Returns once resumed.
    pub async fn checkpoint(
        &self,
        sink: &LogSink,
        stage: CheckpointStage,
        point: PausePoint,
    ) -> PipelineResult<()> {
        let build_id = sink.build_id();
        self.bus.publish(PipelineEvent::ActiveStage {
            build_id: build_id.clone(),
            stage: stage.as_str().to_string(),
        });
        let record = self
            .store
            .update(build_id, Box::new(move |r| r.enter_stage(stage)))
            .await?;
        if record.status.is_terminal() {
            return Ok(());
        }

        let requested = self.requested.lock().await.remove(build_id);
        if !requested && !record.breakpoints.is_set(stage, point) {
            return Ok(());
        }
        self.pause(sink, stage, point).await
    }

    async fn pause(
        &self,
        sink: &LogSink,
        stage: CheckpointStage,
        point: PausePoint,
    ) -> PipelineResult<()> {
        let build_id = sink.build_id();

        // Registered before the pause is persisted so a resume that observes
        // is_paused always finds the waiter.
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(build_id.clone(), tx);

        let parked = self
            .store
            .update(
                build_id,
                Box::new(move |r| {
                    r.pause_at(stage, point);
                }),
            )
            .await;
        match parked {
            Ok(record) if record.is_paused => {}
            Ok(_) => {
                self.waiters.lock().await.remove(build_id);
                return Ok(());
            }
            Err(e) => {
                self.waiters.lock().await.remove(build_id);
                return Err(e.into());
            }
        }

        obs::emit_build_paused(build_id.as_str(), stage.as_str(), point.as_str());
        sink.emit("pause", &format!("paused {point} {stage}"));
        self.bus.publish(PipelineEvent::AllowBreakpointEdit {
            build_id: build_id.clone(),
            allowed: true,
        });
        if let Err(e) = self.sessions.attach(build_id).await {
            warn!(build_id = %build_id, error = %e, "debug session unavailable while paused");
        }

        rx.await.map_err(|_| {
            PipelineError::Interrupted(format!("pause at {point} {stage} was abandoned"))
        })?;
        sink.emit("pause", &format!("resumed {point} {stage}"));
        Ok(())
    }

    /// Pause at the next checkpoint, regardless of breakpoints.
    ///
    /// Returns `false` if the build has already finished.
    pub async fn request_pause(&self, build_id: &BuildId) -> PipelineResult<bool> {
        let record = self
            .store
            .get(build_id)
            .await?
            .ok_or_else(|| CheckpointError::BuildNotFound(build_id.to_string()))?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        self.requested.lock().await.insert(build_id.clone());
        debug!(build_id = %build_id, "pause requested");
        Ok(true)
    }

    /// Drop pause requests for a build that will reach no further checkpoint.
    pub async fn forget(&self, build_id: &BuildId) {
        if self.requested.lock().await.remove(build_id) {
            debug!(build_id = %build_id, "pause request dropped, build finished");
        }
    }

    #[cfg(test)]
    pub(crate) async fn has_pause_request(&self, build_id: &BuildId) -> bool {
        self.requested.lock().await.contains(build_id)
    }

    /// Clear the build's pause and continue it. Idempotent.
    pub async fn resume(&self, build_id: &BuildId) -> PipelineResult<ResumeOutcome> {
        let _serial = self.resume_lock.lock().await;

        let record = self
            .store
            .get(build_id)
            .await?
            .ok_or_else(|| CheckpointError::BuildNotFound(build_id.to_string()))?;
        let Some((stage, point)) = record
            .paused_at()
            .map(|(s, p)| (s.to_string(), p.to_string()))
        else {
            debug!(build_id = %build_id, "resume ignored, build not paused");
            return Ok(ResumeOutcome::NotPaused);
        };

        let cleared = self
            .store
            .update(build_id, Box::new(|r| r.clear_pause()))
            .await?;
        self.bus.publish(PipelineEvent::AllowBreakpointEdit {
            build_id: build_id.clone(),
            allowed: false,
        });

        let waiter = self.waiters.lock().await.remove(build_id);
        if let Some(tx) = waiter {
            if tx.send(()).is_ok() {
                obs::emit_build_resumed(build_id.as_str(), &stage, &point, false);
                return Ok(ResumeOutcome::Signalled);
            }
        }

        match (
            stage.parse::<CheckpointStage>(),
            point.parse::<PausePoint>(),
        ) {
            (Ok(stage), Ok(point)) => {
                obs::emit_build_resumed(build_id.as_str(), stage.as_str(), point.as_str(), true);
                Ok(ResumeOutcome::Detached {
                    stage,
                    point,
                    record: Box::new(cleared),
                })
            }
            _ => {
                warn!(
                    build_id = %build_id,
                    stage = %stage,
                    point = %point,
                    "paused at an unknown checkpoint, nothing to resume"
                );
                Ok(ResumeOutcome::Unrecognized { stage, point })
            }
        }
    }

    /// Validate and merge a breakpoint update. Invalid updates change nothing.
    pub async fn update_breakpoints(
        &self,
        build_id: &BuildId,
        update: &Value,
    ) -> PipelineResult<Breakpoints> {
        let changes = parse_breakpoint_update(update)?;
        let record = self
            .store
            .update(
                build_id,
                Box::new(move |r| {
                    for (stage, point, enabled) in changes {
                        r.breakpoints.set(stage, point, enabled);
                    }
                }),
            )
            .await
            .map_err(|e| match e {
                StorageError::NotFound { build_id } => {
                    PipelineError::Checkpoint(CheckpointError::BuildNotFound(build_id))
                }
                other => other.into(),
            })?;

        self.bus.publish(PipelineEvent::BreakpointsUpdated {
            build_id: build_id.clone(),
            breakpoints: record.breakpoints.clone(),
        });
        Ok(record.breakpoints)
    }
}

/// Parse `{"<stage>": {"before": bool, "after": bool}, ...}`.
///
/// Every entry is checked before anything is returned, so a single bad
/// entry rejects the whole update.
pub fn parse_breakpoint_update(
    update: &Value,
) -> Result<Vec<(CheckpointStage, PausePoint, bool)>, CheckpointError> {
    let stages = update
        .as_object()
        .ok_or_else(|| CheckpointError::Malformed(format!("expected an object, got {update}")))?;

    let mut changes = Vec::new();
    for (stage_name, points) in stages {
        let stage: CheckpointStage = stage_name
            .parse()
            .map_err(|_| CheckpointError::UnknownStage(stage_name.clone()))?;
        let points = points.as_object().ok_or_else(|| {
            CheckpointError::Malformed(format!("breakpoints for {stage_name} must be an object"))
        })?;
        for (point_name, value) in points {
            let point: PausePoint =
                point_name
                    .parse()
                    .map_err(|_| CheckpointError::UnknownPoint {
                        stage: stage_name.clone(),
                        point: point_name.clone(),
                    })?;
            let enabled = value.as_bool().ok_or_else(|| CheckpointError::InvalidValue {
                stage: stage_name.clone(),
                point: point_name.clone(),
                value: value.to_string(),
            })?;
            changes.push((stage, point, enabled));
        }
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_valid_update() {
        let changes = parse_breakpoint_update(&json!({
            "test": {"before": true},
            "build": {"before": false, "after": true}
        }))
        .unwrap();
        assert_eq!(changes.len(), 3);
        assert!(changes.contains(&(CheckpointStage::Test, PausePoint::Before, true)));
        assert!(changes.contains(&(CheckpointStage::Build, PausePoint::After, true)));
    }

    #[test]
    fn test_parse_rejects_unknown_stage() {
        let err = parse_breakpoint_update(&json!({
            "build": {"after": true},
            "deploy": {"before": true}
        }))
        .unwrap_err();
        assert!(matches!(err, CheckpointError::UnknownStage(s) if s == "deploy"));
    }

    #[test]
    fn test_parse_rejects_non_boolean() {
        let err = parse_breakpoint_update(&json!({"test": {"before": "yes"}})).unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidValue { .. }));

        let err = parse_breakpoint_update(&json!({"test": {"during": true}})).unwrap_err();
        assert!(matches!(err, CheckpointError::UnknownPoint { .. }));

        let err = parse_breakpoint_update(&json!(["test"])).unwrap_err();
        assert!(matches!(err, CheckpointError::Malformed(_)));

        let err = parse_breakpoint_update(&json!({"setup": true})).unwrap_err();
        assert!(matches!(err, CheckpointError::Malformed(_)));
    }
}
