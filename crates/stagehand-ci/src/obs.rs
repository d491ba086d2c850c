//! Structured observability hooks for the build lifecycle.
//!
//! - Build-scoped tracing spans via [`BuildSpan`]
//! - `emit_*` functions for lifecycle events: start, pause, resume, stage
//!   failure, finish

use std::future::Future;

use tracing::instrument::Instrumented;
use tracing::{info, warn, Instrument};

/// Tracing span tagging everything emitted during one build run.
///
/// ```ignore
/// let run = BuildSpan::new(&build_id).run(async move { executor.execute(ctx, anchor).await });
/// tokio::spawn(run);
/// ```
pub struct BuildSpan {
    span: tracing::Span,
}

impl BuildSpan {
    pub fn new(build_id: &str) -> Self {
        Self {
            span: tracing::info_span!("stagehand.build", build_id = %build_id),
        }
    }

    /// Attach the span to a future for its whole lifetime, across awaits.
    pub fn run<F: Future>(self, fut: F) -> Instrumented<F> {
        fut.instrument(self.span)
    }
}

pub fn emit_build_started(build_id: &str, repository: &str, branch: &str) {
    info!(event = "build.started", build_id = %build_id, repository = %repository, branch = %branch);
}

pub fn emit_build_finished(build_id: &str, status: &str, duration_ms: u64) {
    info!(
        event = "build.finished",
        build_id = %build_id,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_build_paused(build_id: &str, stage: &str, point: &str) {
    info!(event = "build.paused", build_id = %build_id, stage = %stage, point = %point);
}

pub fn emit_build_resumed(build_id: &str, stage: &str, point: &str, detached: bool) {
    info!(
        event = "build.resumed",
        build_id = %build_id,
        stage = %stage,
        point = %point,
        detached = detached,
    );
}

/// Stage failure (warning level).
pub fn emit_stage_failed(build_id: &str, stage: &str, error: &dyn std::fmt::Display) {
    warn!(event = "stage.failed", build_id = %build_id, stage = %stage, error = %error);
}
