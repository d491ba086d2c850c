//! Error types for the pipeline engine.

use stagehand_state::StorageError;

/// Errors produced by the pipeline engine.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Repository configuration missing or unreadable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A command exited non-zero or a quality gate was not met.
    #[error("stage '{tag}' failed: {reason}")]
    StageFailure {
        tag: String,
        exit_code: Option<i32>,
        reason: String,
        output: String,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// Record store unreachable or the record is missing.
    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),

    /// Trigger payload could not be understood.
    #[error("invalid trigger event: {0}")]
    InvalidEvent(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was cut short before reaching a terminal state.
    #[error("interrupted: {0}")]
    Interrupted(String),
}

impl PipelineError {
    pub fn stage_failure(
        tag: impl Into<String>,
        exit_code: Option<i32>,
        reason: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        PipelineError::StageFailure {
            tag: tag.into(),
            exit_code,
            reason: reason.into(),
            output: output.into(),
        }
    }

    /// Stage tag for failures, used to prefix user-visible messages.
    pub fn tag(&self) -> Option<&str> {
        match self {
            PipelineError::StageFailure { tag, .. } => Some(tag),
            _ => None,
        }
    }
}

/// Rejected breakpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("unknown pause point '{point}' for stage {stage}")]
    UnknownPoint { stage: String, point: String },

    #[error("breakpoint {stage}.{point} must be a boolean, got {value}")]
    InvalidValue {
        stage: String,
        point: String,
        value: String,
    },

    #[error("malformed breakpoint update: {0}")]
    Malformed(String),

    #[error("build not found: {0}")]
    BuildNotFound(String),
}

/// Debug session failures. Local to the caller; never touch the record.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no active debug session for {0}")]
    NotActive(String),

    #[error("cannot attach to {build_id}: {reason}")]
    NotAttachable { build_id: String, reason: String },

    #[error("failed to start shell: {0}")]
    Spawn(String),

    #[error("session io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("build not found: {0}")]
    BuildNotFound(String),

    #[error("session lookup failed: {0}")]
    Storage(#[from] StorageError),
}

/// Check-run client failures. Logged by the engine, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("check api returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("check api response missing id")]
    MissingId,
}

/// Result type for engine operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
