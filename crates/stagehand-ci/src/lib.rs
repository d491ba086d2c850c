//! Stagehand CI - pipeline execution engine
//!
//! Provides a pull-request triggered pipeline that:
//! - Runs setup, lint, format, build, test and custom command stages
//! - Pauses at before/after checkpoints of setup, build and test
//! - Resumes paused builds in-process or after a restart
//! - Attaches interactive debug shells to build containers
//! - Streams logs and lifecycle events to live subscribers

pub mod breakpoints;
pub mod checks;
pub mod container;
pub mod control;
pub mod debug;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod flush;
pub mod gate;
pub mod obs;
pub mod runner;
pub mod settings;
pub mod stage;
pub mod telemetry;
pub mod webhook;

// Re-export key types
pub use breakpoints::{Coordinator, ResumeOutcome};
pub use checks::{CheckClient, CheckConclusion, GithubChecks, NoopChecks};
pub use control::{ControlCommand, ControlReply};
pub use debug::{AttachOutcome, DebugSessions, DockerShell, ShellSpawner};
pub use engine::{Engine, EngineBuilder, TriggerOutcome};
pub use error::{CheckError, CheckpointError, PipelineError, PipelineResult, SessionError};
pub use events::{EventBus, LogSink, PipelineEvent};
pub use gate::{GateVerdict, LintScoreGate, QualityGate, TestDiscoveryGate};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use settings::EngineSettings;
pub use stage::{Stage, StageConfig, ZeroTestsPolicy, CONFIG_FILE};
pub use webhook::PullRequestEvent;
