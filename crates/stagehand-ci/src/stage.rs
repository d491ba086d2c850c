//! Stage definitions, per-repository configuration and the step plan.

use std::path::Path;

use serde::{Deserialize, Serialize};
use stagehand_state::{Breakpoints, CheckpointStage, PausePoint};
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};

/// File name of the per-repository configuration, at the repository root.
pub const CONFIG_FILE: &str = ".ci.yaml";

/// Every stage of the pipeline, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Clone and checkout.
    Setup,
    Lint,
    Format,
    /// Image build and container start.
    Build,
    Test,
    /// User commands from `run_commands`.
    Custom,
}

impl Stage {
    /// Tag used for log lines and failures.
    pub fn tag(&self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::Lint => "lint",
            Stage::Format => "format",
            Stage::Build => "build",
            Stage::Test => "test",
            Stage::Custom => "custom",
        }
    }
}

/// What to do when a test run collects zero tests.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ZeroTestsPolicy {
    /// Log a warning and let the stage pass.
    #[default]
    Warn,
    /// Fail the test stage.
    Fail,
}

/// Per-build stage configuration, read once from `.ci.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub lint: bool,
    pub format: bool,
    pub build: bool,
    pub test: bool,

    /// Shell commands run after test, in order.
    pub run_commands: Vec<String>,

    pub pause_before_setup: bool,
    pub pause_after_setup: bool,
    pub pause_before_build: bool,
    pub pause_after_build: bool,
    pub pause_before_test: bool,
    pub pause_after_test: bool,

    pub lint_command: String,
    pub format_command: String,
    pub test_command: String,
    pub zero_tests: ZeroTestsPolicy,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            lint: true,
            format: true,
            build: true,
            test: true,
            run_commands: Vec::new(),
            pause_before_setup: false,
            pause_after_setup: false,
            pause_before_build: false,
            pause_after_build: false,
            pause_before_test: false,
            pause_after_test: false,
            lint_command: "pylint .".to_string(),
            format_command: "black --check .".to_string(),
            test_command: "pytest".to_string(),
            zero_tests: ZeroTestsPolicy::Warn,
        }
    }
}

impl StageConfig {
    /// Parse YAML text. An empty document yields the defaults.
    pub fn from_yaml(text: &str) -> PipelineResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yml::from_str(text)
            .map_err(|e| PipelineError::Configuration(format!("invalid {CONFIG_FILE}: {e}")))
    }

    /// Load `.ci.yaml` from a checked-out repository.
    ///
    /// A missing file is not an error and yields the defaults.
    pub fn load(repo_dir: &Path) -> PipelineResult<Self> {
        let path = repo_dir.join(CONFIG_FILE);
        if !path.exists() {
            debug!(path = %path.display(), "no stage configuration, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).map_err(|e| {
            PipelineError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&text)
    }

    /// Like [`StageConfig::load`], but logs configuration errors and falls
    /// back to the defaults.
    pub fn load_or_default(repo_dir: &Path) -> Self {
        match Self::load(repo_dir) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "using default stage configuration");
                Self::default()
            }
        }
    }

    /// Rebuild from the copy persisted on the execution record.
    pub fn from_value(value: &serde_json::Value) -> PipelineResult<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone()).map_err(|e| {
            PipelineError::Configuration(format!("stored stage configuration is invalid: {e}"))
        })
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn is_enabled(&self, stage: Stage) -> bool {
        match stage {
            Stage::Setup => true,
            Stage::Lint => self.lint,
            Stage::Format => self.format,
            Stage::Build => self.build,
            Stage::Test => self.test,
            Stage::Custom => !self.run_commands.is_empty(),
        }
    }

    /// Breakpoints seeded from the six pause flags.
    pub fn breakpoints(&self) -> Breakpoints {
        let mut bps = Breakpoints::default();
        let flags = [
            (CheckpointStage::Setup, PausePoint::Before, self.pause_before_setup),
            (CheckpointStage::Setup, PausePoint::After, self.pause_after_setup),
            (CheckpointStage::Build, PausePoint::Before, self.pause_before_build),
            (CheckpointStage::Build, PausePoint::After, self.pause_after_build),
            (CheckpointStage::Test, PausePoint::Before, self.pause_before_test),
            (CheckpointStage::Test, PausePoint::After, self.pause_after_test),
        ];
        for (stage, point, enabled) in flags {
            bps.set(stage, point, enabled);
        }
        bps
    }
}

/// One unit of work in a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Position before anything has run.
    Start,
    Checkpoint(CheckpointStage, PausePoint),
    Run(Stage),
    /// The n-th entry of `run_commands`.
    Command(usize),
}

/// The ordered steps for a configuration.
///
/// Disabled stages contribute neither their body nor their checkpoints.
/// Setup is always present, so the steps up to and including
/// `Checkpoint(Setup, After)` do not depend on the configuration.
pub fn plan(config: &StageConfig) -> Vec<Step> {
    use CheckpointStage as C;
    use PausePoint::{After, Before};

    let mut steps = vec![
        Step::Start,
        Step::Checkpoint(C::Setup, Before),
        Step::Run(Stage::Setup),
        Step::Checkpoint(C::Setup, After),
    ];
    if config.lint {
        steps.push(Step::Run(Stage::Lint));
    }
    if config.format {
        steps.push(Step::Run(Stage::Format));
    }
    if config.build {
        steps.extend([
            Step::Checkpoint(C::Build, Before),
            Step::Run(Stage::Build),
            Step::Checkpoint(C::Build, After),
        ]);
    }
    if config.test {
        steps.extend([
            Step::Checkpoint(C::Test, Before),
            Step::Run(Stage::Test),
            Step::Checkpoint(C::Test, After),
        ]);
    }
    steps.extend((0..config.run_commands.len()).map(Step::Command));
    steps
}

/// Where a resumed run continues from.
///
/// Each paused checkpoint maps to an anchor step; execution picks up with
/// the step after the anchor in the current plan:
///
/// | paused at       | continues with                         |
/// |-----------------|----------------------------------------|
/// | setup, before   | setup and everything after it          |
/// | setup, after    | lint/format, then build onwards        |
/// | build, before   | build, then test                       |
/// | build, after    | test                                   |
/// | test, before    | test                                   |
/// | test, after     | remaining run_commands, then passed    |
pub fn resume_anchor(stage: CheckpointStage, point: PausePoint) -> Step {
    use CheckpointStage as C;
    use PausePoint::{After, Before};

    match (stage, point) {
        (C::Setup, Before) => Step::Checkpoint(C::Setup, Before),
        (C::Setup, After) => Step::Checkpoint(C::Setup, After),
        (C::Build, Before) => Step::Checkpoint(C::Build, Before),
        (C::Build, After) => Step::Checkpoint(C::Build, After),
        (C::Test, Before) => Step::Checkpoint(C::Test, Before),
        (C::Test, After) => Step::Checkpoint(C::Test, After),
    }
}

/// Successor of a step within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Step(Step),
    /// The plan is exhausted.
    Done,
    /// The current step is not part of the plan.
    OffPlan,
}

pub fn next_step(config: &StageConfig, current: Step) -> Next {
    let steps = plan(config);
    match steps.iter().position(|s| *s == current) {
        Some(pos) => steps.get(pos + 1).copied().map_or(Next::Done, Next::Step),
        None => Next::OffPlan,
    }
}
