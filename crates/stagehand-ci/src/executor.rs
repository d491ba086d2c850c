//! Stage execution for one build.
//!
//! The executor walks the step plan for the build's configuration, starting
//! after an anchor step (`Step::Start` for a fresh run, a checkpoint when
//! resuming). Any error aborts the walk and goes through the single failure
//! path, which finalizes the record at most once.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use stagehand_state::{BuildId, BuildStatus, ExecutionRecord, ExecutionStore, PausePoint};
use tracing::{debug, info, warn};

use crate::breakpoints::Coordinator;
use crate::checks::{CheckClient, CheckConclusion};
use crate::container::{container_name, ContainerManager};
use crate::error::{PipelineError, PipelineResult};
use crate::events::{EventBus, LogSink, PipelineEvent};
use crate::flush::{flush_once, LogFlusher};
use crate::gate::{GateVerdict, LintScoreGate, QualityGate, TestDiscoveryGate};
use crate::obs;
use crate::runner::{CommandRunner, CommandSpec};
use crate::settings::EngineSettings;
use crate::stage::{next_step, Next, Stage, StageConfig, Step};

/// Everything a run needs to know about its build.
pub struct BuildContext {
    pub id: BuildId,
    pub repository: String,
    pub branch: String,
    pub commit: String,
    pub clone_url: String,
    /// Checkout directory, absolute.
    pub workdir: PathBuf,
    pub container: String,
    pub config: StageConfig,
    /// Configuration still has to be read from the checkout after setup.
    pub config_pending: bool,
    pub sink: LogSink,
    finalized: AtomicBool,
}

impl BuildContext {
    /// Rebuild the context from a stored record.
    ///
    /// A record without a stored configuration loads `.ci.yaml` after setup.
    pub fn from_record(record: &ExecutionRecord, settings: &EngineSettings, bus: &EventBus) -> Self {
        let (config, config_pending) = if record.config.is_null() {
            (StageConfig::default(), true)
        } else {
            match StageConfig::from_value(&record.config) {
                Ok(config) => (config, false),
                Err(e) => {
                    warn!(build_id = %record.id, error = %e, "using default stage configuration");
                    (StageConfig::default(), false)
                }
            }
        };

        let container = container_name(&record.id);
        let workspace = if settings.workspace.is_absolute() {
            settings.workspace.clone()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&settings.workspace))
                .unwrap_or_else(|_| settings.workspace.clone())
        };

        Self {
            id: record.id.clone(),
            repository: record.repository.clone(),
            branch: record.branch.clone(),
            commit: record.commit.clone(),
            clone_url: record.clone_url.clone(),
            workdir: workspace.join(&container),
            container,
            config,
            config_pending,
            sink: LogSink::new(record.id.clone(), bus.clone()),
            finalized: AtomicBool::new(false),
        }
    }
}

enum Drive {
    Completed,
    /// Resume anchor not in the plan; the build is left as it is.
    Halted,
}

/// Runs the stage sequence of a build.
pub struct StageExecutor {
    store: Arc<dyn ExecutionStore>,
    runner: Arc<dyn CommandRunner>,
    checks: Arc<dyn CheckClient>,
    coordinator: Arc<Coordinator>,
    containers: ContainerManager,
    bus: EventBus,
    settings: EngineSettings,
}

impl StageExecutor {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        runner: Arc<dyn CommandRunner>,
        checks: Arc<dyn CheckClient>,
        coordinator: Arc<Coordinator>,
        bus: EventBus,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            runner,
            checks,
            coordinator,
            containers: ContainerManager::new(settings.docker.clone()),
            bus,
            settings,
        }
    }

    /// Run the build from the step after `anchor` to a terminal state.
    ///
    /// Returns the final status, or the failure after it has been recorded.
    /// A run that is interrupted while paused returns `Pending` and leaves
    /// the record for startup recovery.
    pub async fn execute(&self, mut ctx: BuildContext, anchor: Step) -> PipelineResult<BuildStatus> {
        info!(build_id = %ctx.id, ?anchor, "pipeline run starting");
        let flusher = LogFlusher::spawn(
            self.store.clone(),
            ctx.sink.clone(),
            self.settings.flush_interval,
        );
        let result = self.drive(&mut ctx, anchor).await;
        flusher.shutdown().await;

        match result {
            Ok(Drive::Completed) => {
                self.finalize(&ctx, BuildStatus::Passed, "All stages passed")
                    .await;
                Ok(BuildStatus::Passed)
            }
            Ok(Drive::Halted) => {
                flush_once(self.store.as_ref(), &ctx.sink).await;
                Ok(BuildStatus::Pending)
            }
            Err(PipelineError::Interrupted(reason)) => {
                warn!(build_id = %ctx.id, %reason, "pipeline run interrupted");
                flush_once(self.store.as_ref(), &ctx.sink).await;
                Ok(BuildStatus::Pending)
            }
            Err(err) => {
                self.fail(&ctx, &err).await;
                Err(err)
            }
        }
    }

    async fn drive(&self, ctx: &mut BuildContext, anchor: Step) -> PipelineResult<Drive> {
        let mut current = anchor;
        loop {
            match next_step(&ctx.config, current) {
                Next::Step(step) => {
                    self.run_step(ctx, step).await?;
                    current = step;
                }
                Next::Done => return Ok(Drive::Completed),
                Next::OffPlan => {
                    warn!(build_id = %ctx.id, ?current, "resume point is not part of this pipeline");
                    ctx.sink.emit(
                        "resume",
                        &format!("cannot continue from {current:?}: stage is disabled"),
                    );
                    return Ok(Drive::Halted);
                }
            }
        }
    }

    async fn run_step(&self, ctx: &mut BuildContext, step: Step) -> PipelineResult<()> {
        match step {
            Step::Start => Ok(()),
            Step::Checkpoint(stage, point) => {
                self.coordinator.checkpoint(&ctx.sink, stage, point).await
            }
            Step::Run(stage) => {
                debug!(build_id = %ctx.id, stage = stage.tag(), "running stage");
                match stage {
                    Stage::Setup => self.setup(ctx).await,
                    Stage::Lint => self.lint(ctx).await,
                    Stage::Format => self.format(ctx).await,
                    Stage::Build => self.build(ctx).await,
                    Stage::Test => self.test(ctx).await,
                    Stage::Custom => Ok(()),
                }
            }
            Step::Command(index) => self.custom(ctx, index).await,
        }
    }

    async fn setup(&self, ctx: &mut BuildContext) -> PipelineResult<()> {
        let tag = Stage::Setup.tag();
        if tokio::fs::try_exists(&ctx.workdir).await? {
            tokio::fs::remove_dir_all(&ctx.workdir).await?;
        }
        if let Some(parent) = ctx.workdir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        ctx.sink.emit(
            tag,
            &format!("cloning {} ({})", ctx.clone_url, ctx.branch),
        );
        let mut clone = CommandSpec::new(tag, "git").arg("clone");
        if !ctx.branch.is_empty() {
            clone = clone.args(["--branch", ctx.branch.as_str()]);
        }
        let clone = clone
            .arg("--")
            .arg(ctx.clone_url.as_str())
            .arg(ctx.workdir.display().to_string());
        self.runner.run(&clone, &ctx.sink).await?;

        if !ctx.commit.is_empty() {
            // checkout takes paths after `--`, so the revision cannot go there.
            if ctx.commit.starts_with('-') {
                return Err(PipelineError::stage_failure(
                    tag,
                    None,
                    format!("refusing to check out revision '{}'", ctx.commit),
                    "",
                ));
            }
            let checkout = CommandSpec::new(tag, "git")
                .args(["checkout", "--quiet", ctx.commit.as_str()])
                .current_dir(&ctx.workdir);
            self.runner.run(&checkout, &ctx.sink).await?;
        }

        if ctx.config_pending {
            ctx.config = StageConfig::load_or_default(&ctx.workdir);
            ctx.config_pending = false;
            self.adopt_config(ctx).await?;
        }
        Ok(())
    }

    /// Persist a configuration read from the checkout and merge its pause
    /// flags into the build's breakpoints.
    async fn adopt_config(&self, ctx: &BuildContext) -> PipelineResult<()> {
        let value = ctx.config.to_value();
        let seeded = ctx.config.breakpoints();
        let any = seeded.any();
        let record = self
            .store
            .update(
                &ctx.id,
                Box::new(move |r| {
                    r.config = value;
                    for (stage, bp) in seeded.iter() {
                        for point in [PausePoint::Before, PausePoint::After] {
                            if bp.is_set(point) {
                                r.breakpoints.set(stage, point, true);
                            }
                        }
                    }
                }),
            )
            .await?;
        if any {
            self.bus.publish(PipelineEvent::PauseConfigured {
                build_id: ctx.id.clone(),
                breakpoints: record.breakpoints,
            });
        }
        Ok(())
    }

    async fn lint(&self, ctx: &BuildContext) -> PipelineResult<()> {
        let tag = Stage::Lint.tag();
        let spec = CommandSpec::shell(tag, &ctx.config.lint_command).current_dir(&ctx.workdir);
        let gate = LintScoreGate::default();

        // pylint's exit code is a message bitmask; a reported score decides.
        let output = match self.runner.run(&spec, &ctx.sink).await {
            Ok(out) => out.output,
            Err(PipelineError::StageFailure { output, .. }) if gate.score(&output).is_some() => {
                output
            }
            Err(e) => return Err(e),
        };
        apply_gate(ctx, tag, &gate, &output)
    }

    async fn format(&self, ctx: &BuildContext) -> PipelineResult<()> {
        let spec = CommandSpec::shell(Stage::Format.tag(), &ctx.config.format_command)
            .current_dir(&ctx.workdir);
        self.runner.run(&spec, &ctx.sink).await?;
        Ok(())
    }

    async fn build(&self, ctx: &BuildContext) -> PipelineResult<()> {
        let name = ctx.container.as_str();
        self.runner
            .run(&self.containers.build_image(name, &ctx.workdir), &ctx.sink)
            .await?;
        // A container from an earlier attempt of this build may still exist.
        if let Err(e) = self
            .runner
            .run(&self.containers.remove(name), &ctx.sink)
            .await
        {
            debug!(container = name, error = %e, "no stale container");
        }
        self.runner
            .run(&self.containers.start(name, &ctx.workdir), &ctx.sink)
            .await?;
        Ok(())
    }

    async fn test(&self, ctx: &BuildContext) -> PipelineResult<()> {
        let tag = Stage::Test.tag();
        let spec = self.build_env_command(ctx, tag, &ctx.config.test_command);
        let gate = TestDiscoveryGate::new(ctx.config.zero_tests)
            .with_marker(ctx.workdir.join(&self.settings.zero_tests_marker).exists());

        // pytest exits non-zero when it collects nothing; the gate decides.
        let output = match self.runner.run(&spec, &ctx.sink).await {
            Ok(out) => out.output,
            Err(PipelineError::StageFailure { output, .. }) if gate.zero_tests(&output) => output,
            Err(e) => return Err(e),
        };
        apply_gate(ctx, tag, &gate, &output)
    }

    async fn custom(&self, ctx: &BuildContext, index: usize) -> PipelineResult<()> {
        let tag = Stage::Custom.tag();
        let Some(command) = ctx.config.run_commands.get(index) else {
            return Ok(());
        };
        ctx.sink.emit(tag, &format!("$ {command}"));
        let spec = self.build_env_command(ctx, tag, command);
        self.runner.run(&spec, &ctx.sink).await?;
        Ok(())
    }

    /// Inside the build container when one was built, otherwise in the checkout.
    fn build_env_command(&self, ctx: &BuildContext, tag: &str, script: &str) -> CommandSpec {
        if ctx.config.build {
            self.containers.exec(&ctx.container, tag, script)
        } else {
            CommandSpec::shell(tag, script).current_dir(&ctx.workdir)
        }
    }

    async fn fail(&self, ctx: &BuildContext, err: &PipelineError) {
        let tag = err.tag().unwrap_or("pipeline");
        obs::emit_stage_failed(ctx.id.as_str(), tag, err);
        ctx.sink.emit(tag, &format!("error: {err}"));
        self.finalize(ctx, BuildStatus::Failed, &err.to_string())
            .await;
    }

    /// Move the record to a terminal status, report it and clean up.
    ///
    /// Only the first call for a build has any effect; returns whether this
    /// call finalized the build.
    pub(crate) async fn finalize(&self, ctx: &BuildContext, status: BuildStatus, summary: &str) -> bool {
        if ctx.finalized.swap(true, Ordering::SeqCst) {
            debug!(build_id = %ctx.id, "already finalized");
            return false;
        }
        self.coordinator.forget(&ctx.id).await;

        flush_once(self.store.as_ref(), &ctx.sink).await;

        let applied = Arc::new(AtomicBool::new(false));
        let flag = applied.clone();
        let now = Utc::now();
        let record = match self
            .store
            .update(
                &ctx.id,
                Box::new(move |r| flag.store(r.finish(status, now), Ordering::SeqCst)),
            )
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!(build_id = %ctx.id, error = %e, "could not record final status");
                return false;
            }
        };
        if !applied.load(Ordering::SeqCst) {
            debug!(build_id = %ctx.id, status = %record.status, "record already terminal");
            return false;
        }

        let duration_ms = record.duration_ms.unwrap_or_default();
        obs::emit_build_finished(ctx.id.as_str(), status.as_str(), duration_ms);
        self.bus.publish(PipelineEvent::BuildFinished {
            build_id: ctx.id.clone(),
            status,
            duration_ms,
        });

        if let Some(check_id) = &record.check_run_id {
            let conclusion = match status {
                BuildStatus::Passed => CheckConclusion::Success,
                _ => CheckConclusion::Failure,
            };
            if let Err(e) = self
                .checks
                .update_check(&record.repository, check_id, conclusion, summary)
                .await
            {
                warn!(build_id = %ctx.id, error = %e, "check run update failed");
            }
        }

        if !self.settings.keep_containers && ctx.config.build {
            let spec = self.containers.remove(&ctx.container);
            if let Err(e) = self.runner.run(&spec, &ctx.sink).await {
                debug!(build_id = %ctx.id, error = %e, "container removal failed");
            }
        }
        true
    }
}

fn apply_gate(
    ctx: &BuildContext,
    tag: &str,
    gate: &dyn QualityGate,
    output: &str,
) -> PipelineResult<()> {
    match gate.evaluate(output) {
        GateVerdict::Pass => Ok(()),
        GateVerdict::Warn(message) => {
            ctx.sink.emit(tag, &format!("warning: {message}"));
            Ok(())
        }
        GateVerdict::Fail(message) => Err(PipelineError::stage_failure(
            tag,
            None,
            format!("{} gate: {message}", gate.name()),
            output,
        )),
    }
}
