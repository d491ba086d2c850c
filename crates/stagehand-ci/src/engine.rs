//! The engine facade: triggers, control commands, recovery and queries.
//!
//! One [`Engine`] per process. It owns the per-process registries (pause
//! waiters, debug sessions) and hands each build to its own task.

use std::sync::Arc;

use serde_json::Value;
use stagehand_state::{
    Breakpoints, BuildId, BuildStatus, DashboardMetrics, ExecutionRecord, ExecutionStore,
    ExecutionSummary, TimeRange,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::breakpoints::{Coordinator, ResumeOutcome};
use crate::checks::{CheckClient, NoopChecks};
use crate::control::{ControlCommand, ControlReply};
use crate::debug::{AttachOutcome, DebugSessions, DockerShell, ShellSpawner};
use crate::error::PipelineResult;
use crate::events::{EventBus, PipelineEvent};
use crate::executor::{BuildContext, StageExecutor};
use crate::obs::{self, BuildSpan};
use crate::runner::{CommandRunner, ProcessRunner};
use crate::settings::EngineSettings;
use crate::stage::{resume_anchor, StageConfig, Step};
use crate::webhook::PullRequestEvent;

/// Result of a trigger.
#[derive(Debug)]
pub enum TriggerOutcome {
    /// A build was created and is running on its own task.
    Started {
        build_id: BuildId,
        handle: JoinHandle<PipelineResult<BuildStatus>>,
    },
    /// The event's action does not start builds.
    Ignored { action: String },
}

/// Builder for [`Engine`]. Unset collaborators get production defaults.
pub struct EngineBuilder {
    store: Arc<dyn ExecutionStore>,
    settings: EngineSettings,
    runner: Option<Arc<dyn CommandRunner>>,
    checks: Option<Arc<dyn CheckClient>>,
    spawner: Option<Arc<dyn ShellSpawner>>,
    bus: Option<EventBus>,
}

impl EngineBuilder {
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn checks(mut self, checks: Arc<dyn CheckClient>) -> Self {
        self.checks = Some(checks);
        self
    }

    pub fn shell_spawner(mut self, spawner: Arc<dyn ShellSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Engine {
        let settings = self.settings;
        let bus = self.bus.unwrap_or_default();
        let runner = self.runner.unwrap_or_else(|| {
            Arc::new(ProcessRunner::new().with_timeout(settings.command_timeout))
        });
        let checks = self.checks.unwrap_or_else(|| Arc::new(NoopChecks));
        let spawner = self
            .spawner
            .unwrap_or_else(|| Arc::new(DockerShell::new(settings.docker.clone())));

        let sessions = Arc::new(DebugSessions::new(spawner, self.store.clone(), bus.clone()));
        let coordinator = Arc::new(Coordinator::new(
            self.store.clone(),
            bus.clone(),
            sessions.clone(),
        ));
        let executor = Arc::new(StageExecutor::new(
            self.store.clone(),
            runner,
            checks.clone(),
            coordinator.clone(),
            bus.clone(),
            settings.clone(),
        ));

        Engine {
            inner: Arc::new(EngineInner {
                store: self.store,
                checks,
                coordinator,
                sessions,
                executor,
                bus,
                settings,
            }),
        }
    }
}

struct EngineInner {
    store: Arc<dyn ExecutionStore>,
    checks: Arc<dyn CheckClient>,
    coordinator: Arc<Coordinator>,
    sessions: Arc<DebugSessions>,
    executor: Arc<StageExecutor>,
    bus: EventBus,
    settings: EngineSettings,
}

/// Pipeline engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(store: Arc<dyn ExecutionStore>) -> EngineBuilder {
        EngineBuilder {
            store,
            settings: EngineSettings::default(),
            runner: None,
            checks: None,
            spawner: None,
            bus: None,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Start a build for a pull-request event.
    ///
    /// The stage configuration is read from the checkout after setup.
    pub async fn trigger(&self, event: &PullRequestEvent) -> PipelineResult<TriggerOutcome> {
        self.trigger_with_config(event, None).await
    }

    /// Parse a raw webhook body and trigger on it.
    pub async fn trigger_json(&self, body: &str) -> PipelineResult<TriggerOutcome> {
        let event = PullRequestEvent::from_json(body)?;
        self.trigger(&event).await
    }

    /// Start a build with an explicit stage configuration instead of the
    /// repository's `.ci.yaml`. Its pause flags seed the breakpoints.
    pub async fn trigger_with_config(
        &self,
        event: &PullRequestEvent,
        config: Option<StageConfig>,
    ) -> PipelineResult<TriggerOutcome> {
        if !event.should_build() {
            info!(action = %event.action, repository = %event.repository.full_name, "event ignored");
            return Ok(TriggerOutcome::Ignored {
                action: event.action.clone(),
            });
        }

        let inner = &self.inner;
        let repository = event.repository.full_name.as_str();
        let head = &event.pull_request.head;
        let build_id = BuildId::generate(repository);
        let breakpoints = config
            .as_ref()
            .map(StageConfig::breakpoints)
            .unwrap_or_default();

        let mut record = ExecutionRecord::new(
            build_id.clone(),
            repository,
            head.branch.as_str(),
            head.sha.as_str(),
            event.pull_request.title.as_str(),
        )
        .with_clone_url(event.repository.clone_url.as_str())
        .with_pr_number(event.number)
        .with_breakpoints(breakpoints.clone());
        if let Some(config) = &config {
            record = record.with_config(config.to_value());
        }
        inner.store.create(record.clone()).await?;
        obs::emit_build_started(build_id.as_str(), repository, &head.branch);

        match inner
            .checks
            .create_check(repository, &head.sha, &inner.settings.check_name)
            .await
        {
            Ok(check_id) => {
                if let Err(e) = inner
                    .store
                    .update(&build_id, Box::new(move |r| r.check_run_id = Some(check_id)))
                    .await
                {
                    warn!(build_id = %build_id, error = %e, "could not store check run id");
                }
            }
            Err(e) => warn!(build_id = %build_id, error = %e, "check run creation failed"),
        }

        inner.bus.publish(PipelineEvent::BuildStarted {
            build_id: build_id.clone(),
            repository: record.repository.clone(),
            display_name: record.display_name.clone(),
        });
        if breakpoints.any() {
            inner.bus.publish(PipelineEvent::PauseConfigured {
                build_id: build_id.clone(),
                breakpoints,
            });
        }

        let ctx = BuildContext::from_record(&record, &inner.settings, &inner.bus);
        let handle = self.spawn_run(ctx, Step::Start);
        Ok(TriggerOutcome::Started { build_id, handle })
    }

    fn spawn_run(
        &self,
        ctx: BuildContext,
        anchor: Step,
    ) -> JoinHandle<PipelineResult<BuildStatus>> {
        let executor = self.inner.executor.clone();
        let span = BuildSpan::new(ctx.id.as_str());
        tokio::spawn(span.run(async move { executor.execute(ctx, anchor).await }))
    }

    /// Apply a control-channel command. Failures come back as error replies.
    pub async fn handle(&self, command: ControlCommand) -> ControlReply {
        let operation = command.operation();
        let result: PipelineResult<String> = match command {
            ControlCommand::UpdateBreakpoints {
                build_id,
                breakpoints,
            } => self
                .update_breakpoints(&build_id, &breakpoints)
                .await
                .map(|_| format!("breakpoints updated for {build_id}")),
            ControlCommand::Pause { build_id } => self.pause(&build_id).await.map(|accepted| {
                if accepted {
                    format!("pause requested for {build_id}")
                } else {
                    format!("{build_id} has already finished")
                }
            }),
            ControlCommand::Resume { build_id } => {
                self.resume(&build_id).await.map(|outcome| match outcome {
                    ResumeOutcome::NotPaused => format!("{build_id} is not paused"),
                    ResumeOutcome::Signalled | ResumeOutcome::Detached { .. } => {
                        format!("resumed {build_id}")
                    }
                    ResumeOutcome::Unrecognized { stage, point } => {
                        format!("{build_id} was paused at unknown checkpoint {point} {stage}; pause cleared")
                    }
                })
            }
            ControlCommand::StartDebug { build_id, .. } => {
                self.start_debug(&build_id).await.map(|outcome| match outcome {
                    AttachOutcome::AlreadyActive => format!("debug session already active for {build_id}"),
                    AttachOutcome::Started => format!("debug session started for {build_id}"),
                    AttachOutcome::Reattached => format!("debug session restarted for {build_id}"),
                })
            }
            ControlCommand::StopDebug { build_id } => Ok(if self.stop_debug(&build_id).await {
                format!("debug session stopped for {build_id}")
            } else {
                format!("no debug session for {build_id}")
            }),
            ControlCommand::ConsoleCommand { build_id, text } => self
                .console(&build_id, &text)
                .await
                .map(|_| "sent".to_string()),
            ControlCommand::Disconnect => {
                let stopped = self.disconnect().await;
                Ok(format!("stopped {stopped} debug sessions"))
            }
        };

        match result {
            Ok(message) => ControlReply::ok(message),
            Err(e) => {
                error!(operation, error = %e, "control command failed");
                ControlReply::error(operation, e)
            }
        }
    }

    /// Pause the build at its next checkpoint.
    pub async fn pause(&self, build_id: &BuildId) -> PipelineResult<bool> {
        self.inner.coordinator.request_pause(build_id).await
    }

    /// Resume a paused build, restarting its run if no task is waiting on it.
    pub async fn resume(&self, build_id: &BuildId) -> PipelineResult<ResumeOutcome> {
        let inner = &self.inner;
        let outcome = inner.coordinator.resume(build_id).await?;

        // No fallible step between clearing the pause and restarting the run.
        if let ResumeOutcome::Detached { stage, point, record } = &outcome {
            let ctx = BuildContext::from_record(record, &inner.settings, &inner.bus);
            ctx.sink
                .emit("resume", &format!("continuing from {point} {stage}"));
            // Detached: the run reports through the record and the event bus.
            let _run = self.spawn_run(ctx, resume_anchor(*stage, *point));
        }
        Ok(outcome)
    }

    /// Resume every build the store reports as paused.
    ///
    /// Called once at startup. Returns the builds that were restarted.
    pub async fn recover(&self) -> PipelineResult<Vec<BuildId>> {
        let paused = self.inner.store.list_paused().await?;
        let mut resumed = Vec::with_capacity(paused.len());
        for record in paused {
            match self.resume(&record.id).await {
                Ok(ResumeOutcome::Detached { .. } | ResumeOutcome::Signalled) => {
                    resumed.push(record.id);
                }
                Ok(outcome) => debug!(build_id = %record.id, ?outcome, "nothing to recover"),
                Err(e) => warn!(build_id = %record.id, error = %e, "recovery failed"),
            }
        }
        info!(count = resumed.len(), "paused builds recovered");
        Ok(resumed)
    }

    pub async fn update_breakpoints(
        &self,
        build_id: &BuildId,
        update: &Value,
    ) -> PipelineResult<Breakpoints> {
        self.inner
            .coordinator
            .update_breakpoints(build_id, update)
            .await
    }

    pub async fn start_debug(&self, build_id: &BuildId) -> PipelineResult<AttachOutcome> {
        Ok(self.inner.sessions.attach(build_id).await?)
    }

    pub async fn stop_debug(&self, build_id: &BuildId) -> bool {
        self.inner.sessions.stop(build_id).await
    }

    pub async fn console(&self, build_id: &BuildId, text: &str) -> PipelineResult<()> {
        Ok(self.inner.sessions.send(build_id, text).await?)
    }

    /// Transport went away: tear down every debug session.
    pub async fn disconnect(&self) -> usize {
        self.inner.sessions.stop_all().await
    }

    pub async fn debug_cwd(&self, build_id: &BuildId) -> Option<String> {
        self.inner.sessions.cwd(build_id).await
    }

    pub async fn get_execution(&self, build_id: &BuildId) -> PipelineResult<Option<ExecutionRecord>> {
        Ok(self.inner.store.get(build_id).await?)
    }

    pub async fn list_executions(&self, range: TimeRange) -> PipelineResult<Vec<ExecutionSummary>> {
        let records = self.inner.store.list(range).await?;
        Ok(records.iter().map(ExecutionRecord::summary).collect())
    }

    pub async fn dashboard(&self, range: TimeRange) -> PipelineResult<DashboardMetrics> {
        let records = self.inner.store.list(range).await?;
        Ok(DashboardMetrics::from_records(&records))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.bus.subscribe()
    }
}
