//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stagehand_ci::error::CheckError;
use stagehand_ci::{
    CheckClient, CheckConclusion, CommandOutput, CommandRunner, CommandSpec, Engine,
    EngineSettings, LogSink, PipelineError, PipelineEvent, PipelineResult, PullRequestEvent,
    SessionError, ShellSpawner, StageConfig,
};
use stagehand_state::fakes::MemoryExecutionStore;
use stagehand_state::{BuildId, ExecutionRecord, ExecutionStore};
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::sync::broadcast;

/// Command runner that records every command instead of running it.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<CommandSpec>>,
    failures: HashMap<String, i32>,
    outputs: HashMap<String, String>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands tagged `tag` exit with `code`.
    pub fn failing(mut self, tag: &str, code: i32) -> Self {
        self.failures.insert(tag.to_string(), code);
        self
    }

    /// Commands tagged `tag` print `output`.
    pub fn with_output(mut self, tag: &str, output: &str) -> Self {
        self.outputs.insert(tag.to_string(), output.to_string());
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Stage tags of commands from `from` on, consecutive duplicates and
    /// container cleanup dropped.
    pub fn stages_since(&self, from: usize) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        for spec in self.calls().into_iter().skip(from) {
            if spec.tag == "cleanup" {
                continue;
            }
            if tags.last() != Some(&spec.tag) {
                tags.push(spec.tag);
            }
        }
        tags
    }

    pub fn stages(&self) -> Vec<String> {
        self.stages_since(0)
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec, sink: &LogSink) -> PipelineResult<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());

        let output = self.outputs.get(&spec.tag).cloned().unwrap_or_else(|| {
            match spec.tag.as_str() {
                "lint" => "Your code has been rated at 9.50/10".to_string(),
                "test" => "3 passed in 0.12s".to_string(),
                _ => "ok".to_string(),
            }
        });
        sink.emit(&spec.tag, &output);

        match self.failures.get(&spec.tag) {
            Some(&code) => Err(PipelineError::stage_failure(
                &spec.tag,
                Some(code),
                format!("'{}' exited with code {code}", spec.display()),
                output,
            )),
            None => Ok(CommandOutput {
                exit_code: 0,
                output,
                duration_ms: 1,
            }),
        }
    }
}

/// Check client that remembers completed checks.
#[derive(Default)]
pub struct RecordingChecks {
    pub created: Mutex<Vec<(String, String)>>,
    pub completed: Mutex<Vec<(String, CheckConclusion, String)>>,
}

impl RecordingChecks {
    pub fn completed(&self) -> Vec<(String, CheckConclusion, String)> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckClient for RecordingChecks {
    async fn create_check(
        &self,
        repository: &str,
        commit: &str,
        _name: &str,
    ) -> Result<String, CheckError> {
        let mut created = self.created.lock().unwrap();
        created.push((repository.to_string(), commit.to_string()));
        Ok(format!("check-{}", created.len()))
    }

    async fn update_check(
        &self,
        _repository: &str,
        check_id: &str,
        conclusion: CheckConclusion,
        summary: &str,
    ) -> Result<(), CheckError> {
        self.completed
            .lock()
            .unwrap()
            .push((check_id.to_string(), conclusion, summary.to_string()));
        Ok(())
    }
}

/// Plain local `sh` standing in for `docker exec`.
pub struct LocalShell;

#[async_trait]
impl ShellSpawner for LocalShell {
    async fn spawn(&self, _container: &str) -> Result<Child, SessionError> {
        Command::new("sh")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Spawn(e.to_string()))
    }
}

/// Spawner for environments without a container runtime.
pub struct NoShell;

#[async_trait]
impl ShellSpawner for NoShell {
    async fn spawn(&self, container: &str) -> Result<Child, SessionError> {
        Err(SessionError::Spawn(format!("no runtime for {container}")))
    }
}

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<MemoryExecutionStore>,
    pub runner: Arc<FakeRunner>,
    pub checks: Arc<RecordingChecks>,
    _workspace: TempDir,
}

impl Harness {
    pub fn new(runner: FakeRunner) -> Self {
        Self::with(Arc::new(MemoryExecutionStore::new()), runner, Arc::new(NoShell))
    }

    pub fn with(
        store: Arc<MemoryExecutionStore>,
        runner: FakeRunner,
        shell: Arc<dyn ShellSpawner>,
    ) -> Self {
        Self::over(store.clone(), store, runner, shell)
    }

    /// Engine backed by `engine_store`; the harness reads `store` directly.
    pub fn over(
        store: Arc<MemoryExecutionStore>,
        engine_store: Arc<dyn ExecutionStore>,
        runner: FakeRunner,
        shell: Arc<dyn ShellSpawner>,
    ) -> Self {
        let workspace = tempfile::tempdir().unwrap();
        let runner = Arc::new(runner);
        let checks = Arc::new(RecordingChecks::default());
        let settings = EngineSettings::default()
            .with_workspace(workspace.path())
            .with_flush_interval(Duration::from_millis(10));
        let engine = Engine::builder(engine_store)
            .settings(settings)
            .runner(runner.clone())
            .checks(checks.clone())
            .shell_spawner(shell)
            .build();
        Self {
            engine,
            store,
            runner,
            checks,
            _workspace: workspace,
        }
    }

    pub async fn record(&self, id: &BuildId) -> ExecutionRecord {
        self.store.get(id).await.unwrap().expect("record exists")
    }

    /// Poll the record until `pred` holds. Panics after five seconds.
    pub async fn wait_until<F>(&self, id: &BuildId, pred: F) -> ExecutionRecord
    where
        F: Fn(&ExecutionRecord) -> bool,
    {
        for _ in 0..500 {
            if let Some(record) = self.store.get(id).await.unwrap() {
                if pred(&record) {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting on {id}: {:#?}", self.store.get(id).await);
    }

    pub async fn wait_paused(&self, id: &BuildId) -> ExecutionRecord {
        self.wait_until(id, |r| r.is_paused).await
    }

    pub async fn wait_finished(&self, id: &BuildId) -> ExecutionRecord {
        self.wait_until(id, |r| r.status.is_terminal()).await
    }
}

pub fn pr_event(action: &str) -> PullRequestEvent {
    PullRequestEvent::from_json(&format!(
        r#"{{
            "action": "{action}",
            "number": 12,
            "pull_request": {{"title": "Tidy widgets", "head": {{"ref": "tidy", "sha": "c0ffee"}}}},
            "repository": {{"full_name": "acme/widgets", "clone_url": "https://example.com/acme/widgets.git"}}
        }}"#
    ))
    .unwrap()
}

/// Every stage enabled plus one custom command.
pub fn full_config() -> StageConfig {
    StageConfig {
        run_commands: vec!["make docs".to_string()],
        ..Default::default()
    }
}

/// Everything published so far.
pub fn drain(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

/// Wait for the first event matching `pred`. Panics after five seconds.
pub async fn next_matching<F>(
    rx: &mut broadcast::Receiver<PipelineEvent>,
    pred: F,
) -> PipelineEvent
where
    F: Fn(&PipelineEvent) -> bool,
{
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await;
    found.expect("timed out waiting for event")
}
