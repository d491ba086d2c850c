//! End-to-end pipeline runs through the engine with a fake command runner.

mod common;

use std::sync::Arc;

use common::{drain, full_config, pr_event, FakeRunner, Harness, LocalShell};
use stagehand_ci::{
    CheckConclusion, PipelineError, PipelineEvent, StageConfig, TriggerOutcome,
};
use stagehand_state::fakes::MemoryExecutionStore;
use stagehand_state::{BuildId, BuildStatus, CheckpointStage, PausePoint};

type Run = tokio::task::JoinHandle<stagehand_ci::PipelineResult<BuildStatus>>;

async fn start(harness: &Harness, config: StageConfig) -> (BuildId, Run) {
    match harness
        .engine
        .trigger_with_config(&pr_event("opened"), Some(config))
        .await
        .unwrap()
    {
        TriggerOutcome::Started { build_id, handle } => (build_id, handle),
        TriggerOutcome::Ignored { action } => panic!("unexpectedly ignored {action}"),
    }
}

fn finished(events: &[PipelineEvent]) -> Vec<BuildStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::BuildFinished { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

fn active_stages(events: &[PipelineEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::ActiveStage { stage, .. } => Some(stage.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_failing_test_stage_finalizes_build_as_failed() {
    let harness = Harness::new(FakeRunner::new().failing("test", 1).with_output("test", "1 failed"));
    let mut rx = harness.engine.subscribe();
    let config = StageConfig {
        lint: false,
        format: false,
        ..Default::default()
    };

    let (id, handle) = start(&harness, config).await;
    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        PipelineError::StageFailure { ref tag, exit_code: Some(1), .. } if tag == "test"
    ));

    let record = harness.record(&id).await;
    assert_eq!(record.status, BuildStatus::Failed);
    assert_eq!(record.active_stage.as_deref(), Some("test"));
    assert!(record.duration_ms.is_some());
    assert!(!record.is_paused);

    let events = drain(&mut rx);
    assert_eq!(finished(&events), vec![BuildStatus::Failed]);

    let completed = harness.checks.completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].0, "check-1");
    assert_eq!(completed[0].1, CheckConclusion::Failure);
    assert!(completed[0].2.contains("test"));

    assert_eq!(harness.runner.stages(), vec!["setup", "build", "test"]);
}

#[tokio::test]
async fn test_full_run_passes_and_persists_logs() {
    let harness = Harness::new(FakeRunner::new());
    let mut rx = harness.engine.subscribe();

    let (id, handle) = start(&harness, full_config()).await;
    assert_eq!(handle.await.unwrap().unwrap(), BuildStatus::Passed);

    let record = harness.record(&id).await;
    assert_eq!(record.status, BuildStatus::Passed);
    assert_eq!(record.check_run_id.as_deref(), Some("check-1"));
    assert!(record.logs.contains("[lint] Your code has been rated at 9.50/10"));
    assert!(record.logs.contains("[custom] $ make docs"));

    assert_eq!(
        harness.runner.stages(),
        vec!["setup", "lint", "format", "build", "test", "custom"]
    );

    let events = drain(&mut rx);
    assert!(matches!(
        events.first(),
        Some(PipelineEvent::BuildStarted { build_id, .. }) if *build_id == id
    ));
    assert_eq!(active_stages(&events), vec!["setup", "setup", "build", "build", "test", "test"]);
    assert_eq!(finished(&events), vec![BuildStatus::Passed]);
    assert_eq!(harness.checks.completed()[0].1, CheckConclusion::Success);
}

#[tokio::test]
async fn test_disabled_stages_never_run_or_pause() {
    let harness = Harness::new(FakeRunner::new());
    let mut rx = harness.engine.subscribe();
    let config = StageConfig {
        lint: false,
        format: false,
        build: false,
        pause_before_build: true,
        pause_after_build: true,
        ..Default::default()
    };

    let (id, handle) = start(&harness, config).await;
    assert_eq!(handle.await.unwrap().unwrap(), BuildStatus::Passed);

    assert_eq!(harness.runner.stages(), vec!["setup", "test"]);
    let test_call = harness
        .runner
        .calls()
        .into_iter()
        .find(|c| c.tag == "test")
        .unwrap();
    assert_eq!(test_call.program, "sh", "without a build container tests run locally");

    let events = drain(&mut rx);
    assert!(!active_stages(&events).contains(&"build".to_string()));
    assert!(!events
        .iter()
        .any(|e| matches!(e, PipelineEvent::AllowBreakpointEdit { .. })));
    assert!(!harness.record(&id).await.is_paused);
}

#[tokio::test]
async fn test_pause_before_test_then_resume() {
    let store = Arc::new(MemoryExecutionStore::new());
    let harness = Harness::with(store, FakeRunner::new(), Arc::new(LocalShell));
    let config = StageConfig {
        pause_before_test: true,
        ..Default::default()
    };

    let (id, handle) = start(&harness, config).await;
    let paused = harness.wait_paused(&id).await;
    assert_eq!(paused.pause_stage.as_deref(), Some("test"));
    assert_eq!(paused.pause_point.as_deref(), Some("before"));
    assert_eq!(paused.status, BuildStatus::Pending);
    assert_eq!(
        harness.runner.stages(),
        vec!["setup", "lint", "format", "build"]
    );
    assert!(
        harness.engine.start_debug(&id).await.is_ok(),
        "paused builds accept debug sessions"
    );

    let reply = harness
        .engine
        .handle(stagehand_ci::ControlCommand::Resume { build_id: id.clone() })
        .await;
    assert!(reply.is_ok(), "{reply:?}");
    assert_eq!(handle.await.unwrap().unwrap(), BuildStatus::Passed);

    let record = harness.record(&id).await;
    assert_eq!(record.status, BuildStatus::Passed);
    assert!(!record.is_paused);
    assert_eq!(record.pause_stage, None);
    assert_eq!(harness.runner.stages().last().map(String::as_str), Some("test"));

    harness.engine.disconnect().await;
}

#[tokio::test]
async fn test_second_resume_is_a_noop() {
    let harness = Harness::new(FakeRunner::new());
    let config = StageConfig {
        pause_after_build: true,
        ..Default::default()
    };

    let (id, handle) = start(&harness, config).await;
    harness.wait_paused(&id).await;

    let first = harness.engine.resume(&id).await.unwrap();
    let second = harness.engine.resume(&id).await.unwrap();
    assert_eq!(first, stagehand_ci::ResumeOutcome::Signalled);
    assert_eq!(second, stagehand_ci::ResumeOutcome::NotPaused);

    assert_eq!(handle.await.unwrap().unwrap(), BuildStatus::Passed);
    let tests_run = harness
        .runner
        .calls()
        .iter()
        .filter(|c| c.tag == "test")
        .count();
    assert_eq!(tests_run, 1);
}

#[tokio::test]
async fn test_pause_request_stops_at_next_checkpoint() {
    let harness = Harness::new(FakeRunner::new());
    let config = StageConfig {
        pause_before_setup: true,
        ..Default::default()
    };

    let (id, handle) = start(&harness, config).await;
    harness
        .wait_until(&id, |r| {
            r.pause_stage.as_deref() == Some("setup") && r.pause_point.as_deref() == Some("before")
        })
        .await;
    assert!(harness.engine.pause(&id).await.unwrap());

    harness.engine.resume(&id).await.unwrap();
    let paused = harness
        .wait_until(&id, |r| r.is_paused && r.pause_point.as_deref() == Some("after"))
        .await;
    assert_eq!(paused.pause_stage.as_deref(), Some("setup"));
    assert_eq!(harness.runner.stages(), vec!["setup"]);

    harness.engine.resume(&id).await.unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), BuildStatus::Passed);
    assert!(!harness.engine.pause(&id).await.unwrap(), "finished builds cannot pause");
}

#[tokio::test]
async fn test_lint_score_below_threshold_fails_build() {
    let harness = Harness::new(
        FakeRunner::new().with_output("lint", "Your code has been rated at 6.20/10 (previous run: 7.00/10)"),
    );

    let (id, handle) = start(&harness, full_config()).await;
    let err = handle.await.unwrap().unwrap_err();
    assert_eq!(err.tag(), Some("lint"));

    let record = harness.record(&id).await;
    assert_eq!(record.status, BuildStatus::Failed);
    assert!(record.logs.contains("[lint] error:"));
    assert_eq!(harness.runner.stages(), vec!["setup", "lint"]);
}

#[tokio::test]
async fn test_lint_exit_bitmask_defers_to_score() {
    let harness = Harness::new(
        FakeRunner::new()
            .failing("lint", 16)
            .with_output("lint", "C0114: missing docstring\nYour code has been rated at 9.50/10"),
    );

    let (id, handle) = start(&harness, full_config()).await;
    assert_eq!(handle.await.unwrap().unwrap(), BuildStatus::Passed);
    assert_eq!(harness.record(&id).await.status, BuildStatus::Passed);
}

#[tokio::test]
async fn test_lint_failure_without_score_fails_build() {
    let harness = Harness::new(
        FakeRunner::new()
            .failing("lint", 1)
            .with_output("lint", "pylint: command not found"),
    );

    let (_, handle) = start(&harness, full_config()).await;
    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        PipelineError::StageFailure { exit_code: Some(1), .. }
    ));
    assert_eq!(harness.runner.stages(), vec!["setup", "lint"]);
}

#[tokio::test]
async fn test_zero_tests_warns_by_default() {
    let harness = Harness::new(
        FakeRunner::new()
            .failing("test", 5)
            .with_output("test", "collected 0 items\n\nno tests ran in 0.01s"),
    );

    let (id, handle) = start(&harness, full_config()).await;
    assert_eq!(handle.await.unwrap().unwrap(), BuildStatus::Passed);
    assert!(harness.record(&id).await.logs.contains("[test] warning:"));
}

#[tokio::test]
async fn test_zero_tests_can_fail_the_build() {
    let harness = Harness::new(FakeRunner::new().with_output("test", "collected 0 items"));
    let config = StageConfig {
        zero_tests: stagehand_ci::ZeroTestsPolicy::Fail,
        ..Default::default()
    };

    let (_, handle) = start(&harness, config).await;
    let err = handle.await.unwrap().unwrap_err();
    assert_eq!(err.tag(), Some("test"));
}

#[tokio::test]
async fn test_failing_custom_command_finalizes_once() {
    let harness = Harness::new(FakeRunner::new().failing("custom", 2));
    let mut rx = harness.engine.subscribe();
    let config = StageConfig {
        run_commands: vec!["make docs".into(), "make release".into()],
        ..Default::default()
    };

    let (id, handle) = start(&harness, config).await;
    assert!(handle.await.unwrap().is_err());

    let custom_runs = harness
        .runner
        .calls()
        .iter()
        .filter(|c| c.tag == "custom")
        .count();
    assert_eq!(custom_runs, 1, "a failing command aborts the rest");

    let record = harness.record(&id).await;
    assert_eq!(record.status, BuildStatus::Failed);
    assert_eq!(finished(&drain(&mut rx)), vec![BuildStatus::Failed]);
    assert_eq!(harness.checks.completed().len(), 1);
}

#[tokio::test]
async fn test_store_outage_rejects_resume_and_keeps_build_paused() {
    let harness = Harness::new(FakeRunner::new());
    let config = StageConfig {
        pause_before_build: true,
        ..Default::default()
    };

    let (id, handle) = start(&harness, config).await;
    harness.wait_paused(&id).await;
    assert!(harness
        .engine
        .update_breakpoints(&id, &serde_json::json!({"test": {"before": true}}))
        .await
        .is_ok());

    harness.engine.resume(&id).await.unwrap();
    let record = harness
        .wait_until(&id, |r| r.is_paused && r.pause_stage.as_deref() == Some("test"))
        .await;
    assert!(record.breakpoints.is_set(CheckpointStage::Test, PausePoint::Before));

    harness.store.set_offline(true);
    let reply = harness
        .engine
        .handle(stagehand_ci::ControlCommand::Resume { build_id: id.clone() })
        .await;
    assert!(!reply.is_ok());
    harness.store.set_offline(false);

    harness.engine.resume(&id).await.unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), BuildStatus::Passed);
}

#[tokio::test]
async fn test_closed_event_is_ignored() {
    let harness = Harness::new(FakeRunner::new());
    let outcome = harness.engine.trigger(&pr_event("closed")).await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::Ignored { .. }));
    assert_eq!(harness.runner.call_count(), 0);
}

#[tokio::test]
async fn test_webhook_values_are_not_git_options() {
    let harness = Harness::new(FakeRunner::new());
    let event = stagehand_ci::PullRequestEvent::from_json(
        r#"{
            "action": "opened",
            "number": 3,
            "pull_request": {"title": "Odd", "head": {"ref": "odd", "sha": "--upload-pack=touch /tmp/x"}},
            "repository": {"full_name": "acme/widgets", "clone_url": "--config=core.sshCommand=true"}
        }"#,
    )
    .unwrap();

    let TriggerOutcome::Started { build_id, handle } = harness.engine.trigger(&event).await.unwrap() else {
        panic!("build not started");
    };
    let err = handle.await.unwrap().unwrap_err();
    assert_eq!(err.tag(), Some("setup"));

    let calls = harness.runner.calls();
    assert_eq!(calls.len(), 1, "checkout never runs");
    let args = &calls[0].args;
    let separator = args.iter().position(|a| a == "--").unwrap();
    let url = args.iter().position(|a| a.starts_with("--config")).unwrap();
    assert!(separator < url);
    assert_eq!(harness.record(&build_id).await.status, BuildStatus::Failed);
}
