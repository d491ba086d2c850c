//! Stagehand daemon
//!
//! Runs pull-request pipelines with breakpoints and debug shells.
//!
//! ## Commands
//!
//! - `serve`: recover paused builds, then read triggers and control commands
//!   as JSON lines on stdin and write events and replies as JSON lines to stdout
//! - `trigger`: run one build from a webhook payload file
//! - `show`: print an execution record
//! - `list`: list executions in a time window
//! - `metrics`: dashboard aggregates for a time window

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use stagehand_ci::telemetry::init_tracing;
use stagehand_ci::{
    CheckClient, ControlCommand, ControlReply, Engine, EngineSettings, GithubChecks, NoopChecks,
    PipelineEvent, PullRequestEvent, StageConfig, TriggerOutcome,
};
use stagehand_state::{BuildId, BuildStatus, ExecutionStore, SurrealExecutionStore, TimeRange};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "stagehandd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Pull-request CI with breakpoints and debug shells", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Execution store URL (mem://, surrealkv://path, ws://host:port)
    #[arg(long, global = true, env = "SURREALDB_URL")]
    db_url: Option<String>,

    /// Root directory for build checkouts
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the JSON-lines trigger and control channel on stdin/stdout
    Serve {
        /// Exit when stdin closes instead of waiting for Ctrl-C
        #[arg(long)]
        exit_on_eof: bool,
    },

    /// Run a single build from a pull-request webhook payload
    Trigger {
        /// Path to the webhook JSON body
        #[arg(short, long)]
        event: PathBuf,

        /// Stage configuration to use instead of the repository's .ci.yaml
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the full execution record of a build
    Show {
        /// Build id
        id: String,
    },

    /// List executions
    List {
        /// Time window such as 15m, 1h, 12h, 1d or 7d (default: all time)
        #[arg(short, long)]
        range: Option<String>,
    },

    /// Dashboard metrics
    Metrics {
        /// Time window such as 15m, 1h, 12h, 1d or 7d (default: all time)
        #[arg(short, long)]
        range: Option<String>,
    },
}

/// One line of input on the serve channel.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Inbound {
    Control(ControlCommand),
    Trigger(PullRequestEvent),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let store = match &cli.db_url {
        Some(url) => SurrealExecutionStore::connect(url).await,
        None => SurrealExecutionStore::from_env().await,
    }
    .context("Failed to open execution store")?;
    let store: Arc<dyn ExecutionStore> = Arc::new(store);

    let mut settings = EngineSettings::from_env();
    if let Some(workspace) = cli.workspace {
        settings = settings.with_workspace(workspace);
    }
    let engine = Engine::builder(store)
        .settings(settings)
        .checks(check_client())
        .build();

    match cli.command {
        Commands::Serve { exit_on_eof } => cmd_serve(engine, exit_on_eof).await,
        Commands::Trigger { event, config } => cmd_trigger(&engine, &event, config.as_deref()).await,
        Commands::Show { id } => cmd_show(&engine, &id).await,
        Commands::List { range } => cmd_list(&engine, parse_range(range.as_deref())?).await,
        Commands::Metrics { range } => cmd_metrics(&engine, parse_range(range.as_deref())?).await,
    }
}

fn check_client() -> Arc<dyn CheckClient> {
    match GithubChecks::from_env() {
        Some(Ok(client)) => Arc::new(client),
        Some(Err(e)) => {
            warn!(error = %e, "GitHub check runs disabled");
            Arc::new(NoopChecks)
        }
        None => Arc::new(NoopChecks),
    }
}

fn parse_range(raw: Option<&str>) -> Result<TimeRange> {
    match raw {
        None => Ok(TimeRange::all()),
        Some(raw) => TimeRange::parse_window(raw)
            .with_context(|| format!("invalid time range '{raw}', expected e.g. 15m, 1h, 7d")),
    }
}

async fn handle_line(engine: &Engine, line: &str) -> ControlReply {
    match serde_json::from_str::<Inbound>(line) {
        Ok(Inbound::Control(command)) => engine.handle(command).await,
        Ok(Inbound::Trigger(event)) => match engine.trigger(&event).await {
            Ok(TriggerOutcome::Started { build_id, .. }) => {
                ControlReply::ok(format!("build {build_id} started"))
            }
            Ok(TriggerOutcome::Ignored { action }) => {
                ControlReply::ok(format!("ignored pull request action '{action}'"))
            }
            Err(e) => ControlReply::error("trigger", e),
        },
        Err(e) => ControlReply::error("parse", e),
    }
}

/// Serve triggers and control commands until stdin closes or Ctrl-C.
async fn cmd_serve(engine: Engine, exit_on_eof: bool) -> Result<()> {
    let recovered = engine
        .recover()
        .await
        .context("Failed to recover paused builds")?;
    info!(recovered = recovered.len(), "stagehandd serving on stdin/stdout");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            let written = stdout.write_all(format!("{line}\n").as_bytes()).await;
            if written.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut events = engine.subscribe();
    let event_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => {
                        if event_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "unserializable event"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut interrupted = false;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let reply = handle_line(&engine, line).await;
                out_tx.send(serde_json::to_string(&reply)?)?;
            }
            _ = tokio::signal::ctrl_c() => {
                interrupted = true;
                break;
            }
        }
    }

    // The transport is gone; debug shells go with it.
    let stopped = engine.disconnect().await;
    info!(stopped, "input closed, debug sessions stopped");

    if !interrupted && !exit_on_eof {
        info!("waiting for running builds; Ctrl-C to exit");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
    }

    forwarder.abort();
    drop(out_tx);
    writer.await.context("stdout writer failed")?;
    Ok(())
}

/// Run one build to completion, printing its log.
async fn cmd_trigger(engine: &Engine, event_path: &Path, config_path: Option<&Path>) -> Result<()> {
    let body = std::fs::read_to_string(event_path)
        .with_context(|| format!("Failed to read {}", event_path.display()))?;
    let event = PullRequestEvent::from_json(&body)?;
    let config = match config_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Some(StageConfig::from_yaml(&text)?)
        }
        None => None,
    };

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let PipelineEvent::Log {
                timestamp,
                tag,
                message,
                ..
            } = event
            {
                println!("[{}] [{tag}] {message}", timestamp.format("%H:%M:%S"));
            }
        }
    });

    let outcome = engine.trigger_with_config(&event, config).await?;
    let (build_id, handle) = match outcome {
        TriggerOutcome::Started { build_id, handle } => (build_id, handle),
        TriggerOutcome::Ignored { action } => {
            printer.abort();
            println!("Ignored: pull request action '{action}' does not start builds");
            return Ok(());
        }
    };
    println!("Build {build_id} started");

    let result = tokio::select! {
        joined = handle => joined.context("Build task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            printer.abort();
            println!("Interrupted; paused builds are resumed by the next `stagehandd serve`");
            return Ok(());
        }
    };
    printer.abort();

    match result {
        Ok(BuildStatus::Passed) => {
            println!("Build {build_id} passed");
            Ok(())
        }
        Ok(status) => {
            println!("Build {build_id} left {status}");
            Ok(())
        }
        Err(e) => bail!("Build {build_id} failed: {e}"),
    }
}

async fn cmd_show(engine: &Engine, id: &str) -> Result<()> {
    let record = engine
        .get_execution(&BuildId::from(id))
        .await?
        .with_context(|| format!("No execution with id {id}"))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn cmd_list(engine: &Engine, range: TimeRange) -> Result<()> {
    let summaries = engine.list_executions(range).await?;
    if summaries.is_empty() {
        println!("No executions");
        return Ok(());
    }
    for s in summaries {
        let stage = match (s.active_stage.as_deref(), s.is_paused) {
            (Some(stage), true) => format!("{stage} (paused)"),
            (Some(stage), false) => stage.to_string(),
            (None, _) => "-".to_string(),
        };
        println!(
            "{:<44} {:<8} {:<16} {}",
            s.id.as_str(),
            s.status.as_str(),
            stage,
            s.display_name
        );
    }
    Ok(())
}

async fn cmd_metrics(engine: &Engine, range: TimeRange) -> Result<()> {
    let metrics = engine.dashboard(range).await?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}
