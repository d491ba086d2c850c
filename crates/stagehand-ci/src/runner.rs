//! External command execution with live, line-by-line log streaming.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::events::LogSink;

/// A command to run on behalf of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Stage tag attached to every output line and to failures.
    pub tag: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(tag: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// `sh -c <script>`.
    pub fn shell(tag: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(tag, "sh").args(["-c".to_string(), script.into()])
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Human-readable command line.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Output of a successful command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// Combined stdout and stderr, one line per output line.
    pub output: String,
    pub duration_ms: u64,
}

/// Runs stage commands.
///
/// Implementations stream each output line to `sink` as it is produced and
/// return `PipelineError::StageFailure` for a non-zero exit.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec, sink: &LogSink) -> PipelineResult<CommandOutput>;
}

/// [`CommandRunner`] backed by local processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands that run longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec, sink: &LogSink) -> PipelineResult<CommandOutput> {
        let start = Instant::now();
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        debug!(tag = %spec.tag, command = %spec.display(), "spawning command");
        let mut child = cmd.spawn().map_err(|e| {
            PipelineError::stage_failure(
                &spec.tag,
                None,
                format!("failed to start '{}': {e}", spec.program),
                "",
            )
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx.clone());
        }
        drop(tx);

        let run = async {
            let mut output = String::new();
            while let Some(line) = rx.recv().await {
                sink.emit(&spec.tag, &line);
                output.push_str(&line);
                output.push('\n');
            }
            (output, child.wait().await)
        };

        let finished = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.ok(),
            None => Some(run.await),
        };

        let Some((output, status)) = finished else {
            let _ = child.kill().await;
            let limit = self.timeout.unwrap_or_default();
            sink.emit(&spec.tag, &format!("timed out after {}s", limit.as_secs()));
            return Err(PipelineError::stage_failure(
                &spec.tag,
                None,
                format!("'{}' timed out after {}s", spec.display(), limit.as_secs()),
                "",
            ));
        };

        let status = status?;
        let exit_code = status.code().unwrap_or(-1);
        if !status.success() {
            return Err(PipelineError::stage_failure(
                &spec.tag,
                Some(exit_code),
                format!("'{}' exited with status {exit_code}", spec.display()),
                output,
            ));
        }

        Ok(CommandOutput {
            exit_code,
            output,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            // Non-UTF-8 bytes must not stop the pipe from draining.
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']).to_string();
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}
