//! Interactive debug shells attached to build containers.
//!
//! One session per build, keyed by [`BuildId`]. Shell output is streamed to
//! the event bus as `console-output`; input is written under a per-session
//! lock so concurrent callers never interleave partial commands.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use stagehand_state::{BuildId, ExecutionStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::container::{container_name, WORKSPACE_MOUNT};
use crate::error::SessionError;
use crate::events::{EventBus, PipelineEvent};

/// Starts an interactive shell for a container.
#[async_trait]
pub trait ShellSpawner: Send + Sync {
    /// Spawn a shell with piped stdin, stdout and stderr.
    async fn spawn(&self, container: &str) -> Result<Child, SessionError>;
}

/// `docker exec -i <container> sh`.
#[derive(Debug, Clone)]
pub struct DockerShell {
    docker: String,
}

impl DockerShell {
    pub fn new(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
        }
    }
}

#[async_trait]
impl ShellSpawner for DockerShell {
    async fn spawn(&self, container: &str) -> Result<Child, SessionError> {
        Command::new(&self.docker)
            .args(["exec", "-i", "-w", WORKSPACE_MOUNT, container, "sh"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Spawn(format!("{} exec {container}: {e}", self.docker)))
    }
}

/// Result of [`DebugSessions::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachOutcome {
    AlreadyActive,
    Started,
    /// A dead session was replaced by a fresh shell.
    Reattached,
}

struct DebugSession {
    container: String,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    cwd: Mutex<String>,
    readers: Vec<JoinHandle<()>>,
}

impl DebugSession {
    async fn is_alive(&self) -> bool {
        matches!(self.child.lock().await.try_wait(), Ok(None))
    }

    async fn terminate(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(container = %self.container, error = %e, "shell already gone");
        }
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// Process-wide table of debug sessions.
pub struct DebugSessions {
    sessions: Mutex<HashMap<BuildId, Arc<DebugSession>>>,
    spawner: Arc<dyn ShellSpawner>,
    store: Arc<dyn ExecutionStore>,
    bus: EventBus,
}

impl DebugSessions {
    pub fn new(
        spawner: Arc<dyn ShellSpawner>,
        store: Arc<dyn ExecutionStore>,
        bus: EventBus,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            spawner,
            store,
            bus,
        }
    }

    /// Attach a shell to the build's container.
    ///
    /// A new session needs the build to be paused or finished; a session
    /// that already exists (alive or dead) can always be re-entered.
    pub async fn attach(&self, build_id: &BuildId) -> Result<AttachOutcome, SessionError> {
        let mut sessions = self.sessions.lock().await;

        let outcome = match sessions.get(build_id).cloned() {
            Some(existing) => {
                if existing.is_alive().await {
                    return Ok(AttachOutcome::AlreadyActive);
                }
                AttachOutcome::Reattached
            }
            None => {
                let record = self
                    .store
                    .get(build_id)
                    .await?
                    .ok_or_else(|| SessionError::BuildNotFound(build_id.to_string()))?;
                if !record.is_paused && !record.status.is_terminal() {
                    return Err(SessionError::NotAttachable {
                        build_id: build_id.to_string(),
                        reason: "build is running; attach while paused or after it finishes"
                            .to_string(),
                    });
                }
                AttachOutcome::Started
            }
        };

        if let Some(stale) = sessions.remove(build_id) {
            stale.terminate().await;
        }

        let container = container_name(build_id);
        let mut child = self.spawner.spawn(&container).await?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Spawn("shell has no stdin".to_string()))?;

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.forward_output(build_id.clone(), stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.forward_output(build_id.clone(), stderr));
        }

        sessions.insert(
            build_id.clone(),
            Arc::new(DebugSession {
                container: container.clone(),
                child: Mutex::new(child),
                stdin: Mutex::new(stdin),
                cwd: Mutex::new(WORKSPACE_MOUNT.to_string()),
                readers,
            }),
        );

        info!(build_id = %build_id, container = %container, ?outcome, "debug session attached");
        self.bus.publish(PipelineEvent::DebugSessionStarted {
            build_id: build_id.clone(),
            container,
            cwd: WORKSPACE_MOUNT.to_string(),
        });
        Ok(outcome)
    }

    fn forward_output<R>(&self, build_id: BuildId, mut reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => bus.publish(PipelineEvent::ConsoleOutput {
                        build_id: build_id.clone(),
                        text: String::from_utf8_lossy(&buf[..n]).into_owned(),
                    }),
                }
            }
        })
    }

    /// Write a command line to the build's shell.
    pub async fn send(&self, build_id: &BuildId, text: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .lock()
            .await
            .get(build_id)
            .cloned()
            .ok_or_else(|| SessionError::NotActive(build_id.to_string()))?;
        if !session.is_alive().await {
            return Err(SessionError::NotActive(build_id.to_string()));
        }

        {
            let mut stdin = session.stdin.lock().await;
            stdin.write_all(text.as_bytes()).await?;
            if !text.ends_with('\n') {
                stdin.write_all(b"\n").await?;
            }
            stdin.flush().await?;
        }

        let mut cwd = session.cwd.lock().await;
        if let Some(next) = next_cwd(&cwd, text) {
            *cwd = next;
        }
        Ok(())
    }

    /// Terminate and forget the build's session. Returns whether one existed.
    pub async fn stop(&self, build_id: &BuildId) -> bool {
        let removed = self.sessions.lock().await.remove(build_id);
        match removed {
            Some(session) => {
                session.terminate().await;
                info!(build_id = %build_id, "debug session stopped");
                true
            }
            None => false,
        }
    }

    /// Terminate every session. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<Arc<DebugSession>> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        let count = drained.len();
        futures::future::join_all(drained.iter().map(|s| s.terminate())).await;
        if count > 0 {
            warn!(count, "terminated all debug sessions");
        }
        count
    }

    pub async fn is_active(&self, build_id: &BuildId) -> bool {
        let session = self.sessions.lock().await.get(build_id).cloned();
        match session {
            Some(session) => session.is_alive().await,
            None => false,
        }
    }

    /// Best-effort working directory of the build's shell, for prompts.
    pub async fn cwd(&self, build_id: &BuildId) -> Option<String> {
        let session = self.sessions.lock().await.get(build_id).cloned()?;
        let cwd = session.cwd.lock().await.clone();
        Some(cwd)
    }
}

fn cd_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*cd(?:\s+(\S+))?\s*$").ok())
        .as_ref()
}

/// Directory a `cd` command would move to, if `command` is one.
///
/// Purely textual: symlinks, `cd -` and variables are not resolved.
fn next_cwd(current: &str, command: &str) -> Option<String> {
    let caps = cd_pattern()?.captures(command.trim_end())?;
    let target = caps.get(1).map_or("~", |m| m.as_str());
    if target == "-" || target.contains('$') {
        return None;
    }

    let joined = if target == "~" || target.starts_with("~/") {
        format!("/root{}", &target[1..])
    } else if target.starts_with('/') {
        target.to_string()
    } else {
        format!("{current}/{target}")
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    Some(format!("/{}", parts.join("/")))
}
