//! Engine-wide settings.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Settings shared by every build run by an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Root under which each build gets its own checkout directory.
    pub workspace: PathBuf,
    /// Docker CLI binary.
    pub docker: String,
    /// How often buffered log lines are persisted.
    pub flush_interval: Duration,
    /// Per-command limit; `None` means no limit.
    pub command_timeout: Option<Duration>,
    /// Keep containers after a build for post-mortem debug sessions.
    pub keep_containers: bool,
    /// File that acknowledges a repository intentionally has no tests.
    pub zero_tests_marker: String,
    /// Name shown on check runs.
    pub check_name: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from(".stagehand/workspace"),
            docker: "docker".to_string(),
            flush_interval: Duration::from_millis(500),
            command_timeout: None,
            keep_containers: true,
            zero_tests_marker: ".stagehand-no-tests".to_string(),
            check_name: "stagehand".to_string(),
        }
    }
}

impl EngineSettings {
    /// Defaults overridden by `STAGEHAND_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`EngineSettings::from_env`] with an explicit variable lookup.
    /// Unparseable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();

        if let Some(dir) = lookup("STAGEHAND_WORKSPACE").filter(|v| !v.is_empty()) {
            settings.workspace = PathBuf::from(dir);
        }
        if let Some(docker) = lookup("STAGEHAND_DOCKER").filter(|v| !v.is_empty()) {
            settings.docker = docker;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "STAGEHAND_FLUSH_MS") {
            settings.flush_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "STAGEHAND_COMMAND_TIMEOUT_SECS") {
            settings.command_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(keep) = parse_var::<bool>(&lookup, "STAGEHAND_KEEP_CONTAINERS") {
            settings.keep_containers = keep;
        }
        settings
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_keep_containers(mut self, keep: bool) -> Self {
        self.keep_containers = keep;
        self
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}
