//! Execution records and the checkpoint vocabulary shared with the engine.
//!
//! Pause state is stored as plain strings (`pause_stage`, `pause_point`) so a
//! record written by a newer or older process still loads; the engine parses
//! them with [`CheckpointStage::from_str`] / [`PausePoint::from_str`] when it
//! decides where to resume.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// BuildId
// ---------------------------------------------------------------------------

/// Globally unique build identifier.
///
/// Derived from the repository name, a UTC timestamp and a random suffix,
/// e.g. `widgets-20250321180412-3f9a1c2b`. Used as the correlation key for
/// logs, pause state, container names and the execution record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(String);

impl BuildId {
    /// Generate a fresh id for a build of `repository` (`owner/name` or `name`).
    pub fn generate(repository: &str) -> Self {
        let name = repository
            .rsplit('/')
            .find(|part| !part.is_empty())
            .unwrap_or("build");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        BuildId(format!(
            "{}-{}-{}",
            name,
            Utc::now().format("%Y%m%d%H%M%S"),
            &suffix[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for BuildId {
    fn from(value: String) -> Self {
        BuildId(value)
    }
}

impl From<&str> for BuildId {
    fn from(value: &str) -> Self {
        BuildId(value.to_string())
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status and checkpoints
// ---------------------------------------------------------------------------

/// Build status. `Pending` moves to `Passed` or `Failed` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Passed,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Passed => "passed",
            BuildStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Pending)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = ParseCheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(BuildStatus::Pending),
            "passed" => Ok(BuildStatus::Passed),
            "failed" => Ok(BuildStatus::Failed),
            other => Err(ParseCheckpointError::Status(other.to_string())),
        }
    }
}

/// Error parsing a stage, point or status name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseCheckpointError {
    #[error("unknown stage: {0}")]
    Stage(String),
    #[error("unknown pause point: {0}")]
    Point(String),
    #[error("unknown build status: {0}")]
    Status(String),
}

/// Stages that carry before/after checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStage {
    Setup,
    Build,
    Test,
}

impl CheckpointStage {
    pub const ALL: [CheckpointStage; 3] = [
        CheckpointStage::Setup,
        CheckpointStage::Build,
        CheckpointStage::Test,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStage::Setup => "setup",
            CheckpointStage::Build => "build",
            CheckpointStage::Test => "test",
        }
    }
}

impl fmt::Display for CheckpointStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStage {
    type Err = ParseCheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "setup" => Ok(CheckpointStage::Setup),
            "build" => Ok(CheckpointStage::Build),
            "test" => Ok(CheckpointStage::Test),
            other => Err(ParseCheckpointError::Stage(other.to_string())),
        }
    }
}

/// Where around a stage a checkpoint sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PausePoint {
    Before,
    After,
}

impl PausePoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            PausePoint::Before => "before",
            PausePoint::After => "after",
        }
    }
}

impl fmt::Display for PausePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PausePoint {
    type Err = ParseCheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before" => Ok(PausePoint::Before),
            "after" => Ok(PausePoint::After),
            other => Err(ParseCheckpointError::Point(other.to_string())),
        }
    }
}

/// Pause flags for one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    #[serde(default)]
    pub before: bool,
    #[serde(default)]
    pub after: bool,
}

impl Breakpoint {
    pub fn is_set(&self, point: PausePoint) -> bool {
        match point {
            PausePoint::Before => self.before,
            PausePoint::After => self.after,
        }
    }

    pub fn set(&mut self, point: PausePoint, enabled: bool) {
        match point {
            PausePoint::Before => self.before = enabled,
            PausePoint::After => self.after = enabled,
        }
    }
}

/// Breakpoints for a build, one entry per checkpoint stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Breakpoints(BTreeMap<CheckpointStage, Breakpoint>);

impl Default for Breakpoints {
    fn default() -> Self {
        Breakpoints(
            CheckpointStage::ALL
                .iter()
                .map(|stage| (*stage, Breakpoint::default()))
                .collect(),
        )
    }
}

impl Breakpoints {
    pub fn is_set(&self, stage: CheckpointStage, point: PausePoint) -> bool {
        self.0.get(&stage).is_some_and(|bp| bp.is_set(point))
    }

    pub fn set(&mut self, stage: CheckpointStage, point: PausePoint, enabled: bool) {
        self.0.entry(stage).or_default().set(point, enabled);
    }

    pub fn get(&self, stage: CheckpointStage) -> Breakpoint {
        self.0.get(&stage).copied().unwrap_or_default()
    }

    /// Whether any checkpoint is armed.
    pub fn any(&self) -> bool {
        self.0.values().any(|bp| bp.before || bp.after)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CheckpointStage, Breakpoint)> + '_ {
        self.0.iter().map(|(stage, bp)| (*stage, *bp))
    }
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

/// Durable record of one build.
///
/// Invariants upheld by the mutating methods:
/// - `pause_stage` and `pause_point` are set together or cleared together.
/// - `is_paused` implies both are set.
/// - once `status` is terminal, `is_paused` is false and `logs` is frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: BuildId,
    pub repository: String,
    pub branch: String,
    pub commit: String,
    pub clone_url: String,
    /// Human label, usually the pull request title.
    pub display_name: String,
    pub pr_number: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub status: BuildStatus,
    /// Last checkpoint stage entered.
    pub active_stage: Option<String>,
    pub is_paused: bool,
    pub pause_stage: Option<String>,
    pub pause_point: Option<String>,
    pub breakpoints: Breakpoints,
    pub logs: String,
    pub duration_ms: Option<u64>,
    pub check_run_id: Option<String>,
    /// Serialized stage configuration, reused when resuming after restart.
    pub config: serde_json::Value,
}

impl ExecutionRecord {
    /// Create a new record in `Pending` state.
    pub fn new(
        id: BuildId,
        repository: impl Into<String>,
        branch: impl Into<String>,
        commit: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            repository: repository.into(),
            branch: branch.into(),
            commit: commit.into(),
            clone_url: String::new(),
            display_name: display_name.into(),
            pr_number: None,
            created_at: Utc::now(),
            status: BuildStatus::Pending,
            active_stage: None,
            is_paused: false,
            pause_stage: None,
            pause_point: None,
            breakpoints: Breakpoints::default(),
            logs: String::new(),
            duration_ms: None,
            check_run_id: None,
            config: serde_json::Value::Null,
        }
    }

    pub fn with_clone_url(mut self, url: impl Into<String>) -> Self {
        self.clone_url = url.into();
        self
    }

    pub fn with_pr_number(mut self, number: u64) -> Self {
        self.pr_number = Some(number);
        self
    }

    pub fn with_breakpoints(mut self, breakpoints: Breakpoints) -> Self {
        self.breakpoints = breakpoints;
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Append log text. Returns `false` (and appends nothing) once terminal.
    pub fn append_log(&mut self, text: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.logs.push_str(text);
        true
    }

    pub fn enter_stage(&mut self, stage: CheckpointStage) {
        self.active_stage = Some(stage.as_str().to_string());
    }

    /// Park the record at a checkpoint. Ignored once terminal.
    pub fn pause_at(&mut self, stage: CheckpointStage, point: PausePoint) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.is_paused = true;
        self.pause_stage = Some(stage.as_str().to_string());
        self.pause_point = Some(point.as_str().to_string());
        true
    }

    pub fn clear_pause(&mut self) {
        self.is_paused = false;
        self.pause_stage = None;
        self.pause_point = None;
    }

    /// Raw pause location, present only when the record is consistently paused.
    pub fn paused_at(&self) -> Option<(&str, &str)> {
        if !self.is_paused {
            return None;
        }
        match (self.pause_stage.as_deref(), self.pause_point.as_deref()) {
            (Some(stage), Some(point)) if !stage.is_empty() && !point.is_empty() => {
                Some((stage, point))
            }
            _ => None,
        }
    }

    /// Move to a terminal status and compute the duration.
    ///
    /// Returns `false` without touching the record if it is already terminal
    /// or `status` is `Pending`.
    pub fn finish(&mut self, status: BuildStatus, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.clear_pause();
        let elapsed = (now - self.created_at).num_milliseconds().max(0);
        self.duration_ms = Some(elapsed as u64);
        true
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            id: self.id.clone(),
            repository: self.repository.clone(),
            display_name: self.display_name.clone(),
            pr_number: self.pr_number,
            status: self.status,
            created_at: self.created_at,
            duration_ms: self.duration_ms,
            active_stage: self.active_stage.clone(),
            is_paused: self.is_paused,
        }
    }
}

/// Listing row for a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: BuildId,
    pub repository: String,
    pub display_name: String,
    pub pr_number: Option<u64>,
    pub status: BuildStatus,
    pub created_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub active_stage: Option<String>,
    pub is_paused: bool,
}

// ---------------------------------------------------------------------------
// TimeRange
// ---------------------------------------------------------------------------

/// Inclusive creation-time window for listing and metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    /// Parse dashboard windows such as `15m`, `1h`, `12h`, `1d`, `7d`.
    pub fn parse_window(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (amount, to_window): (&str, fn(i64) -> Option<Duration>) =
            if let Some(n) = raw.strip_suffix('m') {
                (n, Duration::try_minutes)
            } else if let Some(n) = raw.strip_suffix('h') {
                (n, Duration::try_hours)
            } else if let Some(n) = raw.strip_suffix('d') {
                (n, Duration::try_days)
            } else {
                return None;
            };
        let amount: i64 = amount.parse().ok().filter(|n| *n > 0)?;
        let since = Utc::now().checked_sub_signed(to_window(amount)?)?;
        Some(Self {
            since: Some(since),
            until: None,
        })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.since.map_or(true, |since| ts >= since) && self.until.map_or(true, |until| ts <= until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ExecutionRecord {
        ExecutionRecord::new(
            BuildId::from("widgets-1"),
            "acme/widgets",
            "feature/x",
            "abc123",
            "Add widgets",
        )
    }

    #[test]
    fn test_build_id_generate_uses_repo_name() {
        let id = BuildId::generate("acme/widgets");
        assert!(id.as_str().starts_with("widgets-"));
        assert_ne!(id, BuildId::generate("acme/widgets"));
    }

    #[test]
    fn test_build_id_generate_handles_trailing_slash() {
        let id = BuildId::generate("acme/widgets/");
        assert!(id.as_str().starts_with("widgets-"));
    }

    #[test]
    fn test_pause_fields_set_and_cleared_together() {
        let mut rec = record();
        assert!(rec.pause_at(CheckpointStage::Test, PausePoint::Before));
        assert_eq!(rec.paused_at(), Some(("test", "before")));

        rec.clear_pause();
        assert!(!rec.is_paused);
        assert!(rec.pause_stage.is_none());
        assert!(rec.pause_point.is_none());
        assert_eq!(rec.paused_at(), None);
    }

    #[test]
    fn test_finish_is_once_only() {
        let mut rec = record();
        let later = rec.created_at + Duration::seconds(90);
        assert!(rec.finish(BuildStatus::Failed, later));
        assert_eq!(rec.duration_ms, Some(90_000));

        assert!(!rec.finish(BuildStatus::Passed, later + Duration::seconds(5)));
        assert_eq!(rec.status, BuildStatus::Failed);
        assert_eq!(rec.duration_ms, Some(90_000));
    }

    #[test]
    fn test_finish_clears_pause_and_freezes_logs() {
        let mut rec = record();
        rec.pause_at(CheckpointStage::Build, PausePoint::After);
        assert!(rec.append_log("line 1\n"));
        rec.finish(BuildStatus::Passed, Utc::now());

        assert!(!rec.is_paused);
        assert!(!rec.append_log("late line\n"));
        assert_eq!(rec.logs, "line 1\n");
        assert!(!rec.pause_at(CheckpointStage::Test, PausePoint::Before));
    }

    #[test]
    fn test_finish_rejects_pending() {
        let mut rec = record();
        assert!(!rec.finish(BuildStatus::Pending, Utc::now()));
        assert!(rec.duration_ms.is_none());
    }

    #[test]
    fn test_breakpoints_default_has_all_stages_off() {
        let bps = Breakpoints::default();
        assert!(!bps.any());
        for stage in CheckpointStage::ALL {
            assert_eq!(bps.get(stage), Breakpoint::default());
        }
    }

    #[test]
    fn test_breakpoints_serialize_as_stage_map() {
        let mut bps = Breakpoints::default();
        bps.set(CheckpointStage::Test, PausePoint::Before, true);
        let json = serde_json::to_value(&bps).unwrap();
        assert_eq!(json["test"]["before"], serde_json::json!(true));
        assert_eq!(json["setup"]["after"], serde_json::json!(false));
    }

    #[test]
    fn test_checkpoint_names_parse() {
        assert_eq!("build".parse::<CheckpointStage>(), Ok(CheckpointStage::Build));
        assert_eq!("after".parse::<PausePoint>(), Ok(PausePoint::After));
        assert!("lint".parse::<CheckpointStage>().is_err());
        assert!("during".parse::<PausePoint>().is_err());
    }

    #[test]
    fn test_time_range_windows() {
        assert!(TimeRange::parse_window("15m").is_some());
        assert!(TimeRange::parse_window("7d").is_some());
        assert!(TimeRange::parse_window("0h").is_none());
        assert!(TimeRange::parse_window("3w").is_none());
        assert!(TimeRange::parse_window("h").is_none());

        let range = TimeRange::parse_window("1h").unwrap();
        assert!(range.contains(Utc::now()));
        assert!(!range.contains(Utc::now() - Duration::hours(2)));
    }

    #[test]
    fn test_time_range_rejects_odd_windows() {
        assert!(TimeRange::parse_window("1é").is_none());
        assert!(TimeRange::parse_window("é").is_none());
        assert!(TimeRange::parse_window("99999999999999d").is_none());
        assert!(TimeRange::parse_window("9223372036854775807m").is_none());
        assert!(TimeRange::parse_window("-5h").is_none());
    }
}
