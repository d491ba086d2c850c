//! Quality gates applied to stage output.
//!
//! A gate inspects captured output and decides whether the stage passed,
//! independent of the tool's exit code.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::stage::ZeroTestsPolicy;

/// Gate evaluation verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "message", rename_all = "snake_case")]
pub enum GateVerdict {
    Pass,
    /// Passed, with an advisory message for the build log.
    Warn(String),
    Fail(String),
}

impl GateVerdict {
    pub fn passed(&self) -> bool {
        !matches!(self, GateVerdict::Fail(_))
    }
}

/// Pass/fail heuristic over a tool's output.
pub trait QualityGate: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, output: &str) -> GateVerdict;
}

fn score_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"rated at (-?\d+(?:\.\d+)?)/10").ok())
        .as_ref()
}

/// Fails a lint run whose reported score is below a threshold.
#[derive(Debug, Clone)]
pub struct LintScoreGate {
    threshold: f64,
}

impl LintScoreGate {
    pub const DEFAULT_THRESHOLD: f64 = 8.0;

    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Last `rated at X/10` score in the output.
    pub fn score(&self, output: &str) -> Option<f64> {
        score_pattern()?
            .captures_iter(output)
            .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
            .last()
    }
}

impl Default for LintScoreGate {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

impl QualityGate for LintScoreGate {
    fn name(&self) -> &str {
        "lint-score"
    }

    fn evaluate(&self, output: &str) -> GateVerdict {
        match self.score(output) {
            Some(score) if score < self.threshold => GateVerdict::Fail(format!(
                "lint score {score:.2}/10 is below the required {:.2}",
                self.threshold
            )),
            Some(_) => GateVerdict::Pass,
            None => GateVerdict::Warn("no lint score found in output".to_string()),
        }
    }
}

/// Flags test runs that discovered no tests.
///
/// A marker file in the repository acknowledges that having no tests is
/// intentional and silences the gate.
#[derive(Debug, Clone)]
pub struct TestDiscoveryGate {
    policy: ZeroTestsPolicy,
    marker_present: bool,
}

impl TestDiscoveryGate {
    pub fn new(policy: ZeroTestsPolicy) -> Self {
        Self {
            policy,
            marker_present: false,
        }
    }

    pub fn with_marker(mut self, present: bool) -> Self {
        self.marker_present = present;
        self
    }

    pub fn zero_tests(&self, output: &str) -> bool {
        output.contains("collected 0 items") || output.contains("no tests ran")
    }
}

impl QualityGate for TestDiscoveryGate {
    fn name(&self) -> &str {
        "test-discovery"
    }

    fn evaluate(&self, output: &str) -> GateVerdict {
        if !self.zero_tests(output) || self.marker_present {
            return GateVerdict::Pass;
        }
        let message = "no tests were collected; check test discovery settings".to_string();
        match self.policy {
            ZeroTestsPolicy::Warn => GateVerdict::Warn(message),
            ZeroTestsPolicy::Fail => GateVerdict::Fail(message),
        }
    }
}
