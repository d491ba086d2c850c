//! Pull-request webhook payloads.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// The parts of a GitHub `pull_request` event the engine uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub number: u64,
    pub pull_request: PullRequest,
    pub repository: Repository,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub title: String,
    pub head: Head,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Head {
    #[serde(rename = "ref")]
    pub branch: String,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    /// `owner/name`.
    pub full_name: String,
    pub clone_url: String,
}

impl PullRequestEvent {
    pub fn from_json(body: &str) -> PipelineResult<Self> {
        serde_json::from_str(body).map_err(|e| PipelineError::InvalidEvent(e.to_string()))
    }

    /// Only newly opened and updated pull requests start a build.
    pub fn should_build(&self) -> bool {
        matches!(self.action.as_str(), "opened" | "synchronize")
    }
}
