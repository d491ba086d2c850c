//! Check-run reporting to the source-control host.
//!
//! Failures here are logged by the engine and never affect a build.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::CheckError;

const DEFAULT_API_URL: &str = "https://api.github.com";

/// Final conclusion reported for a check run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Success,
    Failure,
}

impl CheckConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckConclusion::Success => "success",
            CheckConclusion::Failure => "failure",
        }
    }
}

/// Check-run API.
#[async_trait]
pub trait CheckClient: Send + Sync {
    /// Open an `in_progress` check for a commit. Returns the check id.
    async fn create_check(
        &self,
        repository: &str,
        commit: &str,
        name: &str,
    ) -> Result<String, CheckError>;

    /// Complete a check with a conclusion and summary.
    async fn update_check(
        &self,
        repository: &str,
        check_id: &str,
        conclusion: CheckConclusion,
        summary: &str,
    ) -> Result<(), CheckError>;
}

/// Client for the GitHub Checks REST API.
#[derive(Debug, Clone)]
pub struct GithubChecks {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl GithubChecks {
    pub fn new(token: impl Into<String>, api_url: Option<String>) -> Result<Self, CheckError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("stagehand/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_url: api_url
                .unwrap_or_else(|| DEFAULT_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            token: token.into(),
        })
    }

    /// Build from `GITHUB_TOKEN` and optional `GITHUB_API_URL`.
    ///
    /// Returns `None` when no token is configured.
    pub fn from_env() -> Option<Result<Self, CheckError>> {
        let token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty())?;
        Some(Self::new(token, std::env::var("GITHUB_API_URL").ok()))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<serde_json::Value, CheckError> {
        let response = request
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CheckError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl CheckClient for GithubChecks {
    async fn create_check(
        &self,
        repository: &str,
        commit: &str,
        name: &str,
    ) -> Result<String, CheckError> {
        let url = format!("{}/repos/{repository}/check-runs", self.api_url);
        let body = json!({
            "name": name,
            "head_sha": commit,
            "status": "in_progress",
            "started_at": now_rfc3339(),
        });
        let created = self.send(self.http.post(url).json(&body)).await?;
        created["id"]
            .as_u64()
            .map(|id| id.to_string())
            .ok_or(CheckError::MissingId)
    }

    async fn update_check(
        &self,
        repository: &str,
        check_id: &str,
        conclusion: CheckConclusion,
        summary: &str,
    ) -> Result<(), CheckError> {
        let url = format!("{}/repos/{repository}/check-runs/{check_id}", self.api_url);
        let title = match conclusion {
            CheckConclusion::Success => "Build passed",
            CheckConclusion::Failure => "Build failed",
        };
        let body = json!({
            "status": "completed",
            "conclusion": conclusion.as_str(),
            "completed_at": now_rfc3339(),
            "output": { "title": title, "summary": summary },
        });
        self.send(self.http.patch(url).json(&body)).await?;
        Ok(())
    }
}

/// Check client used when no credentials are configured.
#[derive(Debug, Clone, Default)]
pub struct NoopChecks;

#[async_trait]
impl CheckClient for NoopChecks {
    async fn create_check(
        &self,
        repository: &str,
        commit: &str,
        _name: &str,
    ) -> Result<String, CheckError> {
        debug!(repository, commit, "check runs disabled");
        Ok(format!("local-{}", uuid::Uuid::new_v4().simple()))
    }

    async fn update_check(
        &self,
        _repository: &str,
        check_id: &str,
        conclusion: CheckConclusion,
        _summary: &str,
    ) -> Result<(), CheckError> {
        debug!(check_id, conclusion = conclusion.as_str(), "check runs disabled");
        Ok(())
    }
}
