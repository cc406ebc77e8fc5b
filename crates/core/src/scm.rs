//! Commit-status reporting
//!
//! Each `scm` entry in the Honefile posts build statuses for the current
//! commit. Reporting is strictly best-effort: a sink that cannot be
//! initialized is dropped with a warning and posting failures never fail
//! the build.

use crate::condition::evaluate;
use crate::errors::{HoneError, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{info, warn};

const STATUS_CONTEXT: &str = "hone";

/// `scm` section of the Honefile; opaque to the scheduler, consumed only
/// here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScmConfig {
    /// Only "github" is supported
    #[serde(default)]
    pub provider: Option<String>,
    /// API base URL override (github.com by default)
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// "owner/name"
    #[serde(default)]
    pub repo: Option<String>,
    /// Predicate against the build env gating this sink
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Running,
    Success,
    Failure,
}

impl BuildStatus {
    fn state(&self) -> &'static str {
        match self {
            Self::Running => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

pub struct StatusSink {
    client: reqwest::Client,
    token: String,
    statuses_url: String,
}

impl StatusSink {
    /// Build a sink from one config entry. Returns `None` when the entry
    /// does not apply to this build (condition false, no token, no commit).
    pub fn init(
        config: &ScmConfig,
        env: &IndexMap<String, String>,
        commit: &str,
    ) -> Result<Option<Self>> {
        if let Some(condition) = &config.condition {
            if !evaluate(condition, env)? {
                return Ok(None);
            }
        }

        let provider = config.provider.as_deref().unwrap_or("github");
        if provider != "github" {
            return Err(HoneError::config(format!(
                "Unknown reporting provider: {provider}."
            )));
        }

        let Some(token) = config.token.clone().filter(|t| !t.is_empty()) else {
            return Ok(None);
        };
        let Some(repo) = config.repo.clone().filter(|r| !r.is_empty()) else {
            warn!("Reporting entry has no repo configured, skipping.");
            return Ok(None);
        };
        if commit.is_empty() {
            warn!("No commit to report statuses for, skipping.");
            return Ok(None);
        }

        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.github.com".to_string());
        let base = base.trim_end_matches('/');

        info!(repo = %repo, "Initialized reporting provider: {provider}");
        Ok(Some(Self {
            client: reqwest::Client::new(),
            token,
            statuses_url: format!("{base}/repos/{repo}/statuses/{commit}"),
        }))
    }

    /// Post one status; failures are logged and swallowed.
    pub async fn post(&self, status: BuildStatus, description: &str, target_url: &str) {
        let mut body = serde_json::json!({
            "state": status.state(),
            "description": description,
            "context": STATUS_CONTEXT,
        });
        if !target_url.is_empty() {
            body["target_url"] = serde_json::Value::String(target_url.to_string());
        }

        let result = self
            .client
            .post(&self.statuses_url)
            .bearer_auth(&self.token)
            .header("User-Agent", STATUS_CONTEXT)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!("Posting commit status failed: HTTP {}", response.status());
            }
            Err(err) => warn!("Posting commit status failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(branch: &str) -> IndexMap<String, String> {
        IndexMap::from([("GIT_BRANCH".to_string(), branch.to_string())])
    }

    fn config(token: &str, repo: &str, condition: Option<&str>) -> ScmConfig {
        ScmConfig {
            provider: None,
            url: None,
            token: Some(token.to_string()),
            repo: Some(repo.to_string()),
            condition: condition.map(String::from),
        }
    }

    #[test]
    fn test_sink_skipped_without_token() {
        let sink = StatusSink::init(&config("", "o/r", None), &env("main"), "abc").unwrap();
        assert!(sink.is_none());
    }

    #[test]
    fn test_sink_gated_by_condition() {
        let cfg = config("tok", "o/r", Some("GIT_BRANCH = 'main'"));
        assert!(StatusSink::init(&cfg, &env("main"), "abc").unwrap().is_some());
        assert!(StatusSink::init(&cfg, &env("dev"), "abc").unwrap().is_none());
    }

    #[test]
    fn test_unknown_provider_is_error() {
        let mut cfg = config("tok", "o/r", None);
        cfg.provider = Some("sourcehut".to_string());
        assert!(StatusSink::init(&cfg, &env("main"), "abc").is_err());
    }

    #[test]
    fn test_status_states() {
        assert_eq!(BuildStatus::Running.state(), "pending");
        assert_eq!(BuildStatus::Success.state(), "success");
        assert_eq!(BuildStatus::Failure.state(), "failure");
    }
}
