//! Build report
//!
//! The report is created at build start, appended to concurrently as jobs
//! complete, and finalized exactly once at termination. Its serialized
//! shape is a public surface consumed by commit-status and report sinks.

use crate::cache::Cache;
use crate::errors::Result;
use crate::graph::JobCallback;
use crate::job::{Job, JobReport};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::info;

pub struct BuildReport {
    git_branch: String,
    git_commit: String,
    git_tag: String,
    target: String,
    start_time: DateTime<Utc>,
    jobs: Mutex<Vec<Arc<Job>>>,
}

/// Finalized, serializable report document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDocument {
    pub git_branch: String,
    pub git_commit: String,
    pub git_tag: String,
    pub target: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub success: bool,
    pub jobs: Vec<JobReport>,
    pub log_url: String,
}

impl BuildReport {
    pub fn new(target: &str, env: &IndexMap<String, String>) -> Self {
        let get = |name: &str| env.get(name).cloned().unwrap_or_default();
        Self {
            git_branch: get("GIT_BRANCH"),
            git_commit: get("GIT_COMMIT"),
            git_tag: get("GIT_TAG"),
            target: target.to_string(),
            start_time: Utc::now(),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn commit(&self) -> &str {
        &self.git_commit
    }

    /// Decorate a callback so every job passing through is registered with
    /// the report. Registration happens up front; the snapshot at
    /// finalization picks up whatever state the job ended with.
    pub fn record(self: &Arc<Self>, inner: JobCallback) -> JobCallback {
        let report = self.clone();
        JobCallback::new(move |job: Arc<Job>| {
            let report = report.clone();
            let inner = inner.clone();
            Box::pin(async move {
                report.jobs.lock().unwrap().push(job.clone());
                inner.run(job).await
            })
        })
    }

    pub fn finalize(&self, success: bool, log_url: String) -> ReportDocument {
        let jobs = self.jobs.lock().unwrap();
        ReportDocument {
            git_branch: self.git_branch.clone(),
            git_commit: self.git_commit.clone(),
            git_tag: self.git_tag.clone(),
            target: self.target.clone(),
            start_time: self.start_time,
            end_time: Utc::now(),
            success,
            jobs: jobs.iter().map(|job| job.report()).collect(),
            log_url,
        }
    }
}

impl ReportDocument {
    /// Upload the report JSON through the cache's streaming writer and
    /// return its public URL.
    pub async fn upload(&self, cache: &dyn Cache) -> Result<String> {
        let name = if self.git_commit.is_empty() {
            format!("{}.json", self.start_time.timestamp())
        } else {
            format!("{}.json", self.git_commit)
        };

        let mut writer = cache.writer("reports", &name).await?;
        let encoded = serde_json::to_vec_pretty(self)
            .map_err(|e| crate::errors::HoneError::cache(format!("encoding report: {e}")))?;
        writer.sink.write_all(&encoded).await.map_err(|e| {
            crate::errors::HoneError::cache(format!("uploading report {name}: {e}"))
        })?;

        let url = writer.finish().await?;
        info!("Build report uploaded to {url}");
        Ok(url)
    }
}
