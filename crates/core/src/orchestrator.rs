//! Build orchestration
//!
//! Wires the components together: cache backends, execution runtime, the
//! report, and the decorated callback stack, then drives the graph and
//! finalizes the report. The number of returned errors becomes the
//! process exit code.

use crate::cache::{with_cache, Cache, FileCache, S3Cache};
use crate::condition::with_condition;
use crate::config::Config;
use crate::errors::{HoneError, Result};
use crate::executor::{dispatch_engine, KubernetesExecutor, Runtime};
use crate::graph::JobGraph;
use crate::job::Engine;
use crate::logging::{with_logging, LogBuffer};
use crate::report::BuildReport;
use crate::scm::{BuildStatus, StatusSink};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

/// Result of one build run
pub struct BuildOutcome {
    pub errors: Vec<HoneError>,
    pub report: Option<crate::report::ReportDocument>,
}

fn default_engine(config: &Config) -> Engine {
    config.engine.unwrap_or(Engine::Docker)
}

fn needs_kubernetes(config: &Config) -> bool {
    config
        .jobs
        .iter()
        .any(|job| job.engine_for(config.engine) == Engine::Kubernetes)
}

async fn connect_s3(config: &Config) -> Result<Option<Arc<S3Cache>>> {
    let Some(s3_config) = &config.cache.s3 else {
        return Ok(None);
    };
    if s3_config.disabled {
        return Ok(None);
    }

    let cache = S3Cache::connect(s3_config.clone()).await?;
    info!("Initialized S3 cache.");
    Ok(Some(Arc::new(cache)))
}

/// Upload the accumulated JSON log stream, returning its public URL.
async fn upload_log(cache: &dyn Cache, report: &BuildReport, buffer: &LogBuffer) -> Result<String> {
    let name = if report.commit().is_empty() {
        "build.json".to_string()
    } else {
        format!("{}.json", report.commit())
    };

    let mut writer = cache.writer("logs", &name).await?;
    let contents = buffer.lock().unwrap().clone();
    writer
        .sink
        .write_all(&contents)
        .await
        .map_err(|e| HoneError::cache(format!("uploading log {name}: {e}")))?;
    writer.finish().await
}

/// Run the build for `target`. Configuration errors surface as a single
/// error; job errors accumulate without stopping independent subtrees.
pub async fn run_build(config: Config, target: &str, log_buffer: Option<LogBuffer>) -> BuildOutcome {
    let fail = |err: HoneError| BuildOutcome {
        errors: vec![err],
        report: None,
    };

    let s3 = match connect_s3(&config).await {
        Ok(s3) => s3,
        Err(err) => return fail(err),
    };

    let kubernetes = match (needs_kubernetes(&config), s3.clone()) {
        (false, _) => None,
        (true, None) => {
            return fail(HoneError::config(
                "Kubernetes is not currently supported without an S3 configuration.",
            ));
        }
        (true, Some(s3_cache)) => {
            let kube_config = config.kubernetes.clone().unwrap_or_default();
            match KubernetesExecutor::connect(&kube_config, s3_cache as Arc<dyn Cache>).await {
                Ok(executor) => Some(Arc::new(executor)),
                Err(err) => return fail(err),
            }
        }
    };

    let file_cache = match FileCache::from_config(&config.cache.file).await {
        Ok(cache) => Arc::new(cache),
        Err(err) => return fail(err),
    };

    info!("Using {} for running jobs.", default_engine(&config));

    let graph = match JobGraph::new(&config.jobs) {
        Ok(graph) => graph,
        Err(err) => return fail(err),
    };

    let (pad, target_errors) = graph.longest_target(target);
    if !target_errors.is_empty() {
        if let Some(first) = target_errors.first() {
            if first.to_string() == format!("Target {target} not found.") {
                let names: Vec<&str> =
                    config.jobs.iter().map(|job| job.name.as_str()).collect();
                error!(
                    "Target {target} not found. Declared jobs: {}.",
                    names.join(", ")
                );
            }
        }
        return BuildOutcome {
            errors: target_errors,
            report: None,
        };
    }

    let report = Arc::new(BuildReport::new(target, &config.env));

    let sinks: Vec<StatusSink> = config
        .scm
        .iter()
        .filter_map(|scm| {
            StatusSink::init(scm, &config.env, report.commit()).unwrap_or_else(|err| {
                warn!("Skipping reporting entry: {err}");
                None
            })
        })
        .collect();
    for sink in &sinks {
        sink.post(BuildStatus::Running, "Build started!", "").await;
    }

    let runtime = Arc::new(Runtime::new(config.engine, kubernetes));

    // The callback stack, innermost first: engine dispatch, condition
    // gating, remote cache, report registration, local cache, log lines.
    let mut callback = dispatch_engine(runtime.clone());
    callback = with_condition(config.env.clone(), callback);
    if let Some(s3) = s3.clone() {
        callback = with_cache(s3, callback);
    }
    callback = report.record(callback);
    callback = with_cache(file_cache, callback);
    callback = with_logging(pad, callback);

    let errors = graph.resolve_target(target, callback).await;

    runtime.shutdown().await;

    let success = errors.is_empty();

    let mut log_url = String::new();
    if let (Some(s3), Some(buffer)) = (s3.as_deref(), log_buffer.as_ref()) {
        match upload_log(s3, &report, buffer).await {
            Ok(url) => log_url = url,
            Err(err) => warn!("Log upload failed: {err}"),
        }
    }

    let document = report.finalize(success, log_url);
    if let Some(s3) = s3.as_deref() {
        if let Err(err) = document.upload(s3).await {
            warn!("Report upload failed: {err}");
        }
    }

    let (status, message) = if success {
        (BuildStatus::Success, "Build completed successfully!")
    } else {
        (BuildStatus::Failure, "Build failed!")
    };
    for sink in &sinks {
        sink.post(status, message, &document.log_url).await;
    }

    if !success {
        error!("Exiting with failure.");
    }

    BuildOutcome {
        errors,
        report: Some(document),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use tempfile::TempDir;

    async fn run_in(dir: &TempDir, source: &str, target: &str) -> BuildOutcome {
        let cache_dir = dir.path().join(".hone_cache");
        let source = source.replace("CACHE_DIR", &cache_dir.display().to_string());
        let config = config::parse(&source).await.unwrap();
        run_build(config, target, None).await
    }

    #[tokio::test]
    async fn test_single_job_local_build() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.txt");

        let source = format!(
            r#"{{
                engine: "local",
                cache: {{ file: {{ cache_dir: "CACHE_DIR" }} }},
                jobs: [
                    {{ name: "hello", shell: "echo hi > {out}", outputs: ["{out}"] }},
                ],
            }}"#,
            out = out.display()
        );

        let outcome = run_in(&dir, &source, "hello").await;
        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
        assert!(out.is_file());

        let report = outcome.report.unwrap();
        assert!(report.success);
        assert_eq!(report.jobs.len(), 1);
        assert!(!report.jobs[0].cached);

        // Identical second run is served from the local cache; the local
        // tier sits outside the report recorder, so the job never
        // re-registers and its executor is never reached.
        let cache_dir = dir.path().join(".hone_cache");
        let source = source.replace("CACHE_DIR", &cache_dir.display().to_string());
        let config = crate::config::parse(&source).await.unwrap();
        let jobs = config.jobs.clone();
        let outcome = run_build(config, "hello", None).await;
        assert!(outcome.errors.is_empty());
        assert!(jobs[0].cached());
        assert!(outcome.report.unwrap().jobs.is_empty());
    }

    #[tokio::test]
    async fn test_failure_counts_into_errors() {
        let dir = TempDir::new().unwrap();
        let source = r#"{
            engine: "local",
            cache: { file: { cache_dir: "CACHE_DIR" } },
            jobs: [
                { name: "a", shell: "false" },
                { name: "b", shell: "true", deps: ["a"] },
            ],
        }"#;

        let outcome = run_in(&dir, source, "b").await;
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.to_string().contains("Failed dependencies")));

        // Only the job that actually started registered with the report;
        // its dependent was short-circuited before the recorder.
        let report = outcome.report.unwrap();
        assert!(!report.success);
        assert_eq!(report.jobs.len(), 1);
        assert_eq!(report.jobs[0].name, "a");
        assert!(!report.jobs[0].successful);
    }

    #[tokio::test]
    async fn test_missing_target_is_single_error() {
        let dir = TempDir::new().unwrap();
        let source = r#"{
            engine: "local",
            cache: { file: { cache_dir: "CACHE_DIR" } },
            jobs: [{ name: "a", shell: "true" }],
        }"#;

        let outcome = run_in(&dir, source, "release").await;
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].to_string(), "Target release not found.");
    }

    #[tokio::test]
    async fn test_condition_skip_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let source = r#"{
            engine: "local",
            cache: { file: { cache_dir: "CACHE_DIR" } },
            jobs: [
                { name: "gated", shell: "false",
                  condition: "GIT_BRANCH = 'never-this-branch'" },
            ],
        }"#;

        let outcome = run_in(&dir, source, "gated").await;
        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
        assert!(outcome.report.unwrap().success);
    }

    #[tokio::test]
    async fn test_kubernetes_without_s3_rejected() {
        let dir = TempDir::new().unwrap();
        let source = r#"{
            engine: "kubernetes",
            cache: { file: { cache_dir: "CACHE_DIR" } },
            jobs: [{ name: "a", image: "alpine", shell: "true" }],
        }"#;

        let outcome = run_in(&dir, source, "a").await;
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].to_string().contains("S3"));
    }

    #[tokio::test]
    async fn test_target_selection_leaves_unrelated_jobs_untouched() {
        let dir = TempDir::new().unwrap();
        let c_out = dir.path().join("c.txt");
        let source = format!(
            r#"{{
                engine: "local",
                cache: {{ file: {{ cache_dir: "CACHE_DIR" }} }},
                jobs: [
                    {{ name: "a", shell: "true" }},
                    {{ name: "b", shell: "true", deps: ["a"] }},
                    {{ name: "c", shell: "touch {c_out}" }},
                ],
            }}"#,
            c_out = c_out.display()
        );

        let outcome = run_in(&dir, &source, "b").await;
        assert!(outcome.errors.is_empty());
        let report = outcome.report.unwrap();
        let mut names: Vec<&str> = report.jobs.iter().map(|j| j.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
        assert!(!c_out.exists());
    }

    #[tokio::test]
    async fn test_service_detach_and_stop() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("client-ran.txt");
        let source = format!(
            r#"{{
                engine: "local",
                cache: {{ file: {{ cache_dir: "CACHE_DIR" }} }},
                jobs: [
                    {{ name: "db", shell: "sleep 30", service: true }},
                    {{ name: "client", shell: "touch {marker}", deps: ["db"] }},
                ],
            }}"#,
            marker = marker.display()
        );

        let started = std::time::Instant::now();
        let outcome = run_in(&dir, &source, "client").await;
        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
        assert!(marker.is_file());
        // The service was stopped rather than waited out.
        assert!(started.elapsed() < std::time::Duration::from_secs(25));

        let report = outcome.report.unwrap();
        let db = report.jobs.iter().find(|j| j.name == "db").unwrap();
        assert!(db.service);
        assert!(!db.cached);
    }
}
