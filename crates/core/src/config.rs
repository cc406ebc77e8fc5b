//! Configuration loading
//!
//! The Honefile is JSON5. Loading renders the build environment (process
//! env over declared defaults, git values injected last), resolves
//! secrets, substitutes `${...}` tokens in job fields, merges implicit
//! dependencies discovered through `${jobs.NAME...}` references, and
//! validates every job. The result is the fully-resolved configuration
//! the orchestrator consumes.

use crate::cache::{FileCacheConfig, S3Config};
use crate::errors::{HoneError, Result};
use crate::executor::KubernetesConfig;
use crate::git::GitInfo;
use crate::job::{Engine, Job};
use crate::scm::ScmConfig;
use crate::variable::{scan_job_refs, substitute, SubstitutionContext};
use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
pub struct CacheSection {
    #[serde(default)]
    pub file: FileCacheConfig,
    #[serde(default)]
    pub s3: Option<S3Config>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    /// `NAME` or `NAME=default` entries resolved from the process env
    #[serde(default)]
    env: Vec<String>,

    /// Names of secrets pulled from the process env
    #[serde(default)]
    secrets: Vec<String>,

    #[serde(default)]
    scm: Vec<ScmConfig>,

    #[serde(default)]
    jobs: Vec<Job>,

    #[serde(default)]
    cache: CacheSection,

    #[serde(default)]
    kubernetes: Option<KubernetesConfig>,

    #[serde(default)]
    engine: Option<Engine>,
}

/// Fully-resolved build configuration
#[derive(Debug)]
pub struct Config {
    pub env: IndexMap<String, String>,
    pub secrets: IndexMap<String, String>,
    pub scm: Vec<ScmConfig>,
    pub jobs: Vec<Arc<Job>>,
    pub cache: CacheSection,
    pub kubernetes: Option<KubernetesConfig>,
    pub engine: Option<Engine>,
}

pub async fn load(path: &Path) -> Result<Config> {
    let source = tokio::fs::read_to_string(path).await.map_err(|e| {
        HoneError::ConfigParse {
            message: format!("reading {}: {e}", path.display()),
        }
    })?;
    parse(&source).await
}

pub async fn parse(source: &str) -> Result<Config> {
    let raw: RawConfig = json5::from_str(source).map_err(|e| HoneError::ConfigParse {
        message: e.to_string(),
    })?;

    let git = GitInfo::discover().await;
    resolve(raw, git)
}

fn render_env(entries: &[String], git: &GitInfo) -> IndexMap<String, String> {
    let mut env = IndexMap::new();
    for entry in entries {
        let (name, default) = match entry.split_once('=') {
            Some((name, default)) => (name, default),
            None => (entry.as_str(), ""),
        };
        let value = std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string());
        env.insert(name.to_string(), value);
    }

    git.inject(&mut env);
    env
}

fn render_secrets(names: &[String]) -> IndexMap<String, String> {
    let mut secrets = IndexMap::new();
    for name in names {
        let value = std::env::var(name).unwrap_or_default();
        if value.is_empty() {
            debug!(secret = %name, "Secret is empty or unset.");
        }
        secrets.insert(name.clone(), value);
    }
    secrets
}

/// Raw string fields of a job that participate in substitution and
/// reference scanning.
fn job_strings(job: &Job) -> Vec<&str> {
    let mut strings = Vec::new();
    strings.extend(job.image.as_deref());
    strings.extend(job.shell.as_deref());
    if let Some(exec) = &job.exec {
        strings.extend(exec.iter().map(String::as_str));
    }
    strings.extend(job.inputs.iter().map(String::as_str));
    strings.extend(job.outputs.iter().map(String::as_str));
    strings.extend(job.env.values().map(String::as_str));
    strings.extend(job.workdir.as_deref());
    strings
}

/// Declaration-order Kahn sort over the merged dependency sets. Resolution
/// must visit a job after everything it references.
fn topological_order(jobs: &[Job]) -> Result<Vec<usize>> {
    let mut index = HashMap::new();
    for (i, job) in jobs.iter().enumerate() {
        if index.insert(job.name.as_str(), i).is_some() {
            return Err(HoneError::config(format!(
                "Job {} is declared more than once.",
                job.name
            )));
        }
    }

    let mut indegree = vec![0usize; jobs.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); jobs.len()];
    for (i, job) in jobs.iter().enumerate() {
        for dep in &job.deps {
            let Some(&dep_index) = index.get(dep.as_str()) else {
                return Err(HoneError::config(format!(
                    "Job {} depends on unknown job {dep}.",
                    job.name
                )));
            };
            indegree[i] += 1;
            dependents[dep_index].push(i);
        }
    }

    let mut queue: VecDeque<usize> = (0..jobs.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(jobs.len());
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &dependent in &dependents[i] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if order.len() != jobs.len() {
        return Err(HoneError::config(
            "Dependency cycle detected in job declarations.",
        ));
    }
    Ok(order)
}

fn substitute_field(field: &mut String, ctx: &SubstitutionContext) -> Result<()> {
    *field = substitute(field, ctx)?.value;
    Ok(())
}

fn substitute_job(job: &mut Job, ctx: &SubstitutionContext) -> Result<()> {
    if let Some(image) = job.image.as_mut() {
        substitute_field(image, ctx)?;
    }
    if let Some(shell) = job.shell.as_mut() {
        substitute_field(shell, ctx)?;
    }
    if let Some(exec) = job.exec.as_mut() {
        for arg in exec.iter_mut() {
            substitute_field(arg, ctx)?;
        }
    }
    for input in job.inputs.iter_mut() {
        substitute_field(input, ctx)?;
    }
    for output in job.outputs.iter_mut() {
        substitute_field(output, ctx)?;
    }
    for value in job.env.values_mut() {
        substitute_field(value, ctx)?;
    }
    if let Some(workdir) = job.workdir.as_mut() {
        substitute_field(workdir, ctx)?;
    }
    Ok(())
}

fn resolve(mut raw: RawConfig, git: GitInfo) -> Result<Config> {
    let env = render_env(&raw.env, &git);
    let secrets = render_secrets(&raw.secrets);

    // Merge implicit dependencies discovered through job references
    // before ordering, so the sort and the fingerprints both see them.
    let names: Vec<String> = raw.jobs.iter().map(|job| job.name.clone()).collect();
    for job in raw.jobs.iter_mut() {
        let mut refs = Vec::new();
        for field in job_strings(job) {
            refs.extend(scan_job_refs(field));
        }
        for reference in refs {
            if !names.contains(&reference) {
                return Err(HoneError::config(format!(
                    "Job {} references unknown job {reference}.",
                    job.name
                )));
            }
            job.add_dep(&reference);
        }
    }

    let order = topological_order(&raw.jobs)?;

    let mut ctx = SubstitutionContext {
        env: env.clone(),
        secrets: secrets.clone(),
        job_outputs: IndexMap::new(),
    };
    for index in order {
        let job = &mut raw.jobs[index];
        substitute_job(job, &ctx)?;
        ctx.job_outputs.insert(job.name.clone(), job.outputs.clone());
    }

    for job in &raw.jobs {
        job.validate(raw.engine)?;
    }

    // Cache credentials and reporting entries may draw on secrets too.
    if let Some(s3) = raw.cache.s3.as_mut() {
        substitute_field(&mut s3.bucket, &ctx)?;
        substitute_field(&mut s3.endpoint, &ctx)?;
        substitute_field(&mut s3.access_key, &ctx)?;
        substitute_field(&mut s3.secret_key, &ctx)?;
    }
    for scm in raw.scm.iter_mut() {
        if let Some(token) = scm.token.as_mut() {
            substitute_field(token, &ctx)?;
        }
        if let Some(url) = scm.url.as_mut() {
            substitute_field(url, &ctx)?;
        }
        if let Some(repo) = scm.repo.as_mut() {
            substitute_field(repo, &ctx)?;
        }
    }

    Ok(Config {
        env,
        secrets,
        scm: raw.scm,
        jobs: raw.jobs.into_iter().map(Arc::new).collect(),
        cache: raw.cache,
        kubernetes: raw.kubernetes,
        engine: raw.engine,
    })
}
