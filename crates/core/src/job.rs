//! Job model
//!
//! A job is the unit of work scheduled by the graph: immutable declaration
//! fields set by the parser, plus runtime-only state mutated as execution
//! proceeds. Runtime state never participates in fingerprinting.

use crate::errors::{HoneError, Result};
use crc::{Algorithm, Crc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// CRC-32 table matching the node identities of existing caches and builds
/// (reflected form of polynomial 0xD5828281).
const NODE_ID_ALGORITHM: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x814141ab,
    init: 0xffffffff,
    refin: true,
    refout: true,
    xorout: 0xffffffff,
    check: 0x00000000,
    residue: 0x00000000,
};

/// Stable in-process identity for a job name.
pub fn node_id(name: &str) -> u32 {
    Crc::<u32>::new(&NODE_ID_ALGORITHM).checksum(name.as_bytes())
}

/// Execution engine for a job or a whole build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Local,
    Docker,
    Kubernetes,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Docker => "docker",
            Self::Kubernetes => "kubernetes",
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime-only job state, populated as execution proceeds.
///
/// Mutation is confined to the job's own task; the mutex exists so the
/// report can snapshot concurrently-finishing jobs.
#[derive(Debug, Default)]
pub struct JobState {
    /// Fingerprint hex, once computed
    pub hash: Option<String>,
    /// Whether the job was restored from cache instead of executed
    pub cached: bool,
    /// Terminal error message, if any
    pub error: Option<String>,
    /// Content hash per declared output, populated on cache fill
    pub output_hashes: BTreeMap<String, String>,
    /// Executor-specific handle (container id, pod name)
    pub runtime_id: Option<String>,
    /// Build-wide stop broadcast, installed by the graph before spawning
    pub stop: Option<broadcast::Sender<()>>,
    /// Background branch of a detached service
    pub detached: Option<JoinHandle<()>>,
}

/// A single unit of work
#[derive(Debug, Deserialize)]
pub struct Job {
    pub name: String,

    /// Container image reference; required unless the engine is local
    #[serde(default)]
    pub image: Option<String>,

    /// Shell command, run under `/bin/sh -cex`. Mutually exclusive with `exec`.
    #[serde(default)]
    pub shell: Option<String>,

    /// Explicit argv vector. Mutually exclusive with `shell`.
    #[serde(default)]
    pub exec: Option<Vec<String>>,

    /// File paths or doublestar globs hashed into the fingerprint
    #[serde(default)]
    pub inputs: Vec<String>,

    /// File paths produced by the job, captured into the cache
    #[serde(default)]
    pub outputs: Vec<String>,

    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Explicit dependencies; implicit ones are merged in by the parser
    #[serde(default)]
    pub deps: BTreeSet<String>,

    /// Engine override; empty inherits the build default
    #[serde(default)]
    pub engine: Option<Engine>,

    /// Predicate over the build environment; job skipped when false
    #[serde(default)]
    pub condition: Option<String>,

    #[serde(default)]
    pub privileged: bool,

    #[serde(default)]
    pub workdir: Option<String>,

    /// Long-running job: detaches once started, stopped at build teardown
    #[serde(default)]
    pub service: bool,

    #[serde(skip)]
    pub state: Mutex<JobState>,
}

impl Job {
    pub fn id(&self) -> u32 {
        node_id(&self.name)
    }

    /// The argv actually launched in the execution environment.
    pub fn shell_or_exec(&self) -> Vec<String> {
        if let Some(shell) = &self.shell {
            vec![
                "/bin/sh".to_string(),
                "-cex".to_string(),
                shell.to_string(),
            ]
        } else {
            self.exec.clone().unwrap_or_default()
        }
    }

    /// Engine resolution: job override, then build default, then docker.
    pub fn engine_for(&self, build_default: Option<Engine>) -> Engine {
        self.engine.or(build_default).unwrap_or(Engine::Docker)
    }

    /// Add a dependency edge discovered by the parser. Self-dependencies
    /// are ignored; the set deduplicates repeats.
    pub fn add_dep(&mut self, dep: &str) {
        if dep != self.name {
            self.deps.insert(dep.to_string());
        }
    }

    /// Declaration validation, fatal at start.
    pub fn validate(&self, build_default: Option<Engine>) -> Result<()> {
        match (&self.shell, &self.exec) {
            (Some(_), Some(_)) => {
                return Err(HoneError::config(format!(
                    "Job {}: shell and exec are mutually exclusive.",
                    self.name
                )));
            }
            (None, None) => {
                return Err(HoneError::config(format!(
                    "Job {}: one of shell or exec is required.",
                    self.name
                )));
            }
            _ => {}
        }

        if self.image.is_none() && self.engine_for(build_default) != Engine::Local {
            return Err(HoneError::config(format!(
                "Job {}: image is required unless the engine is local.",
                self.name
            )));
        }

        Ok(())
    }

    pub fn set_hash(&self, hash: String) {
        self.state.lock().unwrap().hash = Some(hash);
    }

    pub fn hash(&self) -> Option<String> {
        self.state.lock().unwrap().hash.clone()
    }

    pub fn set_cached(&self) {
        self.state.lock().unwrap().cached = true;
    }

    pub fn cached(&self) -> bool {
        self.state.lock().unwrap().cached
    }

    pub fn set_error(&self, message: impl Into<String>) {
        self.state.lock().unwrap().error = Some(message.into());
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().unwrap().error.clone()
    }

    pub fn set_output_hashes(&self, hashes: BTreeMap<String, String>) {
        self.state.lock().unwrap().output_hashes = hashes;
    }

    pub fn set_runtime_id(&self, id: impl Into<String>) {
        self.state.lock().unwrap().runtime_id = Some(id.into());
    }

    pub fn runtime_id(&self) -> Option<String> {
        self.state.lock().unwrap().runtime_id.clone()
    }

    pub fn set_stop_channel(&self, stop: broadcast::Sender<()>) {
        self.state.lock().unwrap().stop = Some(stop);
    }

    pub fn stop_channel(&self) -> Option<broadcast::Sender<()>> {
        self.state.lock().unwrap().stop.clone()
    }

    /// Park the background branch of a detached service; collected by the
    /// graph once all non-service tasks have joined.
    pub fn detach(&self, handle: JoinHandle<()>) {
        self.state.lock().unwrap().detached = Some(handle);
    }

    pub fn take_detached(&self) -> Option<JoinHandle<()>> {
        self.state.lock().unwrap().detached.take()
    }

    /// Snapshot into the stable public report shape.
    pub fn report(&self) -> JobReport {
        let state = self.state.lock().unwrap();
        JobReport {
            name: self.name.clone(),
            image: self.image.clone().unwrap_or_default(),
            shell: self.shell_or_exec(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            deps: self.deps.iter().cloned().collect(),
            engine: self.engine.map(|e| e.to_string()).unwrap_or_default(),
            condition: self.condition.clone().unwrap_or_default(),
            privileged: self.privileged,
            service: self.service,
            successful: state.error.is_none(),
            error: state.error.clone().unwrap_or_default(),
            cached: state.cached,
            hash: state.hash.clone().unwrap_or_default(),
            output_hashes: state.output_hashes.clone(),
        }
    }
}

/// Job as serialized into the build report. Field names are a public,
/// stable surface consumed by report sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub name: String,
    pub image: String,
    pub shell: Vec<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub deps: Vec<String>,
    pub engine: String,
    pub condition: String,
    pub privileged: bool,
    pub service: bool,
    pub successful: bool,
    pub error: String,
    pub cached: bool,
    pub hash: String,
    #[serde(rename = "outputHashes")]
    pub output_hashes: BTreeMap<String, String>,
}
