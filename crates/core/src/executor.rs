//! Execution engines
//!
//! Every engine satisfies the same `init / start / wait / stop` contract;
//! the runtime picks one per job (job override, then build default, then
//! docker) and drives it. `stop` is always invoked, even after a failed
//! start, so half-created containers and pods are cleaned up.

use crate::errors::{HoneError, Result};
use crate::graph::JobCallback;
use crate::job::{Engine, Job};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

pub mod docker;
pub mod kubernetes;
pub mod local;

pub use docker::DockerExecutor;
pub use kubernetes::{KubernetesConfig, KubernetesExecutor};
pub use local::LocalExecutor;

#[async_trait]
pub trait Executor: Send + Sync {
    /// One-time setup shared by every job on this engine.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Launch the job, returning once it is running (or scheduled).
    async fn start(&self, job: &Job) -> Result<()>;

    /// Block until completion, streaming output to the log sink.
    async fn wait(&self, job: &Job) -> Result<()>;

    /// Cleanup; idempotent and always invoked.
    async fn stop(&self, job: &Job) -> Result<()>;
}

/// Process-wide execution state threaded through the callback stack: the
/// per-engine executors plus the build default.
pub struct Runtime {
    default_engine: Option<Engine>,
    local: Arc<LocalExecutor>,
    docker: OnceCell<Arc<DockerExecutor>>,
    kubernetes: Option<Arc<KubernetesExecutor>>,
}

impl Runtime {
    pub fn new(default_engine: Option<Engine>, kubernetes: Option<Arc<KubernetesExecutor>>) -> Self {
        Self {
            default_engine,
            local: Arc::new(LocalExecutor::new()),
            docker: OnceCell::new(),
            kubernetes,
        }
    }

    async fn executor_for(&self, job: &Job) -> Result<Arc<dyn Executor>> {
        match job.engine_for(self.default_engine) {
            Engine::Local => Ok(self.local.clone() as Arc<dyn Executor>),
            Engine::Docker => {
                let docker = self
                    .docker
                    .get_or_try_init(|| async {
                        let executor = Arc::new(DockerExecutor::connect()?);
                        executor.init().await?;
                        Ok::<_, HoneError>(executor)
                    })
                    .await?;
                Ok(docker.clone() as Arc<dyn Executor>)
            }
            Engine::Kubernetes => self
                .kubernetes
                .clone()
                .map(|k| k as Arc<dyn Executor>)
                .ok_or_else(|| {
                    HoneError::config(
                        "Kubernetes is not currently supported without an S3 configuration.",
                    )
                }),
        }
    }

    /// Run one job through its executor. Non-service jobs run
    /// start -> wait -> stop; services detach after start and keep a
    /// background branch alive until the global stop fires.
    pub async fn run_job(&self, job: Arc<Job>) -> Result<()> {
        let executor = self.executor_for(&job).await?;

        if job.service {
            executor.start(&job).await?;

            let mut stop_rx = job.stop_channel().map(|stop| stop.subscribe());
            let service_job = job.clone();
            let service_executor = executor.clone();
            let handle = tokio::spawn(async move {
                let lifetime = service_executor.wait(&service_job);
                match stop_rx.as_mut() {
                    Some(stop) => {
                        tokio::select! {
                            result = lifetime => {
                                if let Err(err) = result {
                                    service_job.set_error(err.to_string());
                                    error!(job = %service_job.name, "Service exited: {err}");
                                }
                            }
                            _ = stop.recv() => {}
                        }
                    }
                    None => {
                        if let Err(err) = lifetime.await {
                            service_job.set_error(err.to_string());
                            error!(job = %service_job.name, "Service exited: {err}");
                        }
                    }
                }

                if let Err(err) = service_executor.stop(&service_job).await {
                    warn!(job = %service_job.name, "Stopping service failed: {err}");
                }
            });

            job.detach(handle);
            info!(job = %job.name, "Service started, detaching.");
            return Ok(());
        }

        let result = match executor.start(&job).await {
            Ok(()) => executor.wait(&job).await,
            Err(err) => Err(err),
        };

        if let Err(err) = executor.stop(&job).await {
            warn!(job = %job.name, "Cleanup failed: {err}");
        }

        result
    }

    /// Tear down engine-wide resources (the container network).
    pub async fn shutdown(&self) {
        if let Some(docker) = self.docker.get() {
            docker.teardown().await;
        }
    }
}

/// The innermost callback of the stack: choose an engine and run the job.
pub fn dispatch_engine(runtime: Arc<Runtime>) -> JobCallback {
    JobCallback::new(move |job: Arc<Job>| {
        let runtime = runtime.clone();
        Box::pin(async move { runtime.run_job(job).await })
    })
}
