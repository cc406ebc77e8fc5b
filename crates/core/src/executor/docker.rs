//! Container executor
//!
//! Drives a local container daemon: pulls the job image when missing,
//! creates the container with the working tree bind-mounted at `/build`,
//! attaches it to the per-build `hone` network under its job-name alias
//! (so service jobs are DNS-addressable), and streams the demultiplexed
//! output into the log sink.

use crate::errors::{HoneError, Result};
use crate::executor::Executor;
use crate::job::Job;
use crate::logging::{job_line, StreamKind};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, NetworkingConfig,
    RemoveContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::debug;

/// Per-build network shared by every container of the build.
const NETWORK: &str = "hone";

/// Seconds a container gets to exit cleanly before it is killed.
const STOP_TIMEOUT: i64 = 5;

pub struct DockerExecutor {
    client: Docker,
}

fn emit_output(job: &str, output: LogOutput) {
    let (stream, message) = match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            (StreamKind::Stdout, message)
        }
        LogOutput::StdErr { message } => (StreamKind::Stderr, message),
        LogOutput::StdIn { .. } => return,
    };

    let text = String::from_utf8_lossy(&message);
    for line in text.split('\n') {
        if !line.is_empty() {
            job_line(job, stream, line);
        }
    }
}

impl DockerExecutor {
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| HoneError::executor(format!("connecting to container daemon: {e}")))?;
        Ok(Self { client })
    }

    /// Remove the build network; errors are irrelevant at teardown.
    pub async fn teardown(&self) {
        let _ = self.client.remove_network(NETWORK).await;
    }

    async fn ensure_image(&self, job: &Job, image: &str) -> Result<()> {
        match self.client.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => {
                return Err(HoneError::executor(format!(
                    "Job {}: inspecting image {image}: {e}",
                    job.name
                )));
            }
        }

        debug!(job = %job.name, image = %image, "Pulling image.");
        let mut pull = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| {
                HoneError::executor(format!("Job {}: pulling {image}: {e}", job.name))
            })?;
        }

        Ok(())
    }

    async fn create_container(&self, job: &Job) -> Result<String> {
        let cwd = std::env::current_dir().map_err(|e| {
            HoneError::executor(format!("resolving working directory: {e}"))
        })?;

        let env: Vec<String> = job
            .env
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();

        let endpoints = HashMap::from([(
            NETWORK.to_string(),
            EndpointSettings {
                aliases: Some(vec![job.name.clone()]),
                ..Default::default()
            },
        )]);

        let config = Config {
            image: job.image.clone(),
            entrypoint: Some(job.shell_or_exec()),
            env: Some(env),
            working_dir: Some(job.workdir.clone().unwrap_or_else(|| "/build".to_string())),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:/build", cwd.display())]),
                privileged: Some(job.privileged),
                network_mode: Some(NETWORK.to_string()),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: job.name.clone(),
            ..Default::default()
        };

        let created = match self
            .client
            .create_container(Some(options.clone()), config.clone())
            .await
        {
            Ok(created) => created,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                // A container of the same name survived an earlier run.
                let _ = self
                    .client
                    .remove_container(
                        &job.name,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await;
                self.client
                    .create_container(Some(options), config)
                    .await
                    .map_err(|e| {
                        HoneError::executor(format!("Job {}: creating container: {e}", job.name))
                    })?
            }
            Err(e) => {
                return Err(HoneError::executor(format!(
                    "Job {}: creating container: {e}",
                    job.name
                )));
            }
        };

        Ok(created.id)
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    async fn init(&self) -> Result<()> {
        match self
            .client
            .create_network(CreateNetworkOptions {
                name: NETWORK.to_string(),
                check_duplicate: true,
                ..Default::default()
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(HoneError::executor(format!(
                "creating network {NETWORK}: {e}"
            ))),
        }
    }

    async fn start(&self, job: &Job) -> Result<()> {
        let image = job.image.as_deref().ok_or_else(|| {
            HoneError::executor(format!("Job {} has no image.", job.name))
        })?;

        self.ensure_image(job, image).await?;

        let id = self.create_container(job).await?;
        self.client
            .start_container::<String>(&id, None)
            .await
            .map_err(|e| {
                HoneError::executor(format!("Job {}: starting container: {e}", job.name))
            })?;

        debug!(job = %job.name, container = %id, "Started container.");
        job.set_runtime_id(id);
        Ok(())
    }

    async fn wait(&self, job: &Job) -> Result<()> {
        let id = job.runtime_id().ok_or_else(|| {
            HoneError::executor(format!("Job {} has no container.", job.name))
        })?;

        let job_name = job.name.clone();
        let mut logs = self.client.logs(
            &id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        let forwarder = tokio::spawn(async move {
            while let Some(output) = logs.next().await {
                match output {
                    Ok(output) => emit_output(&job_name, output),
                    Err(_) => break,
                }
            }
        });

        let mut wait = self
            .client
            .wait_container(&id, None::<WaitContainerOptions<String>>);
        let status_code = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => {
                forwarder.abort();
                return Err(HoneError::executor(format!(
                    "Job {}: waiting for container: {e}",
                    job.name
                )));
            }
            None => {
                forwarder.abort();
                return Err(HoneError::executor(format!(
                    "Job {}: container wait ended unexpectedly.",
                    job.name
                )));
            }
        };

        let _ = forwarder.await;

        // A stopped service takes SIGKILL from the network teardown path;
        // 128 is its normal exit.
        if status_code == 0 || (job.service && status_code == 128) {
            Ok(())
        } else {
            Err(HoneError::executor(format!(
                "Job {}: container exited with code {status_code}.",
                job.name
            )))
        }
    }

    async fn stop(&self, job: &Job) -> Result<()> {
        let Some(id) = job.runtime_id() else {
            return Ok(());
        };

        let _ = self
            .client
            .stop_container(&id, Some(StopContainerOptions { t: STOP_TIMEOUT }))
            .await;
        let _ = self
            .client
            .remove_container(
                &id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        Ok(())
    }
}
