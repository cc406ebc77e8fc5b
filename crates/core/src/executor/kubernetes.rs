//! Remote pod executor
//!
//! Jobs run in a cluster pod instead of a local container. Inputs are
//! staged through the remote cache (`srcs` / `srcs_manifests`), and a
//! shim binary copied in by an init container rehydrates them before the
//! user command runs, then captures declared outputs back into the cache.
//! The driver restores those outputs locally once the pod terminates.

use crate::cache::{restore_entry, Cache};
use crate::errors::{HoneError, Result};
use crate::executor::Executor;
use crate::fingerprint::{collect_inputs, fingerprint};
use crate::job::Job;
use crate::logging::{job_line, StreamKind};
use async_trait::async_trait;
use futures_util::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::api::{Api, DeleteParams, LogParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_NAMESPACE: &str = "default";

/// Image carrying the prebuilt shim binary and a CA bundle, copied into
/// the shared volume by the init container.
const DEFAULT_SHIM_IMAGE: &str = "honebuild/hone:latest";

/// `kubernetes` section of the Honefile
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    #[serde(default)]
    pub shim_image: Option<String>,
}

pub struct KubernetesExecutor {
    client: Client,
    namespace: String,
    shim_image: String,
    cache: Arc<dyn Cache>,
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

impl KubernetesExecutor {
    pub async fn connect(config: &KubernetesConfig, cache: Arc<dyn Cache>) -> Result<Self> {
        let kube_config = match &config.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    HoneError::executor(format!("reading kubeconfig {}: {e}", path.display()))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| HoneError::executor(format!("loading kubeconfig: {e}")))?
            }
            None => Config::infer()
                .await
                .map_err(|e| HoneError::executor(format!("inferring cluster config: {e}")))?,
        };

        let client = Client::try_from(kube_config)
            .map_err(|e| HoneError::executor(format!("building cluster client: {e}")))?;

        Ok(Self {
            client,
            namespace: config
                .namespace
                .clone()
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            shim_image: config
                .shim_image
                .clone()
                .unwrap_or_else(|| DEFAULT_SHIM_IMAGE.to_string()),
            cache,
        })
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secret_name(job: &Job) -> String {
        format!("hone-{}", job.name)
    }

    fn cache_key(&self, job: &Job) -> Result<String> {
        match job.hash() {
            Some(key) => Ok(key),
            None => {
                let key = fingerprint(job)?;
                job.set_hash(key.clone());
                Ok(key)
            }
        }
    }

    /// Stage every input file into the remote cache so the shim can pull
    /// them down inside the pod.
    async fn upload_inputs(&self, job: &Job, key: &str) -> Result<()> {
        let mut entries = Vec::new();
        for path in collect_inputs(job)? {
            entries.push(self.cache.set("srcs", &path).await?);
        }
        self.cache.dump_manifest("srcs_manifests", key, &entries).await?;
        debug!(job = %job.name, files = entries.len(), "Staged inputs for remote execution.");
        Ok(())
    }

    fn pod_manifest(&self, job: &Job, key: &str) -> Result<Pod> {
        let mut env = vec![
            serde_json::json!({"name": "CACHE_KEY", "value": key}),
            serde_json::json!({
                "name": "OUTPUTS",
                "value": serde_json::to_string(&job.outputs).unwrap_or_default(),
            }),
            serde_json::json!({"name": "CA_FILE", "value": "/build/ca.crt"}),
        ];
        for name in self.cache.env().keys() {
            env.push(serde_json::json!({
                "name": name,
                "valueFrom": {"secretKeyRef": {"name": Self::secret_name(job), "key": name}},
            }));
        }
        for (name, value) in &job.env {
            env.push(serde_json::json!({"name": name, "value": value}));
        }

        let mut command = vec!["/build/cache-shim".to_string()];
        command.extend(job.shell_or_exec());

        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": job.name,
                "namespace": self.namespace,
                "labels": {"hone/job": job.name},
            },
            "spec": {
                "restartPolicy": "Never",
                "volumes": [{"name": "build", "emptyDir": {"medium": "Memory"}}],
                "initContainers": [{
                    "name": "shim",
                    "image": self.shim_image,
                    "command": [
                        "/bin/sh", "-ce",
                        "cp /usr/local/bin/cache-shim /build/cache-shim && \
                         cp /etc/ssl/certs/ca-certificates.crt /build/ca.crt",
                    ],
                    "volumeMounts": [{"name": "build", "mountPath": "/build"}],
                }],
                "containers": [{
                    "name": job.name,
                    "image": job.image,
                    "imagePullPolicy": "IfNotPresent",
                    "command": command,
                    "workingDir": job.workdir.clone().unwrap_or_else(|| "/build".to_string()),
                    "env": env,
                    "volumeMounts": [{"name": "build", "mountPath": "/build"}],
                    "securityContext": {"privileged": job.privileged},
                }],
            },
        }))
        .map_err(|e| HoneError::executor(format!("Job {}: building pod: {e}", job.name)))
    }

    async fn pod_phase(&self, job: &Job) -> Result<(String, Option<i32>, bool)> {
        let pod = self
            .pods()
            .get(&job.name)
            .await
            .map_err(|e| HoneError::executor(format!("Job {}: reading pod: {e}", job.name)))?;

        let status = pod.status.unwrap_or_default();
        let phase = status.phase.unwrap_or_default();

        let mut initializing = false;
        let mut exit_code = None;
        if let Some(container) = status.container_statuses.unwrap_or_default().first() {
            if let Some(state) = &container.state {
                if let Some(waiting) = &state.waiting {
                    initializing = waiting.reason.as_deref() == Some("PodInitializing");
                }
                if let Some(terminated) = &state.terminated {
                    exit_code = Some(terminated.exit_code);
                }
            }
        }

        Ok((phase, exit_code, initializing))
    }

    /// Pull the outputs the shim captured back into the working tree.
    async fn restore_outputs(&self, job: &Job, key: &str) -> Result<()> {
        if let Some(manifest) = self.cache.load_manifest("out", key).await? {
            for entry in &manifest {
                restore_entry(self.cache.as_ref(), entry).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for KubernetesExecutor {
    async fn start(&self, job: &Job) -> Result<()> {
        let key = self.cache_key(job)?;
        self.upload_inputs(job, &key).await?;

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret: Secret = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": Self::secret_name(job), "namespace": self.namespace},
            "stringData": self.cache.env(),
        }))
        .map_err(|e| HoneError::executor(format!("Job {}: building secret: {e}", job.name)))?;
        secrets
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|e| HoneError::executor(format!("Job {}: creating secret: {e}", job.name)))?;

        // Headless service so dependents resolve the job by name.
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let service: Service = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": job.name, "namespace": self.namespace},
            "spec": {
                "clusterIP": "None",
                "selector": {"hone/job": job.name},
            },
        }))
        .map_err(|e| HoneError::executor(format!("Job {}: building service: {e}", job.name)))?;
        services
            .create(&PostParams::default(), &service)
            .await
            .map_err(|e| HoneError::executor(format!("Job {}: creating service: {e}", job.name)))?;

        let pod = self.pod_manifest(job, &key)?;
        self.pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| HoneError::executor(format!("Job {}: creating pod: {e}", job.name)))?;

        job.set_runtime_id(job.name.clone());

        // The job counts as started once the pod leaves the scheduling and
        // init phases.
        loop {
            let (phase, _, initializing) = self.pod_phase(job).await?;
            if phase != "Pending" && !initializing {
                debug!(job = %job.name, phase = %phase, "Pod is up.");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn wait(&self, job: &Job) -> Result<()> {
        let key = self.cache_key(job)?;

        let log_stream = self
            .pods()
            .log_stream(
                &job.name,
                &LogParams {
                    follow: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| HoneError::executor(format!("Job {}: streaming logs: {e}", job.name)))?;

        let mut lines = log_stream.lines();
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => job_line(&job.name, StreamKind::Stdout, &line),
                Err(_) => break,
            }
        }

        let exit_code = loop {
            let (phase, exit_code, _) = self.pod_phase(job).await?;
            match (phase.as_str(), exit_code) {
                ("Succeeded" | "Failed", Some(code)) => break code,
                ("Succeeded", None) => break 0,
                _ => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        };

        // Pod teardown kills detached services with SIGKILL; 128 is their
        // normal exit.
        if exit_code != 0 && !(job.service && exit_code == 128) {
            return Err(HoneError::executor(format!(
                "Job {}: pod exited with error: {exit_code}",
                job.name
            )));
        }

        self.restore_outputs(job, &key).await
    }

    async fn stop(&self, job: &Job) -> Result<()> {
        let params = DeleteParams::default();

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        if let Err(err) = secrets.delete(&Self::secret_name(job), &params).await {
            if !is_not_found(&err) {
                warn!(job = %job.name, "Deleting secret failed: {err}");
            }
        }

        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        if let Err(err) = services.delete(&job.name, &params).await {
            if !is_not_found(&err) {
                warn!(job = %job.name, "Deleting service failed: {err}");
            }
        }

        if let Err(err) = self.pods().delete(&job.name, &params).await {
            if !is_not_found(&err) {
                warn!(job = %job.name, "Deleting pod failed: {err}");
            }
        }

        Ok(())
    }
}
