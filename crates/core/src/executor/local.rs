//! Local process executor
//!
//! Runs the job's command as a child process of the driver, overlaying the
//! job's environment and teeing stdout/stderr into the log sink.

use crate::errors::{HoneError, Result};
use crate::executor::Executor;
use crate::job::Job;
use crate::logging::{job_line, StreamKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

struct RunningProcess {
    child: Child,
    forwarders: Vec<JoinHandle<()>>,
}

#[derive(Default)]
pub struct LocalExecutor {
    running: Mutex<HashMap<String, RunningProcess>>,
}

fn forward_lines<R>(job: String, stream: StreamKind, reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            job_line(&job, stream, &line);
        }
    })
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn start(&self, job: &Job) -> Result<()> {
        let argv = job.shell_or_exec();
        if argv.is_empty() {
            return Err(HoneError::executor(format!(
                "Job {} has no command to run.",
                job.name
            )));
        }

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .envs(job.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(workdir) = &job.workdir {
            command.current_dir(workdir);
        }

        let mut child = command.spawn().map_err(|e| {
            HoneError::executor(format!("Job {}: spawning {}: {e}", job.name, argv[0]))
        })?;

        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(forward_lines(job.name.clone(), StreamKind::Stdout, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward_lines(job.name.clone(), StreamKind::Stderr, stderr));
        }

        self.running
            .lock()
            .unwrap()
            .insert(job.name.clone(), RunningProcess { child, forwarders });

        Ok(())
    }

    async fn wait(&self, job: &Job) -> Result<()> {
        let process = self.running.lock().unwrap().remove(&job.name);
        let Some(mut process) = process else {
            return Err(HoneError::executor(format!(
                "Job {} is not running.",
                job.name
            )));
        };

        let status = process
            .child
            .wait()
            .await
            .map_err(|e| HoneError::executor(format!("Job {}: waiting: {e}", job.name)))?;

        for forwarder in process.forwarders {
            let _ = forwarder.await;
        }

        if status.success() {
            Ok(())
        } else {
            Err(HoneError::executor(format!(
                "Job {}: process exited with {status}.",
                job.name
            )))
        }
    }

    async fn stop(&self, job: &Job) -> Result<()> {
        let process = self.running.lock().unwrap().remove(&job.name);
        if let Some(mut process) = process {
            let _ = process.child.kill().await;
            for forwarder in process.forwarders {
                let _ = forwarder.await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn local_job(source: &str) -> Arc<Job> {
        Arc::new(json5::from_str(source).unwrap())
    }

    #[tokio::test]
    async fn test_successful_command() {
        let executor = LocalExecutor::new();
        let job = local_job(r#"{ name: "ok", shell: "true", engine: "local" }"#);

        executor.start(&job).await.unwrap();
        executor.wait(&job).await.unwrap();
        executor.stop(&job).await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let executor = LocalExecutor::new();
        let job = local_job(r#"{ name: "bad", shell: "exit 3", engine: "local" }"#);

        executor.start(&job).await.unwrap();
        let err = executor.wait(&job).await.unwrap_err();
        assert!(err.to_string().contains("bad"), "{err}");
        executor.stop(&job).await.unwrap();
    }

    #[tokio::test]
    async fn test_env_reaches_process() {
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let out = dir.path().join("env.txt");
        let executor = LocalExecutor::new();
        let job = local_job(&format!(
            r#"{{ name: "env", shell: "printf %s \"$GREETING\" > {}",
                 env: {{ GREETING: "hello" }}, engine: "local" }}"#,
            out.display()
        ));

        executor.start(&job).await.unwrap();
        executor.wait(&job).await.unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_stop_kills_lingering_service() {
        let executor = LocalExecutor::new();
        let job = local_job(r#"{ name: "svc", shell: "sleep 30", engine: "local", service: true }"#);

        executor.start(&job).await.unwrap();
        executor.stop(&job).await.unwrap();
        // The process table entry is gone; a second stop is a no-op.
        executor.stop(&job).await.unwrap();
    }
}
