//! Logging and observability
//!
//! Structured logging through `tracing`. Job output is re-emitted line by
//! line with `job` and `stdout`/`stderr` fields so the console can be
//! grepped per job; when a remote log buffer is supplied, a JSON copy of
//! every event accumulates there for upload at the end of the build.

use crate::graph::JobCallback;
use crate::job::Job;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Shared in-memory buffer receiving the JSON log stream.
pub type LogBuffer = Arc<Mutex<Vec<u8>>>;

#[derive(Clone)]
struct BufferWriter(LogBuffer);

impl Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Initialize the logging system. Safe to call more than once; later calls
/// are no-ops.
pub fn init(remote_log: Option<LogBuffer>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_layer = remote_log.map(|buffer| {
        fmt::layer()
            .json()
            .with_writer(move || BufferWriter(buffer.clone()))
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(json_layer)
        .with(filter)
        .try_init()
        .ok();

    Ok(())
}

/// Which stream of the underlying process a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Re-emit one line of job output.
pub fn job_line(job: &str, stream: StreamKind, line: &str) {
    match stream {
        StreamKind::Stdout => info!(job = %job, stdout = true, "{}", line),
        StreamKind::Stderr => warn!(job = %job, stderr = true, "{}", line),
    }
}

/// Outermost decorator: start and end lines around every job, padded to
/// the longest name in the build for column alignment.
pub fn with_logging(pad: usize, inner: JobCallback) -> JobCallback {
    JobCallback::new(move |job: Arc<Job>| {
        let inner = inner.clone();
        Box::pin(async move {
            let padded = format!("{:<pad$}", job.name);
            info!(job = %padded, "Running job \"{}\".", job.name);

            let result = inner.run(job.clone()).await;
            match &result {
                Ok(()) => {
                    info!(job = %padded, success = true, "Job \"{}\" completed!", job.name);
                }
                Err(err) => {
                    error!(job = %padded, "Job \"{}\" errored: {err}.", job.name);
                }
            }
            result
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_logging_passes_result_through() {
        let ok = with_logging(
            8,
            JobCallback::new(|_| Box::pin(async { Ok(()) })),
        );
        let failing = with_logging(
            8,
            JobCallback::new(|_| {
                Box::pin(async { Err(crate::errors::HoneError::executor("exit status 1")) })
            }),
        );

        let job: Arc<Job> =
            Arc::new(json5::from_str(r#"{ name: "x", image: "a", shell: "true" }"#).unwrap());
        assert!(ok.run(job.clone()).await.is_ok());
        assert!(failing.run(job).await.is_err());
    }

    #[test]
    fn test_buffer_writer_accumulates() {
        let buffer: LogBuffer = Arc::new(Mutex::new(Vec::new()));
        let mut writer = BufferWriter(buffer.clone());
        writer.write_all(b"one\n").unwrap();
        writer.write_all(b"two\n").unwrap();
        assert_eq!(&*buffer.lock().unwrap(), b"one\ntwo\n");
    }
}
