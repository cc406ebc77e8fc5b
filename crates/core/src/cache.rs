//! Content-addressed cache layer
//!
//! Artifacts are stored under a namespace by their content hash; a manifest
//! keyed by a job's fingerprint lists the artifacts the job produced. The
//! `with_cache` decorator turns any backend into a transparent layer around
//! a job callback, and layering two decorators (local over remote) yields a
//! tiered cache: a hit at either tier terminates the chain and writes
//! propagate remote-first.

use crate::errors::{HoneError, Result};
use crate::fingerprint::{fingerprint, hash_file};
use crate::graph::JobCallback;
use crate::job::Job;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tracing::{debug, info};

pub mod file;
pub mod s3;

pub use file::{FileCache, FileCacheConfig};
pub use s3::{S3Cache, S3Config};

/// One cached artifact. Serialized field names are the manifest wire
/// format shared with existing caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CacheEntry {
    pub filename: String,
    pub hash: String,
    pub file_mode: u32,
}

/// A streaming upload into the cache plus the public URL it will be
/// reachable at. Backends that upload in the background hand out a
/// completion handle; callers that need durability await it after
/// shutting the sink down.
pub struct CacheWriter {
    pub sink: Box<dyn AsyncWrite + Send + Unpin>,
    pub public_url: String,
    pub completion: Option<tokio::task::JoinHandle<()>>,
}

impl CacheWriter {
    /// Finish the upload: flush and close the sink, then wait for any
    /// background transfer to settle.
    pub async fn finish(mut self) -> Result<String> {
        use tokio::io::AsyncWriteExt;

        self.sink
            .shutdown()
            .await
            .map_err(|e| HoneError::cache(format!("closing upload of {}: {e}", self.public_url)))?;
        if let Some(completion) = self.completion {
            let _ = completion.await;
        }
        Ok(self.public_url)
    }
}

/// Storage backend contract
#[async_trait]
pub trait Cache: Send + Sync {
    fn name(&self) -> &'static str;

    /// Env vars a remote execution environment needs to reach this cache.
    fn env(&self) -> IndexMap<String, String> {
        IndexMap::new()
    }

    fn enabled(&self) -> bool {
        true
    }

    fn base_url(&self) -> String;

    /// Download the blob named by `entry.hash` into `entry.filename`.
    async fn get(&self, namespace: &str, entry: &CacheEntry) -> Result<()>;

    /// Upload a file keyed by its content hash.
    async fn set(&self, namespace: &str, path: &Path) -> Result<CacheEntry>;

    /// Fetch a manifest; `None` is a miss.
    async fn load_manifest(&self, namespace: &str, key: &str) -> Result<Option<Vec<CacheEntry>>>;

    async fn dump_manifest(&self, namespace: &str, key: &str, entries: &[CacheEntry])
        -> Result<()>;

    /// Open a streaming upload under `<namespace>/<path>`.
    async fn writer(&self, namespace: &str, path: &str) -> Result<CacheWriter>;
}

#[cfg(unix)]
pub(crate) fn file_mode(path: &Path) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = std::fs::metadata(path)
        .map_err(|e| HoneError::cache(format!("reading mode of {}: {e}", path.display())))?;
    Ok(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
pub(crate) fn file_mode(_path: &Path) -> Result<u32> {
    Ok(0o644)
}

#[cfg(unix)]
pub(crate) fn restore_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| HoneError::cache(format!("restoring mode of {}: {e}", path.display())))
}

#[cfg(not(unix))]
pub(crate) fn restore_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Restore one manifest entry to the working tree. A file already present
/// with the right content is left alone.
pub(crate) async fn restore_entry(cache: &dyn Cache, entry: &CacheEntry) -> Result<()> {
    let path = Path::new(&entry.filename);
    if path.is_file() && hash_file(path)? == entry.hash {
        debug!(file = %entry.filename, "Output already current, skipping fetch.");
    } else {
        cache.get("out", entry).await?;
    }
    restore_mode(path, entry.file_mode)
}

fn output_hashes(entries: &[CacheEntry]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|entry| (entry.filename.clone(), entry.hash.clone()))
        .collect()
}

/// Decorate a callback with this cache layer: fingerprint the job, restore
/// its outputs on a manifest hit, otherwise run the inner callback and
/// capture the declared outputs. Services bypass the cache entirely.
pub fn with_cache(cache: Arc<dyn Cache>, inner: JobCallback) -> JobCallback {
    JobCallback::new(move |job: Arc<Job>| {
        let cache = cache.clone();
        let inner = inner.clone();
        Box::pin(async move {
            if job.service || !cache.enabled() {
                return inner.run(job).await;
            }

            let key = match job.hash() {
                Some(key) => key,
                None => {
                    let key = fingerprint(&job)?;
                    job.set_hash(key.clone());
                    key
                }
            };

            if let Some(manifest) = cache.load_manifest("in", &key).await? {
                for entry in &manifest {
                    restore_entry(cache.as_ref(), entry).await?;
                }
                job.set_output_hashes(output_hashes(&manifest));
                job.set_cached();
                info!(job = %job.name, cache = cache.name(), "Loaded job \"{}\" from cache.", job.name);
                return Ok(());
            }

            inner.run(job.clone()).await?;

            let mut entries = Vec::with_capacity(job.outputs.len());
            for output in &job.outputs {
                let entry = cache.set("out", Path::new(output)).await?;
                entries.push(entry);
            }
            cache.dump_manifest("in", &key, &entries).await?;
            job.set_output_hashes(output_hashes(&entries));

            Ok(())
        })
    })
}
