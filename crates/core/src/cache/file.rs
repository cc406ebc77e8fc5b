//! Filesystem cache backend
//!
//! Layout under the cache root (default `.hone_cache`):
//! `<root>/<namespace>/<content-hash>` for blobs and
//! `<root>/<namespace>/<fingerprint>` for JSON manifests.

use crate::cache::{file_mode, Cache, CacheEntry, CacheWriter};
use crate::errors::{HoneError, Result};
use crate::fingerprint::hash_file;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const DEFAULT_CACHE_DIR: &str = ".hone_cache";

/// `cache.file` section of the Honefile
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileCacheConfig {
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug)]
pub struct FileCache {
    cache_dir: PathBuf,
}

impl FileCache {
    /// Open (and create) the cache root with its standing namespaces.
    pub async fn new(cache_dir: Option<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));

        for namespace in ["in", "out"] {
            fs::create_dir_all(cache_dir.join(namespace))
                .await
                .map_err(|e| {
                    HoneError::cache(format!(
                        "initializing cache directory {}: {e}",
                        cache_dir.display()
                    ))
                })?;
        }

        debug!(dir = %cache_dir.display(), "Initialized file cache.");
        Ok(Self { cache_dir })
    }

    pub async fn from_config(config: &FileCacheConfig) -> Result<Self> {
        Self::new(config.cache_dir.clone()).await
    }

    fn key_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.cache_dir.join(namespace).join(key)
    }

    async fn copy(src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    HoneError::cache(format!("creating {}: {e}", parent.display()))
                })?;
            }
        }
        fs::copy(src, dst).await.map_err(|e| {
            HoneError::cache(format!(
                "copying {} to {}: {e}",
                src.display(),
                dst.display()
            ))
        })?;
        cache_file_mode(dst).await
    }
}

/// Everything the cache writes is mode 0666: entries are shared between
/// users of a common cache directory, and restores re-apply the recorded
/// mode anyway.
#[cfg(unix)]
async fn cache_file_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
        .await
        .map_err(|e| HoneError::cache(format!("setting mode of {}: {e}", path.display())))
}

#[cfg(not(unix))]
async fn cache_file_mode(_path: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl Cache for FileCache {
    fn name(&self) -> &'static str {
        "file"
    }

    fn base_url(&self) -> String {
        format!("file://{}", self.cache_dir.display())
    }

    async fn get(&self, namespace: &str, entry: &CacheEntry) -> Result<()> {
        let key = self.key_path(namespace, &entry.hash);
        Self::copy(&key, Path::new(&entry.filename)).await
    }

    async fn set(&self, namespace: &str, path: &Path) -> Result<CacheEntry> {
        let hash = hash_file(path)?;
        let mode = file_mode(path)?;
        Self::copy(path, &self.key_path(namespace, &hash)).await?;

        Ok(CacheEntry {
            filename: path.display().to_string(),
            hash,
            file_mode: mode,
        })
    }

    async fn load_manifest(&self, namespace: &str, key: &str) -> Result<Option<Vec<CacheEntry>>> {
        let path = self.key_path(namespace, key);

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(HoneError::cache(format!(
                    "reading manifest {}: {e}",
                    path.display()
                )));
            }
        };

        let entries = serde_json::from_slice(&data).map_err(|e| {
            HoneError::cache(format!("decoding manifest {}: {e}", path.display()))
        })?;
        Ok(Some(entries))
    }

    async fn dump_manifest(
        &self,
        namespace: &str,
        key: &str,
        entries: &[CacheEntry],
    ) -> Result<()> {
        let path = self.key_path(namespace, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| HoneError::cache(format!("creating {}: {e}", parent.display())))?;
        }

        let encoded = serde_json::to_vec(entries)
            .map_err(|e| HoneError::cache(format!("encoding manifest {key}: {e}")))?;
        fs::write(&path, encoded)
            .await
            .map_err(|e| HoneError::cache(format!("writing manifest {}: {e}", path.display())))?;
        cache_file_mode(&path).await
    }

    async fn writer(&self, namespace: &str, path: &str) -> Result<CacheWriter> {
        let target = self.cache_dir.join(namespace).join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| HoneError::cache(format!("creating {}: {e}", parent.display())))?;
        }

        let sink = fs::File::create(&target)
            .await
            .map_err(|e| HoneError::cache(format!("creating {}: {e}", target.display())))?;
        cache_file_mode(&target).await?;

        Ok(CacheWriter {
            sink: Box::new(sink),
            public_url: format!("{}/{namespace}/{path}", self.base_url()),
            completion: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as std_fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_manifest_round_trip() {
        let root = TempDir::new().unwrap();
        let cache = FileCache::new(Some(root.path().to_path_buf())).await.unwrap();

        let entries = vec![
            CacheEntry {
                filename: "a.bin".to_string(),
                hash: "11".to_string(),
                file_mode: 0o644,
            },
            CacheEntry {
                filename: "b.bin".to_string(),
                hash: "22".to_string(),
                file_mode: 0o755,
            },
        ];

        cache.dump_manifest("in", "key", &entries).await.unwrap();
        let loaded = cache.load_manifest("in", "key").await.unwrap();
        assert_eq!(loaded, Some(entries));
    }

    #[tokio::test]
    async fn test_manifest_miss_is_none() {
        let root = TempDir::new().unwrap();
        let cache = FileCache::new(Some(root.path().to_path_buf())).await.unwrap();
        assert_eq!(cache.load_manifest("in", "absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_then_get_restores_content() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let cache = FileCache::new(Some(root.path().to_path_buf())).await.unwrap();

        let src = work.path().join("artifact.bin");
        std_fs::write(&src, b"payload").unwrap();

        let entry = cache.set("out", &src).await.unwrap();
        assert_eq!(entry.filename, src.display().to_string());
        let blob = root.path().join("out").join(&entry.hash);
        assert!(blob.is_file());

        std_fs::remove_file(&src).unwrap();
        cache.get("out", &entry).await.unwrap();
        assert_eq!(std_fs::read(&src).unwrap(), b"payload");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std_fs::metadata(&blob).unwrap().permissions().mode();
            assert_eq!(mode & 0o7777, 0o666);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_blob_mode_ignores_source_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let cache = FileCache::new(Some(root.path().to_path_buf())).await.unwrap();

        let src = work.path().join("tool.sh");
        std_fs::write(&src, b"#!/bin/sh\n").unwrap();
        std_fs::set_permissions(&src, std_fs::Permissions::from_mode(0o755)).unwrap();

        let entry = cache.set("out", &src).await.unwrap();
        assert_eq!(entry.file_mode, 0o755);

        let blob = root.path().join("out").join(&entry.hash);
        let mode = std_fs::metadata(&blob).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o666);

        cache.dump_manifest("in", "key", &[entry]).await.unwrap();
        let manifest = std_fs::metadata(root.path().join("in/key")).unwrap();
        assert_eq!(manifest.permissions().mode() & 0o7777, 0o666);
    }

    #[tokio::test]
    async fn test_writer_lands_under_namespace() {
        use tokio::io::AsyncWriteExt;

        let root = TempDir::new().unwrap();
        let cache = FileCache::new(Some(root.path().to_path_buf())).await.unwrap();

        let mut writer = cache.writer("reports", "build.json").await.unwrap();
        writer.sink.write_all(b"{}").await.unwrap();
        writer.sink.shutdown().await.unwrap();

        assert!(writer.public_url.ends_with("reports/build.json"));
        assert_eq!(
            std_fs::read(root.path().join("reports/build.json")).unwrap(),
            b"{}"
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std_fs::metadata(root.path().join("reports/build.json"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o7777, 0o666);
        }
    }
}
