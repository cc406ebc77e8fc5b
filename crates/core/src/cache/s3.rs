//! S3-compatible cache backend
//!
//! Object keys mirror the filesystem layout as `<namespace>/<key>`. The
//! bucket is created on init when absent and report assets (`logs/*`,
//! `reports/*`, `report-blobs/*`) get a public-read policy so their URLs
//! can be handed out in commit statuses.

use crate::cache::{file_mode, Cache, CacheEntry, CacheWriter};
use crate::errors::{HoneError, Result};
use crate::fingerprint::hash_file;
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Namespaces whose objects are world-readable once uploaded.
const PUBLIC_NAMESPACES: [&str; 3] = ["logs", "reports", "report-blobs"];

/// `cache.s3` section of the Honefile
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug)]
pub struct S3Cache {
    config: S3Config,
    client: Client,
}

fn endpoint_url(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}

fn content_type(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

impl S3Cache {
    /// Connect to the endpoint, ensure the bucket exists, and apply the
    /// public-read policy for report assets.
    pub async fn connect(config: S3Config) -> Result<Self> {
        let credentials = Credentials::from_keys(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
        );

        let client_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(endpoint_url(&config.endpoint))
            .region(Region::new("us-east-1"))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        let cache = Self {
            client: Client::from_conf(client_config),
            config,
        };
        cache.ensure_bucket().await?;
        debug!(bucket = %cache.config.bucket, "Initialized S3 cache.");
        Ok(cache)
    }

    /// Connect from the environment the driver propagates to remote
    /// execution environments.
    pub async fn from_env() -> Result<Self> {
        let var = |name: &str| {
            std::env::var(name)
                .map_err(|_| HoneError::config(format!("{name} is not set.")))
        };

        Self::connect(S3Config {
            bucket: var("S3_BUCKET")?,
            endpoint: var("S3_ENDPOINT")?,
            access_key: var("S3_ACCESS_KEY")?,
            secret_key: var("S3_SECRET_KEY")?,
            disabled: false,
        })
        .await
    }

    async fn ensure_bucket(&self) -> Result<()> {
        let created = self
            .client
            .create_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await;

        if let Err(create_err) = created {
            // Racing another driver or lacking create rights is fine as
            // long as the bucket is reachable.
            self.client
                .head_bucket()
                .bucket(&self.config.bucket)
                .send()
                .await
                .map_err(|_| {
                    HoneError::cache(format!(
                        "creating bucket {}: {create_err}",
                        self.config.bucket
                    ))
                })?;
            return Ok(());
        }

        let resources: Vec<String> = PUBLIC_NAMESPACES
            .iter()
            .map(|ns| format!("arn:aws:s3:::{}/{ns}/*", self.config.bucket))
            .collect();
        let policy = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": {"AWS": ["*"]},
                "Action": ["s3:GetObject"],
                "Resource": resources,
            }],
        });

        if let Err(err) = self
            .client
            .put_bucket_policy()
            .bucket(&self.config.bucket)
            .policy(policy.to_string())
            .send()
            .await
        {
            warn!(bucket = %self.config.bucket, "Could not apply public-read policy: {err}");
        }

        Ok(())
    }

    fn key(namespace: &str, key: &str) -> String {
        format!("{namespace}/{key}")
    }
}

#[async_trait]
impl Cache for S3Cache {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn env(&self) -> IndexMap<String, String> {
        IndexMap::from([
            ("S3_BUCKET".to_string(), self.config.bucket.clone()),
            ("S3_ENDPOINT".to_string(), self.config.endpoint.clone()),
            ("S3_ACCESS_KEY".to_string(), self.config.access_key.clone()),
            ("S3_SECRET_KEY".to_string(), self.config.secret_key.clone()),
        ])
    }

    fn enabled(&self) -> bool {
        !self.config.disabled
    }

    fn base_url(&self) -> String {
        format!(
            "{}/{}",
            endpoint_url(&self.config.endpoint),
            self.config.bucket
        )
    }

    async fn get(&self, namespace: &str, entry: &CacheEntry) -> Result<()> {
        let key = Self::key(namespace, &entry.hash);
        let object = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| HoneError::cache(format!("fetching {key}: {e}")))?;

        let target = Path::new(&entry.filename);
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    HoneError::cache(format!("creating {}: {e}", parent.display()))
                })?;
            }
        }

        let mut file = tokio::fs::File::create(target)
            .await
            .map_err(|e| HoneError::cache(format!("creating {}: {e}", target.display())))?;
        let mut body = object.body.into_async_read();
        tokio::io::copy(&mut body, &mut file)
            .await
            .map_err(|e| HoneError::cache(format!("writing {}: {e}", target.display())))?;
        file.flush()
            .await
            .map_err(|e| HoneError::cache(format!("flushing {}: {e}", target.display())))?;

        Ok(())
    }

    async fn set(&self, namespace: &str, path: &Path) -> Result<CacheEntry> {
        let hash = hash_file(path)?;
        let mode = file_mode(path)?;
        let key = Self::key(namespace, &hash);

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| HoneError::cache(format!("reading {}: {e}", path.display())))?;

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| HoneError::cache(format!("uploading {key}: {e}")))?;

        Ok(CacheEntry {
            filename: path.display().to_string(),
            hash,
            file_mode: mode,
        })
    }

    async fn load_manifest(&self, namespace: &str, key: &str) -> Result<Option<Vec<CacheEntry>>> {
        let object_key = Self::key(namespace, key);
        let object = match self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(object) => object,
            Err(SdkError::ServiceError(context)) if context.err().is_no_such_key() => {
                return Ok(None);
            }
            Err(err) => {
                return Err(HoneError::cache(format!(
                    "loading manifest {object_key}: {err}"
                )));
            }
        };

        let data = object
            .body
            .collect()
            .await
            .map_err(|e| HoneError::cache(format!("reading manifest {object_key}: {e}")))?
            .into_bytes();

        let entries = serde_json::from_slice(&data)
            .map_err(|e| HoneError::cache(format!("decoding manifest {object_key}: {e}")))?;
        Ok(Some(entries))
    }

    async fn dump_manifest(
        &self,
        namespace: &str,
        key: &str,
        entries: &[CacheEntry],
    ) -> Result<()> {
        let object_key = Self::key(namespace, key);
        let encoded = serde_json::to_vec(entries)
            .map_err(|e| HoneError::cache(format!("encoding manifest {object_key}: {e}")))?;

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .body(ByteStream::from(encoded))
            .send()
            .await
            .map_err(|e| HoneError::cache(format!("uploading manifest {object_key}: {e}")))?;

        Ok(())
    }

    async fn writer(&self, namespace: &str, path: &str) -> Result<CacheWriter> {
        let (sink, mut source) = tokio::io::duplex(64 * 1024);
        let client = self.client.clone();
        let bucket = self.config.bucket.clone();
        let key = Self::key(namespace, path);
        let mime = content_type(path);
        let public_url = format!("{}/{key}", self.base_url());

        // The upload completes once the caller shuts the sink down.
        let completion = tokio::spawn(async move {
            let mut buffer = Vec::new();
            if let Err(err) = source.read_to_end(&mut buffer).await {
                warn!("Discarding upload of {key}: {err}");
                return;
            }
            if let Err(err) = client
                .put_object()
                .bucket(&bucket)
                .key(&key)
                .content_type(mime)
                .body(ByteStream::from(Bytes::from(buffer)))
                .send()
                .await
            {
                warn!("Uploading {key} failed: {err}");
            }
        });

        Ok(CacheWriter {
            sink: Box::new(sink),
            public_url,
            completion: Some(completion),
        })
    }
}
