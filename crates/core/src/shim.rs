//! In-pod cache shim
//!
//! The `cache-shim` binary wraps the user command inside a remote pod:
//! it pulls the staged input files down from the remote cache, scrubs the
//! cache credentials out of the child environment, runs the command, and
//! on success captures the declared outputs back into the cache.

use crate::cache::{restore_mode, Cache, S3Cache};
use crate::errors::{HoneError, Result};
use std::path::Path;
use tracing::info;

/// Variables consumed here and never exposed to the user command.
const SCRUBBED_VARS: [&str; 7] = [
    "S3_BUCKET",
    "S3_ENDPOINT",
    "S3_ACCESS_KEY",
    "S3_SECRET_KEY",
    "CACHE_KEY",
    "OUTPUTS",
    "CA_FILE",
];

fn declared_outputs() -> Result<Vec<String>> {
    match std::env::var("OUTPUTS") {
        Ok(raw) if !raw.is_empty() => serde_json::from_str(&raw)
            .map_err(|e| HoneError::config(format!("decoding OUTPUTS: {e}"))),
        _ => Ok(Vec::new()),
    }
}

/// Rehydrate inputs, run the command, capture outputs. Returns the exit
/// code to terminate with.
pub async fn run(argv: Vec<String>) -> Result<i32> {
    if argv.is_empty() {
        return Err(HoneError::config("No command to run."));
    }

    let cache = S3Cache::from_env().await?;
    let key = std::env::var("CACHE_KEY")
        .map_err(|_| HoneError::config("CACHE_KEY is not set."))?;
    let outputs = declared_outputs()?;

    if let Some(manifest) = cache.load_manifest("srcs_manifests", &key).await? {
        for entry in &manifest {
            cache.get("srcs", entry).await?;
            restore_mode(Path::new(&entry.filename), entry.file_mode)?;
            info!("Loaded {} from cache ({}).", entry.filename, cache.name());
        }
    }

    let mut command = tokio::process::Command::new(&argv[0]);
    command.args(&argv[1..]);
    for name in SCRUBBED_VARS {
        command.env_remove(name);
    }

    let status = command
        .status()
        .await
        .map_err(|e| HoneError::executor(format!("running {}: {e}", argv[0])))?;
    if !status.success() {
        return Ok(status.code().unwrap_or(1));
    }

    let mut entries = Vec::with_capacity(outputs.len());
    for output in &outputs {
        entries.push(cache.set("out", Path::new(output)).await?);
    }
    cache.dump_manifest("out", &key, &entries).await?;

    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_argv_rejected() {
        assert!(run(Vec::new()).await.is_err());
    }

    #[test]
    fn test_outputs_decoding() {
        std::env::set_var("OUTPUTS", r#"["a.bin", "b.bin"]"#);
        assert_eq!(declared_outputs().unwrap(), vec!["a.bin", "b.bin"]);

        std::env::set_var("OUTPUTS", "");
        assert!(declared_outputs().unwrap().is_empty());

        std::env::set_var("OUTPUTS", "not json");
        assert!(declared_outputs().is_err());
        std::env::remove_var("OUTPUTS");
    }

    #[test]
    fn test_credentials_are_scrubbed() {
        for name in ["S3_ACCESS_KEY", "S3_SECRET_KEY", "CACHE_KEY", "CA_FILE"] {
            assert!(SCRUBBED_VARS.contains(&name));
        }
    }
}
