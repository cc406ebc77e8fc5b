//! Git environment discovery
//!
//! Injects `GIT_BRANCH`, `GIT_COMMIT`, `GIT_COMMIT_SHORT` and `GIT_TAG`
//! into the rendered build environment. Everything degrades to empty
//! strings outside a repository so builds stay runnable from a tarball.

use indexmap::IndexMap;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GitInfo {
    pub branch: String,
    pub commit: String,
    pub commit_short: String,
    pub tag: String,
}

async fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

impl GitInfo {
    pub async fn discover() -> Self {
        let info = Self {
            branch: git(&["rev-parse", "--abbrev-ref", "HEAD"])
                .await
                .unwrap_or_default(),
            commit: git(&["rev-parse", "HEAD"]).await.unwrap_or_default(),
            commit_short: git(&["rev-parse", "--short", "HEAD"])
                .await
                .unwrap_or_default(),
            tag: git(&["describe", "--tags", "--exact-match"])
                .await
                .unwrap_or_default(),
        };

        if info.commit.is_empty() {
            debug!("No git repository found, git environment left empty.");
        }
        info
    }

    /// Overlay the git values onto a rendered environment; they win over
    /// anything the Honefile declared.
    pub fn inject(&self, env: &mut IndexMap<String, String>) {
        env.insert("GIT_BRANCH".to_string(), self.branch.clone());
        env.insert("GIT_COMMIT".to_string(), self.commit.clone());
        env.insert("GIT_COMMIT_SHORT".to_string(), self.commit_short.clone());
        env.insert("GIT_TAG".to_string(), self.tag.clone());
    }
}
