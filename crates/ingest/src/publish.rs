use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::Command;
use tokio::time::timeout;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::GitSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// A new commit was pushed
    Pushed,
    /// The unit already held identical files under this key
    AlreadyPresent,
}

/// Pushes artifacts into remote storage units
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Copy every file of `artifact_dir` to `<unit>/<key>/` as one remote update
    async fn publish(&self, artifact_dir: &Path, key: &str, unit_id: &str) -> Result<PublishOutcome>;

    /// Public URL of the published playlist
    fn public_url(&self, unit_id: &str, key: &str) -> String;
}

/// Publishes through the git CLI: shallow clone, copy, commit, push
#[derive(Debug, Clone)]
pub struct GitPublisher {
    settings: GitSettings,
    manifest_name: String,
    checkouts_dir: PathBuf,
}

impl GitPublisher {
    pub fn new(settings: GitSettings, manifest_name: impl Into<String>, checkouts_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            manifest_name: manifest_name.into(),
            checkouts_dir: checkouts_dir.into(),
        }
    }

    /// Clone URL for a unit, with the token embedded for https remotes
    pub fn clone_url(&self, unit_id: &str) -> String {
        let base = self.settings.remote_base.trim_end_matches('/');
        let base = match (&self.settings.token, base.strip_prefix("https://")) {
            (Some(token), Some(host)) => format!("https://x-access-token:{}@{}", token, host),
            _ => base.to_string(),
        };
        format!("{}/{}/{}.git", base, self.settings.owner, unit_id)
    }

    fn redact(&self, text: &str) -> String {
        match self.settings.token.as_deref() {
            Some(token) if !token.is_empty() => text.replace(token, "***"),
            _ => text.to_string(),
        }
    }

    /// Run one git command, returning stdout. Bounded by the configured timeout.
    async fn git(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.settings.git_bin);
        if let Some(dir) = cwd {
            cmd.arg("-C").arg(dir);
        }
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Subcommand name for messages, skipping `-c key=value` pairs
        let verb = args
            .iter()
            .copied()
            .find(|a| !a.starts_with('-') && !a.contains('='))
            .unwrap_or("git");
        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.settings.git_bin.display()))?;

        let limit = Duration::from_secs(self.settings.timeout_secs);
        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.with_context(|| format!("Failed to wait for git {}", verb))?,
            Err(_) => {
                return Err(anyhow!("git {} timed out after {} seconds", verb, self.settings.timeout_secs));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "git {} failed ({}): {}",
                verb,
                output.status,
                self.redact(stderr.trim())
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn publish_in(&self, checkout: &Path, artifact_dir: &Path, key: &str, unit_id: &str) -> Result<PublishOutcome> {
        let url = self.clone_url(unit_id);
        let checkout_str = checkout.display().to_string();
        self.git(None, &["clone", "--quiet", "--depth", "1", &url, &checkout_str])
            .await
            .with_context(|| format!("clone of {} failed", unit_id))?;

        let target = checkout.join(key);
        let source = artifact_dir.to_path_buf();
        let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .context("copy task panicked")??;
        debug!("Copied {} file(s) into {}/{}", copied, unit_id, key);

        self.git(Some(checkout), &["add", "-A"]).await?;

        let status = self.git(Some(checkout), &["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            info!("{} already holds {}, nothing to push", unit_id, key);
            return Ok(PublishOutcome::AlreadyPresent);
        }

        let name = format!("user.name={}", self.settings.author_name);
        let email = format!("user.email={}", self.settings.author_email);
        let message = format!("Add {}", key);
        self.git(
            Some(checkout),
            &["-c", &name, "-c", &email, "-c", "commit.gpgsign=false", "commit", "--quiet", "-m", &message],
        )
        .await?;

        self.git(Some(checkout), &["push", "--quiet", "origin", "HEAD"]).await?;
        Ok(PublishOutcome::Pushed)
    }
}

#[async_trait]
impl Publisher for GitPublisher {
    async fn publish(&self, artifact_dir: &Path, key: &str, unit_id: &str) -> Result<PublishOutcome> {
        tokio::fs::create_dir_all(&self.checkouts_dir)
            .await
            .with_context(|| format!("Failed to create checkout dir: {}", self.checkouts_dir.display()))?;

        let checkout = self
            .checkouts_dir
            .join(format!("{}-{}", unit_id, Uuid::new_v4().simple()));

        let result = self.publish_in(&checkout, artifact_dir, key, unit_id).await;

        // The working copy is discarded whatever happened
        if checkout.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&checkout).await {
                warn!("Failed to remove working copy {}: {}", checkout.display(), e);
            }
        }

        result
    }

    fn public_url(&self, unit_id: &str, key: &str) -> String {
        format!(
            "{}/{}/{}@{}/{}/{}",
            self.settings.cdn_base.trim_end_matches('/'),
            self.settings.owner,
            unit_id,
            self.settings.branch,
            key,
            self.manifest_name
        )
    }
}

/// Copy a directory tree, returning the number of files copied
pub fn copy_tree(source: &Path, target: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk: {}", source.display()))?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .context("walked outside of the source tree")?;
        let dest = target.join(rel);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)
                .with_context(|| format!("Failed to create dir: {}", dest.display()))?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &dest).with_context(|| {
                format!("Failed to copy {} -> {}", entry.path().display(), dest.display())
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}
