//! Repository fetching.
//!
//! Materializes a working copy of a remote repository at a local path by
//! shelling out to `git`. A destination that already holds a clone of the
//! same remote is fast-forwarded in place, so repeated ingestion runs against
//! the same destination keep working. A clone of a different remote is
//! refused rather than overwritten.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// Produces a local working copy of a repository.
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    /// Make `dest` contain the current state of `repo_url`.
    async fn fetch(&self, repo_url: &str, dest: &Path) -> Result<()>;
}

/// [`RepoFetcher`] backed by the `git` command-line tool.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    timeout: Duration,
}

impl GitFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl RepoFetcher for GitFetcher {
    async fn fetch(&self, repo_url: &str, dest: &Path) -> Result<()> {
        let work = async {
            if dest.join(".git").exists() {
                tracing::info!("Updating existing clone at {}", dest.display());
                git_pull(repo_url, dest).await
            } else {
                tracing::info!("Cloning {} into {}", repo_url, dest.display());
                git_clone(repo_url, dest).await
            }
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result,
            Err(_) => bail!(
                "git operation on {} timed out after {}s",
                repo_url,
                self.timeout.as_secs()
            ),
        }
    }
}

async fn git_clone(url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let output = Command::new("git")
        .arg("clone")
        .arg(url)
        .arg(dest)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| "Failed to execute 'git clone'. Is git installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git clone failed: {}", stderr.trim());
    }

    Ok(())
}

async fn git_pull(repo_url: &str, repo_dir: &Path) -> Result<()> {
    let origin = run_git(repo_dir, &["remote", "get-url", "origin"]).await?;
    if origin.trim() != repo_url {
        bail!(
            "{} already holds a clone of {}, not {}",
            repo_dir.display(),
            origin.trim(),
            repo_url
        );
    }
    run_git(repo_dir, &["pull", "--ff-only"]).await?;
    Ok(())
}

async fn run_git(repo_dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to execute 'git {}'", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args[0], stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Derive a collection name from a repository URL.
///
/// Takes the last path segment and strips a trailing `.git`:
/// `https://github.com/org/repo.git` becomes `repo`.
pub fn repo_name_from_url(repo_url: &str) -> String {
    let trimmed = repo_url.trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    last.strip_suffix(".git").unwrap_or(last).to_string()
}
