//! Git capability used by the executor.
//!
//! Every command receives an explicit working directory; nothing relies on
//! the process cwd, because sandboxes and the target repo are different
//! directories within one process.

use std::path::Path;
use std::process::Output;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// Options for an auto-commit.
#[derive(Clone, Debug)]
pub struct CommitOptions {
    pub message: String,
    /// Appended as a `Co-Authored-By:` trailer when non-empty.
    pub co_author: String,
}

/// Outcome of rebasing a sandbox branch onto its base.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RebaseOutcome {
    Success,
    /// Rebase hit a conflict; the caller aborts and files a conflict task.
    Conflict { output: String },
    Error { output: String },
}

#[async_trait]
pub trait GitOps: Send + Sync {
    async fn has_uncommitted_changes(&self, dir: &Path) -> Result<bool>;
    async fn status(&self, dir: &Path) -> Result<String>;
    async fn diff(&self, dir: &Path) -> Result<String>;
    /// Stage everything and commit. Returns the short commit hash.
    async fn commit_changes(&self, dir: &Path, opts: &CommitOptions) -> Result<String>;
    /// Delete merged branches older than `retention_days`. Returns the
    /// branches that were (or would be, in dry-run) deleted.
    async fn cleanup_orphaned_branches(
        &self,
        dir: &Path,
        retention_days: u32,
        dry_run: bool,
    ) -> Result<Vec<String>>;
    async fn fetch(&self, dir: &Path, base_branch: &str) -> Result<()>;
    async fn rebase_onto_base(&self, dir: &Path, base_branch: &str) -> Result<RebaseOutcome>;
    /// Best effort; a failed abort is logged, not propagated.
    async fn rebase_abort(&self, dir: &Path);
}

/// Real implementation shelling out to `git`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemGit;

impl SystemGit {
    async fn run(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        debug!(dir = %dir.display(), ?args, "git");
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .with_context(|| format!("Failed to run git {args:?} in {}", dir.display()))
    }
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    text
}

#[async_trait]
impl GitOps for SystemGit {
    async fn has_uncommitted_changes(&self, dir: &Path) -> Result<bool> {
        let output = self.run(dir, &["status", "--porcelain"]).await?;
        if !output.status.success() {
            anyhow::bail!(
                "git status failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    async fn status(&self, dir: &Path) -> Result<String> {
        let output = self.run(dir, &["status", "--short", "--branch"]).await?;
        if !output.status.success() {
            anyhow::bail!(
                "git status failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn diff(&self, dir: &Path) -> Result<String> {
        let output = self.run(dir, &["diff", "HEAD"]).await?;
        if !output.status.success() {
            anyhow::bail!("git diff failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn commit_changes(&self, dir: &Path, opts: &CommitOptions) -> Result<String> {
        let output = self.run(dir, &["add", "-A"]).await?;
        if !output.status.success() {
            anyhow::bail!("git add failed: {}", String::from_utf8_lossy(&output.stderr));
        }

        let mut message = opts.message.trim_end().to_string();
        if !opts.co_author.is_empty() {
            message.push_str(&format!("\n\nCo-Authored-By: {}", opts.co_author));
        }

        let output = self.run(dir, &["commit", "-m", &message]).await?;
        if !output.status.success() {
            anyhow::bail!(
                "git commit failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let output = self.run(dir, &["rev-parse", "--short", "HEAD"]).await?;
        if !output.status.success() {
            anyhow::bail!(
                "git rev-parse failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn cleanup_orphaned_branches(
        &self,
        dir: &Path,
        retention_days: u32,
        dry_run: bool,
    ) -> Result<Vec<String>> {
        let output = self
            .run(dir, &["branch", "--merged", "--format=%(refname:short)"])
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "git branch failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let cutoff_secs = i64::from(retention_days) * 86_400;
        let mut deleted = Vec::new();
        for branch in String::from_utf8_lossy(&output.stdout).lines() {
            let branch = branch.trim();
            if branch.is_empty() || !branch.starts_with("sandbox/") {
                continue;
            }
            let age = self
                .run(dir, &["log", "-1", "--format=%ct", branch])
                .await?;
            if !age.status.success() {
                continue;
            }
            let last_commit: i64 = String::from_utf8_lossy(&age.stdout)
                .trim()
                .parse()
                .unwrap_or(i64::MAX);
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            if now - last_commit < cutoff_secs {
                continue;
            }
            if !dry_run {
                let del = self.run(dir, &["branch", "-D", branch]).await?;
                if !del.status.success() {
                    warn!(
                        branch,
                        "failed to delete orphaned branch: {}",
                        String::from_utf8_lossy(&del.stderr)
                    );
                    continue;
                }
            }
            deleted.push(branch.to_string());
        }
        Ok(deleted)
    }

    async fn fetch(&self, dir: &Path, base_branch: &str) -> Result<()> {
        let output = self.run(dir, &["fetch", "origin", base_branch]).await?;
        if !output.status.success() {
            anyhow::bail!(
                "git fetch origin {base_branch} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    async fn rebase_onto_base(&self, dir: &Path, base_branch: &str) -> Result<RebaseOutcome> {
        let target = format!("origin/{base_branch}");
        let output = self.run(dir, &["rebase", &target]).await?;
        let text = combined_output(&output);
        if output.status.success() {
            return Ok(RebaseOutcome::Success);
        }
        if text.contains("CONFLICT") || text.contains("could not apply") {
            return Ok(RebaseOutcome::Conflict { output: text });
        }
        Ok(RebaseOutcome::Error { output: text })
    }

    async fn rebase_abort(&self, dir: &Path) {
        match self.run(dir, &["rebase", "--abort"]).await {
            Ok(output) if !output.status.success() => {
                warn!(
                    dir = %dir.display(),
                    "git rebase --abort failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
            }
            Err(e) => warn!(dir = %dir.display(), "git rebase --abort failed: {e:#}"),
            _ => {}
        }
    }
}
