//! [`SourceControl`] over a local git checkout, driving the `git` CLI.
//!
//! Pushes are plain `git push <remote> HEAD:<branch>`: never forced, never to a
//! new branch. A non-fast-forward rejection is reported as
//! [`PushOutcome::Rejected`] so the gateway can rebase once and retry.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::capability::{PushOutcome, SourceControl};
use crate::config::GitConfig;
use crate::domain::{ChangeSet, FileOp, Result, RevisionId, ShiplineError};

pub struct GitSourceControl {
    repo_dir: PathBuf,
    remote: String,
    branch: String,
    protected: BTreeSet<String>,
}

impl GitSourceControl {
    pub fn new(repo_dir: impl Into<PathBuf>, config: &GitConfig) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            remote: config.remote.clone(),
            branch: config.branch.clone(),
            protected: config.protected_paths.clone(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, "git");
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .await
            .map_err(|e| ShiplineError::SourceControl(format!("failed to run git: {e}")))
    }

    /// Run git and return trimmed stdout, failing on a non-zero exit.
    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ShiplineError::SourceControl(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn rev_parse(&self, rev: &str) -> Result<RevisionId> {
        let sha = self.git(&["rev-parse", rev]).await?;
        if sha.is_empty() {
            return Err(ShiplineError::SourceControl(format!(
                "git rev-parse {rev} returned empty output"
            )));
        }
        Ok(RevisionId::new(sha))
    }

    fn remote_ref(&self) -> String {
        format!("{}/{}", self.remote, self.branch)
    }
}

#[async_trait]
impl SourceControl for GitSourceControl {
    async fn get_head(&self) -> Result<RevisionId> {
        self.rev_parse("HEAD").await
    }

    async fn remote_head(&self) -> Result<RevisionId> {
        self.git(&["fetch", "--quiet", &self.remote, &self.branch])
            .await?;
        self.rev_parse(&self.remote_ref()).await
    }

    async fn protected_paths(&self) -> Result<BTreeSet<String>> {
        Ok(self.protected.clone())
    }

    async fn apply(&self, change_set: &ChangeSet) -> Result<()> {
        for change in &change_set.changes {
            let path = self.repo_dir.join(&change.path);
            match &change.op {
                FileOp::Write { content } => {
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&path, content).await?;
                }
                FileOp::Delete => match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
            }
        }
        Ok(())
    }

    async fn restore(&self, paths: &BTreeSet<String>) -> Result<()> {
        for path in paths {
            let tracked = self
                .git(&["ls-tree", "-r", "--name-only", "HEAD", "--", path])
                .await?;
            if tracked.is_empty() {
                continue;
            }
            self.git(&["checkout", "HEAD", "--", path]).await?;
        }
        Ok(())
    }

    async fn stage_all(&self) -> Result<Vec<String>> {
        self.git(&["add", "--all"]).await?;
        let names = self
            .git(&["diff", "--cached", "--name-only", "--no-renames"])
            .await?;
        Ok(names
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn discard(&self) -> Result<()> {
        self.git(&["reset", "--hard", "--quiet", "HEAD"]).await?;
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<RevisionId> {
        self.git(&["commit", "--quiet", "-m", message]).await?;
        self.get_head().await
    }

    async fn push(&self) -> Result<PushOutcome> {
        let refspec = format!("HEAD:refs/heads/{}", self.branch);
        let output = self.run(&["push", "--porcelain", &self.remote, &refspec]).await?;
        if output.status.success() {
            return Ok(PushOutcome::Pushed(self.get_head().await?));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let rejected = [stdout.as_ref(), stderr.as_ref()].iter().any(|s| {
            s.contains("[rejected]") || s.contains("non-fast-forward") || s.contains("fetch first")
        });
        if !rejected {
            return Err(ShiplineError::SourceControl(format!(
                "git push failed: {}",
                stderr.trim()
            )));
        }

        let remote_head = self.remote_head().await?;
        warn!(remote_head = %remote_head.short(), "push rejected: remote moved");
        Ok(PushOutcome::Rejected { remote_head })
    }

    async fn rebase_onto(&self, remote_head: &RevisionId) -> Result<RevisionId> {
        let output = self.run(&["rebase", "--quiet", remote_head.as_str()]).await?;
        if !output.status.success() {
            warn!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "rebase failed; aborting"
            );
            let _ = self.run(&["rebase", "--abort"]).await;
            return Err(ShiplineError::DivergedHistory {
                remote_head: remote_head.clone(),
            });
        }
        self.get_head().await
    }

    async fn reset_to_remote(&self) -> Result<RevisionId> {
        let remote_head = self.remote_head().await?;
        self.git(&["reset", "--hard", "--quiet", remote_head.as_str()])
            .await?;
        Ok(remote_head)
    }
}
