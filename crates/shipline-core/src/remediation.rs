//! Sources of corrective change sets for failed builds.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::capability::Remediator;
use crate::domain::{BuildRun, ChangeSet, Result, ShiplineError};

/// Never proposes a fix; every failed build ends the session.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRemediation;

#[async_trait]
impl Remediator for NoRemediation {
    async fn propose_fix(&self, run: &BuildRun) -> Result<Option<ChangeSet>> {
        info!(reason = %run.reason(), "no remediator configured");
        Ok(None)
    }
}

/// Runs an external fixer command.
///
/// The failed [`BuildRun`] is written to the command's stdin as JSON. The
/// command prints a [`ChangeSet`] as JSON on stdout, or nothing (or `null`)
/// when it has no fix. A non-zero exit is an error.
#[derive(Debug, Clone)]
pub struct CommandRemediator {
    command: Vec<String>,
    workdir: Option<PathBuf>,
    timeout: Duration,
}

impl CommandRemediator {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            workdir: None,
            timeout,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Remediator for CommandRemediator {
    async fn propose_fix(&self, run: &BuildRun) -> Result<Option<ChangeSet>> {
        let Some((exe, args)) = self.command.split_first() else {
            return Err(ShiplineError::Remediation("empty fixer command".to_string()));
        };

        let mut command = Command::new(exe);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ShiplineError::Remediation(format!("failed to spawn {exe}: {e}")))?;

        // Stdin is fed concurrently with the wait; both sit under the timeout.
        let input = serde_json::to_vec(run)?;
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&input).await {
                    warn!(error = %e, "fixer closed stdin early");
                }
            }
        };
        let exchange = async {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                ShiplineError::Remediation(format!(
                    "fixer timed out after {} seconds",
                    self.timeout.as_secs()
                ))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ShiplineError::Remediation(format!(
                "fixer exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() || stdout == "null" {
            return Ok(None);
        }
        let change_set: ChangeSet = serde_json::from_str(stdout)
            .map_err(|e| ShiplineError::Remediation(format!("fixer printed invalid JSON: {e}")))?;
        info!(
            files = change_set.changes.len(),
            message = %change_set.message,
            "fixer proposed corrective change"
        );
        Ok(Some(change_set))
    }
}
