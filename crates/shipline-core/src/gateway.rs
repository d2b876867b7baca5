//! Repository gateway: safe commit and push against a workspace.
//!
//! Guards the platform-owned subtree, distinguishes "nothing to do" from a
//! failure, pushes fast-forward only with a single rebase retry, and
//! serializes sessions per workspace.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fs2::FileExt;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use crate::capability::{PushOutcome, SourceControl};
use crate::domain::{is_protected, ChangeSet, Result, RevisionId, ShiplineError};

const LOCK_RETRY: Duration = Duration::from_millis(200);

/// Per-workspace FIFO locks. Waiters queue; nobody is rejected.
///
/// With a lock directory the hold also covers `<dir>/<workspace>.lock`, so
/// sessions in separate processes queue behind each other as well.
#[derive(Debug, Default)]
pub struct WorkspaceLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    lock_dir: Option<PathBuf>,
}

impl WorkspaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            locks: Mutex::default(),
            lock_dir: Some(dir.into()),
        }
    }

    /// Wait for exclusive access to `workspace`.
    pub async fn acquire(&self, workspace: &str) -> Result<WorkspaceGuard> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(workspace.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        if lock.try_lock().is_err() {
            info!(workspace = %workspace, "workspace busy; queued behind running session");
        }
        let guard = lock.lock_owned().await;
        let file = match &self.lock_dir {
            Some(dir) => Some(lock_file(dir, workspace).await?),
            None => None,
        };
        Ok(WorkspaceGuard {
            _file: file,
            _guard: guard,
        })
    }

    /// Whether some session in this process currently holds `workspace`.
    pub fn is_locked(&self, workspace: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .get(workspace)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}

/// Take the advisory lock on `<dir>/<workspace>.lock`, polling until free.
async fn lock_file(dir: &Path, workspace: &str) -> Result<File> {
    tokio::fs::create_dir_all(dir).await?;
    let name: String = workspace
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let path = dir.join(format!("{name}.lock"));
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)?;

    let mut queued = false;
    loop {
        // Explicit trait call: std::fs::File has inherent lock methods on newer toolchains.
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => return Ok(file),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                if !queued {
                    info!(lock = %path.display(), "workspace held by another process; waiting");
                    queued = true;
                }
                tokio::time::sleep(LOCK_RETRY).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Exclusive hold on one workspace; released on drop.
#[derive(Debug)]
pub struct WorkspaceGuard {
    _file: Option<File>,
    _guard: OwnedMutexGuard<()>,
}

/// Commits change sets through a [`SourceControl`] backend.
pub struct RepositoryGateway {
    source: Arc<dyn SourceControl>,
    locks: Arc<WorkspaceLocks>,
}

impl RepositoryGateway {
    pub fn new(source: Arc<dyn SourceControl>) -> Self {
        Self::with_locks(source, Arc::new(WorkspaceLocks::new()))
    }

    /// Share `locks` with other gateways in the same process.
    pub fn with_locks(source: Arc<dyn SourceControl>, locks: Arc<WorkspaceLocks>) -> Self {
        Self { source, locks }
    }

    pub async fn lock(&self, workspace: &str) -> Result<WorkspaceGuard> {
        self.locks.acquire(workspace).await
    }

    pub async fn remote_head(&self) -> Result<RevisionId> {
        self.source.remote_head().await
    }

    /// Apply, stage, commit and push `change_set`, returning the pushed revision.
    pub async fn commit(&self, change_set: &ChangeSet) -> Result<RevisionId> {
        change_set.validate()?;

        let mut protected: BTreeSet<String> = self.source.protected_paths().await?;
        protected.extend(change_set.protected_paths.iter().cloned());

        let touched = change_set.touched_protected(&protected);
        if !touched.is_empty() {
            warn!(paths = ?touched, "change set targets protected paths; rejected");
            return Err(ShiplineError::ProtectedPathModified { paths: touched });
        }

        self.source.apply(change_set).await?;
        self.source.restore(&protected).await?;
        let staged = self.source.stage_all().await?;

        let leaked: Vec<String> = staged
            .iter()
            .filter(|p| is_protected(p, &protected))
            .cloned()
            .collect();
        if !leaked.is_empty() {
            warn!(paths = ?leaked, "protected paths still staged after restore");
            self.source.discard().await?;
            return Err(ShiplineError::ProtectedPathModified { paths: leaked });
        }
        if staged.is_empty() {
            return Err(ShiplineError::EmptyChangeSet);
        }

        let local = self.source.commit(&change_set.message).await?;
        info!(revision = %local.short(), files = staged.len(), "committed change set");

        match self.push_with_rebase().await {
            Ok(revision) => Ok(revision),
            Err(e) => {
                // The local commit never reached the remote; drop it so the
                // next delivery starts from the remote head.
                match self.source.reset_to_remote().await {
                    Ok(head) => {
                        warn!(error = %e, remote_head = %head.short(), "push failed; local commit dropped")
                    }
                    Err(reset) => {
                        warn!(error = %e, reset_error = %reset, "push failed; could not reset to remote")
                    }
                }
                Err(e)
            }
        }
    }

    async fn push_with_rebase(&self) -> Result<RevisionId> {
        match self.source.push().await? {
            PushOutcome::Pushed(revision) => Ok(revision),
            PushOutcome::Rejected { remote_head } => {
                warn!(remote_head = %remote_head.short(), "push rejected; rebasing once");
                let rebased = self.source.rebase_onto(&remote_head).await?;
                match self.source.push().await? {
                    PushOutcome::Pushed(revision) => {
                        info!(revision = %rebased.short(), "pushed after rebase");
                        Ok(revision)
                    }
                    PushOutcome::Rejected { remote_head } => {
                        Err(ShiplineError::DivergedHistory { remote_head })
                    }
                }
            }
        }
    }
}
