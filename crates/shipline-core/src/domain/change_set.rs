//! Change sets: the atomic delivery unit submitted to the repository gateway.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::error::ChangeSetError;

/// What to do with a single path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileOp {
    Write { content: String },
    Delete,
}

/// One file mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Path relative to the workspace root, `/`-separated.
    pub path: String,
    #[serde(flatten)]
    pub op: FileOp,
}

/// An ordered bundle of file mutations plus metadata, delivered as one commit.
///
/// Operations are applied in order, so a later write to a path wins over an
/// earlier delete of the same path.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub changes: Vec<FileChange>,
    pub message: String,
    /// Paths this change set must never modify, in addition to the paths the
    /// source control reports as platform-owned.
    #[serde(default)]
    pub protected_paths: BTreeSet<String>,
}

impl ChangeSet {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            changes: Vec::new(),
            message: message.into(),
            protected_paths: BTreeSet::new(),
        }
    }

    /// Add a write (create or overwrite).
    pub fn write(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.changes.push(FileChange {
            path: path.into(),
            op: FileOp::Write {
                content: content.into(),
            },
        });
        self
    }

    /// Add a deletion.
    pub fn delete(mut self, path: impl Into<String>) -> Self {
        self.changes.push(FileChange {
            path: path.into(),
            op: FileOp::Delete,
        });
        self
    }

    /// Delete `old` and write its replacement at `new` in the same unit.
    pub fn replace(
        self,
        old: impl Into<String>,
        new: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        self.delete(old).write(new, content)
    }

    /// Mark a path (or subtree) as off limits for this change set.
    pub fn protect(mut self, path: impl Into<String>) -> Self {
        self.protected_paths.insert(path.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Paths written by this change set, in order.
    pub fn written_paths(&self) -> impl Iterator<Item = &str> {
        self.changes
            .iter()
            .filter(|c| matches!(c.op, FileOp::Write { .. }))
            .map(|c| c.path.as_str())
    }

    /// Paths deleted by this change set, in order.
    pub fn deleted_paths(&self) -> impl Iterator<Item = &str> {
        self.changes
            .iter()
            .filter(|c| c.op == FileOp::Delete)
            .map(|c| c.path.as_str())
    }

    /// Structural validation performed before anything touches the workspace.
    pub fn validate(&self) -> Result<(), ChangeSetError> {
        if self.message.trim().is_empty() {
            return Err(ChangeSetError::EmptyMessage);
        }
        if self.changes.is_empty() {
            return Err(ChangeSetError::NoOperations);
        }
        for change in &self.changes {
            validate_path(&change.path)?;
        }

        self.check_replacements()
    }

    /// Each deleted path needs its own write in the same unit: the same path,
    /// a sibling in the same directory, or the same file name moved elsewhere.
    /// Exact rewrites are paired first so they cannot be claimed as siblings.
    fn check_replacements(&self) -> Result<(), ChangeSetError> {
        let mut unpaired: Vec<&str> = Vec::new();
        let mut writes: Vec<&str> = self.written_paths().collect();
        for deleted in self.deleted_paths() {
            match writes.iter().position(|w| *w == deleted) {
                Some(i) => {
                    writes.swap_remove(i);
                }
                None => unpaired.push(deleted),
            }
        }
        for deleted in unpaired {
            let (dir, name) = split_path(deleted);
            let Some(i) = writes.iter().position(|w| {
                let (w_dir, w_name) = split_path(w);
                w_dir == dir || w_name == name
            }) else {
                return Err(ChangeSetError::UnreplacedDeletion {
                    path: deleted.to_string(),
                });
            };
            writes.swap_remove(i);
        }
        Ok(())
    }

    /// Operations whose path falls inside `protected` (sorted, deduplicated).
    pub fn touched_protected(&self, protected: &BTreeSet<String>) -> Vec<String> {
        let touched: BTreeSet<String> = self
            .changes
            .iter()
            .filter(|c| is_protected(&c.path, protected))
            .map(|c| c.path.clone())
            .collect();
        touched.into_iter().collect()
    }

    /// SHA-256 over the message and ordered operations.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.message.as_bytes());
        for change in &self.changes {
            hasher.update([0u8]);
            hasher.update(change.path.as_bytes());
            match &change.op {
                FileOp::Write { content } => {
                    hasher.update(b"w");
                    hasher.update((content.len() as u64).to_le_bytes());
                    hasher.update(content.as_bytes());
                }
                FileOp::Delete => hasher.update(b"d"),
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// Whether `path` equals a protected entry or lies below one.
pub fn is_protected(path: &str, protected: &BTreeSet<String>) -> bool {
    let path = path.trim_start_matches("./");
    protected.iter().any(|entry| {
        let entry = entry.trim_start_matches("./").trim_end_matches('/');
        !entry.is_empty()
            && (path == entry
                || path
                    .strip_prefix(entry)
                    .is_some_and(|rest| rest.starts_with('/')))
    })
}

/// `(directory, file name)`; the directory is empty at the workspace root.
fn split_path(path: &str) -> (&str, &str) {
    path.rsplit_once('/').unwrap_or(("", path))
}

fn validate_path(path: &str) -> Result<(), ChangeSetError> {
    let invalid = |reason| ChangeSetError::InvalidPath {
        path: path.to_string(),
        reason,
    };
    if path.trim().is_empty() {
        return Err(invalid("path is empty"));
    }
    if path.starts_with('/') || path.contains('\\') || path.contains(':') {
        return Err(invalid("path must be relative"));
    }
    if path.split('/').any(|seg| seg == ".." || seg.is_empty()) {
        return Err(invalid("path must not contain empty or parent segments"));
    }
    if path == ".git" || path.starts_with(".git/") {
        return Err(invalid("path points into the git directory"));
    }
    Ok(())
}
