//! Capability traits for everything outside the orchestrator.
//!
//! These traits define the seams the lifecycle reaches through:
//! - `SourceControl`: the version-controlled workspace and its remote
//! - `BuildProvider`: the remote CI runner (polled, no push notifications)
//! - `WorkloadInspector`: the container scheduler
//! - `Prober`: external HTTP reachability
//! - `DomainRegistrar`: DNS records and certificate issuance
//! - `Remediator`, `StatusSink`, `SessionStore`: collaborators of the orchestrator
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{
    BuildRun, CertificateState, ChangeSet, DomainBinding, LifecycleSession, Narration,
    RecordType, ReplicaStatus, Result, RevisionId, SessionId, WorkloadEvent, WorkloadSelector,
};

// ---------------------------------------------------------------------------
// SourceControl
// ---------------------------------------------------------------------------

/// Result of a fast-forward-only push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The remote default branch now points at this revision.
    Pushed(RevisionId),
    /// The remote moved since the local branch was based; nothing was pushed.
    Rejected { remote_head: RevisionId },
}

/// A version-controlled workspace with one remote default branch.
///
/// Implementations never force-push and never create branches.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Local HEAD revision.
    async fn get_head(&self) -> Result<RevisionId>;

    /// Revision the remote default branch points at.
    async fn remote_head(&self) -> Result<RevisionId>;

    /// Platform-owned paths that deliveries must never modify.
    async fn protected_paths(&self) -> Result<BTreeSet<String>>;

    /// Write the change set's operations into the working tree.
    async fn apply(&self, change_set: &ChangeSet) -> Result<()>;

    /// Restore `paths` (and everything below them) to their HEAD state.
    async fn restore(&self, paths: &BTreeSet<String>) -> Result<()>;

    /// Stage every working-tree change; returns the paths that differ from HEAD.
    async fn stage_all(&self) -> Result<Vec<String>>;

    /// Drop staged changes and edits to tracked files back to HEAD.
    async fn discard(&self) -> Result<()>;

    /// Commit the staged changes.
    async fn commit(&self, message: &str) -> Result<RevisionId>;

    /// Push HEAD to the remote default branch, fast-forward only.
    async fn push(&self) -> Result<PushOutcome>;

    /// Replay local commits on top of `remote_head`. Returns the new HEAD.
    async fn rebase_onto(&self, remote_head: &RevisionId) -> Result<RevisionId>;

    /// Drop unpushed local commits: the branch, index and tracked files are
    /// reset to the remote head.
    async fn reset_to_remote(&self) -> Result<RevisionId>;
}

// ---------------------------------------------------------------------------
// BuildProvider
// ---------------------------------------------------------------------------

/// Remote CI. Builds are triggered by pushes; this trait only observes them.
#[async_trait]
pub trait BuildProvider: Send + Sync {
    /// Current status of the build for `revision` (`Pending` if not yet picked up).
    async fn get_run_status(&self, revision: &RevisionId) -> Result<BuildRun>;
}

// ---------------------------------------------------------------------------
// WorkloadInspector
// ---------------------------------------------------------------------------

/// Read-only view of the container scheduler.
#[async_trait]
pub trait WorkloadInspector: Send + Sync {
    async fn get_replica_status(&self, selector: &WorkloadSelector) -> Result<ReplicaStatus>;

    async fn get_failure_events(&self, selector: &WorkloadSelector) -> Result<Vec<WorkloadEvent>>;
}

// ---------------------------------------------------------------------------
// Prober
// ---------------------------------------------------------------------------

/// Network-level failure of a probe (no HTTP status was received).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("connection refused")]
    ConnectionRefused,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

/// External HTTP reachability check.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn http_get(&self, url: &str, timeout: Duration) -> std::result::Result<u16, ProbeError>;
}

// ---------------------------------------------------------------------------
// DomainRegistrar
// ---------------------------------------------------------------------------

/// DNS and certificate view for custom domains.
#[async_trait]
pub trait DomainRegistrar: Send + Sync {
    async fn check_record(&self, name: &str, kind: RecordType, expected: &str) -> Result<bool>;

    async fn get_certificate_state(&self, domain: &str) -> Result<CertificateState>;
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Produces the corrective change set for a failed build.
#[async_trait]
pub trait Remediator: Send + Sync {
    /// `Ok(None)` means no correction is available for this failure.
    async fn propose_fix(&self, run: &BuildRun) -> Result<Option<ChangeSet>>;
}

/// Externally visible status published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusUpdate {
    /// A phase transition.
    Transition {
        session_id: SessionId,
        narration: Narration,
    },
    /// The operation succeeded and the endpoint is verified live.
    Live {
        session_id: SessionId,
        revision: RevisionId,
        endpoint: String,
        domain: Option<DomainBinding>,
    },
    /// The operation ended without reaching Live.
    Failed {
        session_id: SessionId,
        message: String,
    },
}

/// Receives status updates; translating them for end users is the sink's job.
pub trait StatusSink: Send + Sync {
    fn publish(&self, update: &StatusUpdate);
}

/// Persistence for in-flight sessions so they can be resumed.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, session: &LifecycleSession) -> Result<()>;

    /// Returns `ShiplineError::SessionNotFound` if absent.
    async fn load(&self, id: &SessionId) -> Result<LifecycleSession>;

    /// No-op if absent.
    async fn remove(&self, id: &SessionId) -> Result<()>;

    async fn list(&self) -> Result<Vec<SessionId>>;
}

/// A sink that only logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn publish(&self, update: &StatusUpdate) {
        match update {
            StatusUpdate::Transition {
                session_id,
                narration,
            } => tracing::info!(
                event = "status.transition",
                session_id = %session_id,
                phase = %narration.phase,
                attempt = narration.attempt,
                note = %narration.note,
            ),
            StatusUpdate::Live {
                session_id,
                endpoint,
                ..
            } => tracing::info!(event = "status.live", session_id = %session_id, endpoint = %endpoint),
            StatusUpdate::Failed {
                session_id,
                message,
            } => tracing::warn!(event = "status.failed", session_id = %session_id, message = %message),
        }
    }
}
