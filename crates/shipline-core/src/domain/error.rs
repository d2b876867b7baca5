//! Domain-level error taxonomy for Shipline.

use crate::domain::build::{BuildFailureReason, RevisionId};
use crate::domain::deployment::WorkloadFailure;
use crate::domain::session::Phase;

/// Errors produced by [`ChangeSet`](crate::domain::ChangeSet) validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChangeSetError {
    #[error("commit message must not be empty")]
    EmptyMessage,

    #[error("change set contains no file operations")]
    NoOperations,

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("deletion of {path} has no replacement in the same change set")]
    UnreplacedDeletion { path: String },
}

/// Coarse grouping of [`ShiplineError`] used by callers to decide presentation
/// and by the orchestrator to decide whether a phase may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected immediately, never retried.
    Input,
    /// Retried within the owning phase's bounded policy.
    Transient,
    /// Mapped to a fixed cause so a corrective change can be targeted.
    Classified,
    /// A phase reached its retry ceiling.
    Exhaustion,
    /// Observation was stopped by the caller.
    Cancelled,
    /// Local I/O, serialization or programming errors.
    Internal,
}

/// Shipline domain errors.
#[derive(Debug, thiserror::Error)]
pub enum ShiplineError {
    #[error("invalid change set: {0}")]
    InvalidChangeSet(#[from] ChangeSetError),

    #[error("change touches protected paths: {}", paths.join(", "))]
    ProtectedPathModified { paths: Vec<String> },

    #[error("nothing staged relative to HEAD")]
    EmptyChangeSet,

    #[error("push rejected twice; remote history diverged at {remote_head}")]
    DivergedHistory { remote_head: RevisionId },

    #[error("revision {0} was already built; a corrective change set is required")]
    UnmodifiedRevision(RevisionId),

    #[error("build of {revision} not terminal after {waited_secs}s")]
    BuildTimeout { revision: RevisionId, waited_secs: u64 },

    #[error("build of {} failed on attempt {}: {}", run.revision, run.attempt, run.reason())]
    BuildFailed { run: crate::domain::build::BuildRun },

    #[error("build exhausted after {attempts} attempts; last failure: {reason}")]
    BuildExhausted {
        attempts: u32,
        reason: BuildFailureReason,
    },

    #[error("build failure {reason} cannot be corrected automatically")]
    Unfixable { reason: BuildFailureReason },

    #[error("workload {selector} not ready: {}", failure.map(|f| f.to_string()).unwrap_or_else(|| "rollout timed out".to_string()))]
    WorkloadNotReady {
        selector: String,
        failure: Option<WorkloadFailure>,
    },

    #[error("endpoint {url} unreachable after {attempts} attempts: {last}")]
    Unreachable {
        url: String,
        attempts: u32,
        last: String,
    },

    #[error("deployment verification exhausted after {attempts} attempts: {last}")]
    DeployExhausted {
        attempts: u32,
        last: Box<ShiplineError>,
    },

    #[error("cancelled during {phase}")]
    Cancelled { phase: Phase },

    #[error("source control error: {0}")]
    SourceControl(String),

    #[error("build provider error: {0}")]
    BuildProvider(String),

    #[error("workload inspector error: {0}")]
    WorkloadInspector(String),

    #[error("domain registrar error: {0}")]
    DomainRegistrar(String),

    #[error("remediation error: {0}")]
    Remediation(String),

    #[error("invalid phase transition: cannot transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {session_id} already ended in {phase}")]
    AlreadyTerminal { session_id: String, phase: Phase },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShiplineError {
    /// Which branch of the error taxonomy this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ShiplineError::InvalidChangeSet(_)
            | ShiplineError::ProtectedPathModified { .. }
            | ShiplineError::EmptyChangeSet
            | ShiplineError::UnmodifiedRevision(_) => ErrorCategory::Input,

            ShiplineError::DivergedHistory { .. }
            | ShiplineError::BuildTimeout { .. }
            | ShiplineError::Unreachable { .. }
            | ShiplineError::SourceControl(_)
            | ShiplineError::BuildProvider(_)
            | ShiplineError::WorkloadInspector(_)
            | ShiplineError::DomainRegistrar(_) => ErrorCategory::Transient,

            ShiplineError::WorkloadNotReady { failure: None, .. } => ErrorCategory::Transient,
            ShiplineError::WorkloadNotReady {
                failure: Some(_), ..
            }
            | ShiplineError::BuildFailed { .. }
            | ShiplineError::Unfixable { .. }
            | ShiplineError::Remediation(_) => ErrorCategory::Classified,

            ShiplineError::BuildExhausted { .. } | ShiplineError::DeployExhausted { .. } => {
                ErrorCategory::Exhaustion
            }

            ShiplineError::Cancelled { .. } => ErrorCategory::Cancelled,

            ShiplineError::InvalidTransition { .. }
            | ShiplineError::SessionNotFound(_)
            | ShiplineError::AlreadyTerminal { .. }
            | ShiplineError::DigestMismatch { .. }
            | ShiplineError::Config(_)
            | ShiplineError::Serialization(_)
            | ShiplineError::Io(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the error is terminal for the current session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Input | ErrorCategory::Exhaustion
        ) || matches!(self, ShiplineError::Unfixable { .. })
    }

    /// The classified build failure carried by this error, if any.
    pub fn reason(&self) -> Option<BuildFailureReason> {
        match self {
            ShiplineError::BuildFailed { run } => Some(run.reason()),
            ShiplineError::BuildExhausted { reason, .. } | ShiplineError::Unfixable { reason } => {
                Some(*reason)
            }
            ShiplineError::DeployExhausted { last, .. } => last.reason(),
            _ => None,
        }
    }

    /// The classified workload failure carried by this error, if any.
    pub fn workload_failure(&self) -> Option<WorkloadFailure> {
        match self {
            ShiplineError::WorkloadNotReady { failure, .. } => *failure,
            ShiplineError::DeployExhausted { last, .. } => last.workload_failure(),
            _ => None,
        }
    }
}

/// Result type for Shipline operations.
pub type Result<T> = std::result::Result<T, ShiplineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protected_path_error_lists_paths() {
        let err = ShiplineError::ProtectedPathModified {
            paths: vec![".platform/workflow.yml".to_string(), ".platform/env".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains(".platform/workflow.yml"));
        assert!(msg.contains(".platform/env"));
        assert_eq!(err.category(), ErrorCategory::Input);
        assert!(err.is_terminal());
    }

    #[test]
    fn test_exhaustion_carries_reason() {
        let err = ShiplineError::BuildExhausted {
            attempts: 3,
            reason: BuildFailureReason::TypeCheckFailed,
        };
        assert!(err.to_string().contains("type_check_failed"));
        assert_eq!(err.reason(), Some(BuildFailureReason::TypeCheckFailed));
        assert_eq!(err.category(), ErrorCategory::Exhaustion);
    }

    #[test]
    fn test_deploy_exhausted_exposes_inner_failure() {
        let err = ShiplineError::DeployExhausted {
            attempts: 3,
            last: Box::new(ShiplineError::WorkloadNotReady {
                selector: "app=web".to_string(),
                failure: Some(WorkloadFailure::CrashLoop),
            }),
        };
        assert_eq!(err.workload_failure(), Some(WorkloadFailure::CrashLoop));
        assert!(err.to_string().contains("crash_loop"));
    }

    #[test]
    fn test_workload_not_ready_category_depends_on_signal() {
        let unexplained = ShiplineError::WorkloadNotReady {
            selector: "app=web".to_string(),
            failure: None,
        };
        assert_eq!(unexplained.category(), ErrorCategory::Transient);
        assert!(unexplained.to_string().contains("rollout timed out"));

        let explained = ShiplineError::WorkloadNotReady {
            selector: "app=web".to_string(),
            failure: Some(WorkloadFailure::ImageUnavailable),
        };
        assert_eq!(explained.category(), ErrorCategory::Classified);
    }

    #[test]
    fn test_digest_mismatch_error() {
        let err = ShiplineError::DigestMismatch {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("abc123"));
        assert!(msg.contains("def456"));
    }
}
