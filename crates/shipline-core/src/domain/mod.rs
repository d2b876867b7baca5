//! Domain models for Shipline.
//!
//! Canonical definitions for the core entities:
//! - `ChangeSet`: atomic bundle of file mutations
//! - `BuildRun`: one observed remote build attempt
//! - `DeploymentState`: re-queried runtime status of the workload
//! - `DomainBinding`: optional custom hostname under verification
//! - `LifecycleSession`: the end-to-end delivery state machine

pub mod build;
pub mod change_set;
pub mod deployment;
pub mod domain_binding;
pub mod error;
pub mod session;

// Re-export main types and errors
pub use build::{BuildFailureReason, BuildLedger, BuildRun, BuildStatus, RevisionId};
pub use change_set::{is_protected, ChangeSet, FileChange, FileOp};
pub use deployment::{
    DeploymentState, ProbeResult, ReplicaStatus, VerifiedDeployment, WorkloadEvent,
    WorkloadFailure, WorkloadSelector,
};
pub use domain_binding::{CertificateState, DomainBinding, DomainStatus, RecordCheck, RecordType};
pub use error::{ChangeSetError, ErrorCategory, Result, ShiplineError};
pub use session::{
    AttemptBudget, DeliveryRequest, FailureSummary, LifecycleSession, LiveDeployment, Narration,
    Phase, SessionId, MAX_ATTEMPTS, SessionLimits, SessionState,
};
