//! Shipline Core Library
//!
//! Deployment lifecycle orchestration: commit a change set, observe the
//! remote build, verify the rollout and its public endpoint, and only then
//! report the application live.

pub mod build_monitor;
pub mod capability;
pub mod classify;
pub mod config;
pub mod deploy_verifier;
pub mod domain;
pub mod domain_verifier;
pub mod fakes;
pub mod gateway;
pub mod git;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod platform;
pub mod poll;
pub mod remediation;
pub mod session_store;
pub mod telemetry;

pub use domain::{
    AttemptBudget, BuildFailureReason, BuildLedger, BuildRun, BuildStatus, CertificateState,
    ChangeSet, ChangeSetError, DeliveryRequest, DeploymentState, DomainBinding, DomainStatus,
    ErrorCategory, FailureSummary, FileChange, FileOp, LifecycleSession, LiveDeployment,
    Narration, Phase, ProbeResult, RecordCheck, RecordType, ReplicaStatus, Result, RevisionId,
    SessionId, SessionLimits, SessionState, ShiplineError, VerifiedDeployment, WorkloadEvent,
    WorkloadFailure, WorkloadSelector, MAX_ATTEMPTS,
};

pub use build_monitor::BuildMonitor;
pub use capability::{
    BuildProvider, DomainRegistrar, ProbeError, Prober, PushOutcome, Remediator, SessionStore,
    SourceControl, StatusSink, StatusUpdate, TracingSink, WorkloadInspector,
};
pub use classify::{classify_build_log, classify_workload_events, Classification};
pub use config::ShiplineConfig;
pub use deploy_verifier::DeploymentVerifier;
pub use domain_verifier::DomainVerifier;
pub use gateway::{RepositoryGateway, WorkspaceGuard, WorkspaceLocks};
pub use git::GitSourceControl;
pub use metrics::METRICS;
pub use orchestrator::{Capabilities, LifecycleOrchestrator};
pub use platform::{HttpProber, PlatformClient};
pub use remediation::{CommandRemediator, NoRemediation};
pub use session_store::FsSessionStore;

/// Crate version, as recorded in Cargo metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
