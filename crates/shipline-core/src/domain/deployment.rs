//! Observed runtime state of a deployed workload.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label selector identifying the workload's replicas (e.g. `app=web`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadSelector(pub String);

impl WorkloadSelector {
    pub fn new(selector: impl Into<String>) -> Self {
        WorkloadSelector(selector.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkloadSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replica counters as reported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub desired: u32,
    pub ready: u32,
    pub restarts: u32,
}

impl ReplicaStatus {
    pub fn new(desired: u32, ready: u32, restarts: u32) -> Self {
        Self {
            desired,
            ready,
            restarts,
        }
    }

    /// Every desired replica is ready and none has restarted.
    pub fn is_healthy(&self) -> bool {
        self.desired > 0 && self.ready == self.desired && self.restarts == 0
    }
}

/// Result of one reachability probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ProbeResult {
    Status(u16),
    NetworkError(String),
}

impl ProbeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeResult::Status(code) if (200..300).contains(code))
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeResult::Status(code) => write!(f, "HTTP {code}"),
            ProbeResult::NetworkError(err) => write!(f, "network error: {err}"),
        }
    }
}

/// Snapshot of the workload at one instant. Always re-queried, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub desired_replicas: u32,
    pub ready_replicas: u32,
    pub restart_count: u32,
    pub last_probe: Option<ProbeResult>,
    pub observed_at: DateTime<Utc>,
}

impl DeploymentState {
    pub fn observed(status: ReplicaStatus) -> Self {
        Self {
            desired_replicas: status.desired,
            ready_replicas: status.ready,
            restart_count: status.restarts,
            last_probe: None,
            observed_at: Utc::now(),
        }
    }

    pub fn replicas(&self) -> ReplicaStatus {
        ReplicaStatus::new(
            self.desired_replicas,
            self.ready_replicas,
            self.restart_count,
        )
    }

    pub fn is_scheduler_healthy(&self) -> bool {
        self.replicas().is_healthy()
    }
}

/// A scheduler event attached to the workload (e.g. `BackOff`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadEvent {
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl WorkloadEvent {
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Classified reason a rollout never became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadFailure {
    CrashLoop,
    ImageUnavailable,
    Unschedulable,
}

impl fmt::Display for WorkloadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkloadFailure::CrashLoop => "crash_loop",
            WorkloadFailure::ImageUnavailable => "image_unavailable",
            WorkloadFailure::Unschedulable => "unschedulable",
        })
    }
}

/// Proof that the scheduler state and the reachability check held together
/// during one verification attempt. Only the deployment verifier builds it,
/// and entering Live requires one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedDeployment {
    state: DeploymentState,
    endpoint: String,
    verified_at: DateTime<Utc>,
}

impl VerifiedDeployment {
    pub(crate) fn new(state: DeploymentState, endpoint: impl Into<String>) -> Self {
        Self {
            state,
            endpoint: endpoint.into(),
            verified_at: Utc::now(),
        }
    }

    pub fn state(&self) -> &DeploymentState {
        &self.state
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn verified_at(&self) -> DateTime<Utc> {
        self.verified_at
    }
}
