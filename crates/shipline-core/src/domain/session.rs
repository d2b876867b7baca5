//! Lifecycle sessions: one end-to-end delivery from commit to verified live.
//!
//! The session owns the phase state machine, the per-phase retry budgets and
//! the narration handed back to the caller. Transitions are validated in
//! [`LifecycleSession::advance`]; entering [`SessionState::Live`] additionally
//! requires a [`VerifiedDeployment`] from the latest verification attempt.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::build::{BuildFailureReason, BuildLedger, BuildRun, RevisionId};
use crate::domain::change_set::ChangeSet;
use crate::domain::deployment::{
    DeploymentState, VerifiedDeployment, WorkloadFailure, WorkloadSelector,
};
use crate::domain::domain_binding::{DomainBinding, DomainStatus};
use crate::domain::error::{Result, ShiplineError};

/// Phase of a lifecycle session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Committing,
    Building,
    Deploying,
    Verifying,
    VerifyingDomain,
    Live,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Live | Phase::Failed)
    }

    /// The transition table of the lifecycle state machine.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        match self {
            Committing => matches!(next, Building | Failed),
            Building => matches!(next, Building | Deploying | Failed),
            Deploying => matches!(next, Deploying | Verifying | Failed),
            Verifying => matches!(next, Live | VerifyingDomain | Deploying | Failed),
            // Domain verification never fails the session.
            VerifyingDomain => matches!(next, Live),
            Live | Failed => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Committing => "committing",
            Phase::Building => "building",
            Phase::Deploying => "deploying",
            Phase::Verifying => "verifying",
            Phase::VerifyingDomain => "verifying_domain",
            Phase::Live => "live",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// No phase ever runs more than this many attempts, whatever the configuration.
pub const MAX_ATTEMPTS: u32 = 3;

/// A hard attempt ceiling for one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptBudget {
    pub used: u32,
    pub max: u32,
}

impl AttemptBudget {
    /// `max` is clamped to [`MAX_ATTEMPTS`].
    pub fn new(max: u32) -> Self {
        Self {
            used: 0,
            max: max.min(MAX_ATTEMPTS),
        }
    }

    /// Start the next attempt, returning its 1-based number, or `None` once
    /// the ceiling is reached.
    pub fn begin(&mut self) -> Option<u32> {
        if self.is_exhausted() {
            return None;
        }
        self.used += 1;
        Some(self.used)
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.ceiling()
    }

    pub fn remaining(&self) -> u32 {
        self.ceiling().saturating_sub(self.used)
    }

    // A checkpoint written by hand may carry a larger `max`.
    fn ceiling(&self) -> u32 {
        self.max.min(MAX_ATTEMPTS)
    }
}

/// Unique identifier of a lifecycle session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        SessionId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything the caller asks for in one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    /// Workspace (application) identifier; sessions on one workspace are serialized.
    pub workspace: String,
    pub change_set: ChangeSet,
    pub selector: WorkloadSelector,
    /// Default public endpoint of the application.
    pub endpoint: String,
    #[serde(default)]
    pub domain: Option<DomainBinding>,
}

/// Why a session ended in `Failed`, kept in serializable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub phase: Phase,
    pub message: String,
    #[serde(default)]
    pub build_reason: Option<BuildFailureReason>,
    #[serde(default)]
    pub workload_failure: Option<WorkloadFailure>,
}

impl FailureSummary {
    pub fn from_error(phase: Phase, err: &ShiplineError) -> Self {
        Self {
            phase,
            message: err.to_string(),
            build_reason: err.reason(),
            workload_failure: err.workload_failure(),
        }
    }
}

/// Current state of the session. Each phase carries exactly the data it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SessionState {
    Committing,
    Building {
        revision: RevisionId,
    },
    Deploying {
        revision: RevisionId,
    },
    Verifying {
        revision: RevisionId,
    },
    VerifyingDomain {
        revision: RevisionId,
        endpoint: String,
    },
    Live {
        revision: RevisionId,
        endpoint: String,
        domain: Option<DomainStatus>,
    },
    Failed {
        summary: FailureSummary,
    },
}

impl SessionState {
    pub fn phase(&self) -> Phase {
        match self {
            SessionState::Committing => Phase::Committing,
            SessionState::Building { .. } => Phase::Building,
            SessionState::Deploying { .. } => Phase::Deploying,
            SessionState::Verifying { .. } => Phase::Verifying,
            SessionState::VerifyingDomain { .. } => Phase::VerifyingDomain,
            SessionState::Live { .. } => Phase::Live,
            SessionState::Failed { .. } => Phase::Failed,
        }
    }

    pub fn revision(&self) -> Option<&RevisionId> {
        match self {
            SessionState::Building { revision }
            | SessionState::Deploying { revision }
            | SessionState::Verifying { revision }
            | SessionState::VerifyingDomain { revision, .. }
            | SessionState::Live { revision, .. } => Some(revision),
            SessionState::Committing | SessionState::Failed { .. } => None,
        }
    }
}

/// Structured progress record emitted on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Narration {
    pub from: Phase,
    pub phase: Phase,
    pub attempt: u32,
    pub note: String,
    pub at: DateTime<Utc>,
}

/// Attempt ceilings applied to a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_build_attempts: u32,
    pub max_deploy_attempts: u32,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_build_attempts: 3,
            max_deploy_attempts: 3,
        }
    }
}

/// The end-to-end delivery operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleSession {
    pub id: SessionId,
    pub request: DeliveryRequest,
    pub state: SessionState,
    pub build: BuildLedger,
    pub deploy: AttemptBudget,
    /// Domain checks are counted but never capped.
    pub domain_checks: u32,
    /// Remote head observed on entry into Committing.
    pub base_remote_head: Option<RevisionId>,
    /// Digest of the last change set committed by this session.
    pub last_change_digest: Option<String>,
    pub latest_build: Option<BuildRun>,
    pub latest_deployment: Option<DeploymentState>,
    pub domain: Option<DomainBinding>,
    /// Proof from the most recent successful verification attempt.
    pub verified: Option<VerifiedDeployment>,
    pub narration: Vec<Narration>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LifecycleSession {
    pub fn new(request: DeliveryRequest, limits: SessionLimits) -> Self {
        let now = Utc::now();
        let domain = request.domain.clone();
        Self {
            id: SessionId::new(),
            request,
            state: SessionState::Committing,
            build: BuildLedger::new(limits.max_build_attempts),
            deploy: AttemptBudget::new(limits.max_deploy_attempts),
            domain_checks: 0,
            base_remote_head: None,
            last_change_digest: None,
            latest_build: None,
            latest_deployment: None,
            domain,
            verified: None,
            narration: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Attempt counter that applies to `phase`.
    pub fn attempt_for(&self, phase: Phase) -> u32 {
        match phase {
            Phase::Committing => 1,
            Phase::Building => self.build.budget.used.max(1),
            Phase::Deploying | Phase::Verifying => self.deploy.used.max(1),
            Phase::VerifyingDomain => self.domain_checks.max(1),
            Phase::Live | Phase::Failed => self.build.budget.used + self.deploy.used,
        }
    }

    /// Record a successful verification attempt.
    pub fn record_verified(&mut self, verified: VerifiedDeployment) {
        self.latest_deployment = Some(verified.state().clone());
        self.verified = Some(verified);
    }

    /// Move to `next`, validating the transition, and return the narration
    /// entry describing it.
    pub fn advance(&mut self, next: SessionState, note: impl Into<String>) -> Result<Narration> {
        let from = self.phase();
        let to = next.phase();
        if !from.can_transition_to(to) {
            return Err(ShiplineError::InvalidTransition { from, to });
        }
        if to == Phase::Live && self.verified.is_none() {
            return Err(ShiplineError::InvalidTransition { from, to });
        }
        if to == Phase::Deploying {
            // A new deploy attempt invalidates any earlier proof.
            self.verified = None;
        }

        // Entering a retried phase narrates the attempt about to start.
        let attempt = match to {
            Phase::Building => self.build.budget.used + 1,
            Phase::Deploying => self.deploy.used + 1,
            Phase::VerifyingDomain => self.domain_checks + 1,
            other => self.attempt_for(other),
        };

        self.state = next;
        self.updated_at = Utc::now();
        let narration = Narration {
            from,
            phase: to,
            attempt,
            note: note.into(),
            at: self.updated_at,
        };
        self.narration.push(narration.clone());
        Ok(narration)
    }

    /// Move to `Failed` with a summary of `err`.
    pub fn fail(&mut self, err: &ShiplineError) -> Result<Narration> {
        let summary = FailureSummary::from_error(self.phase(), err);
        let note = summary.message.clone();
        self.advance(SessionState::Failed { summary }, note)
    }
}

/// What the caller receives when a session reaches Live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveDeployment {
    pub session_id: SessionId,
    pub revision: RevisionId,
    pub endpoint: String,
    pub domain: Option<DomainBinding>,
    pub build_attempts: u32,
    pub deploy_attempts: u32,
    pub narration: Vec<Narration>,
}
