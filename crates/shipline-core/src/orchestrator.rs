//! The lifecycle orchestrator: commit, build, deploy, verify, go live.
//!
//! Drives one [`LifecycleSession`] through its phases on a single task. Every
//! transition is validated by the session, checkpointed to the
//! [`SessionStore`] and published to the [`StatusSink`]. The only way to
//! publish `Live` is to enter [`SessionState::Live`], which the session
//! refuses without a proof from the latest verification attempt.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::build_monitor::BuildMonitor;
use crate::capability::{
    BuildProvider, DomainRegistrar, Prober, Remediator, SessionStore, SourceControl, StatusSink,
    StatusUpdate, WorkloadInspector,
};
use crate::config::ShiplineConfig;
use crate::deploy_verifier::DeploymentVerifier;
use crate::domain::{
    DeliveryRequest, DomainBinding, DomainStatus, LifecycleSession, LiveDeployment, Phase,
    Result, RevisionId, SessionId, SessionLimits, SessionState, ShiplineError,
    WorkloadSelector,
};
use crate::domain_verifier::DomainVerifier;
use crate::gateway::{RepositoryGateway, WorkspaceLocks};
use crate::metrics::METRICS;
use crate::obs;
use crate::poll::ensure_active;

/// Everything the orchestrator reaches through.
pub struct Capabilities {
    pub source: Arc<dyn SourceControl>,
    pub builds: Arc<dyn BuildProvider>,
    pub workloads: Arc<dyn WorkloadInspector>,
    pub prober: Arc<dyn Prober>,
    pub registrar: Arc<dyn DomainRegistrar>,
    pub remediator: Arc<dyn Remediator>,
    pub store: Arc<dyn SessionStore>,
    pub sink: Arc<dyn StatusSink>,
}

/// Next state plus the narration note explaining why.
type Step = (SessionState, String);

pub struct LifecycleOrchestrator {
    gateway: RepositoryGateway,
    builds: BuildMonitor,
    deployments: DeploymentVerifier,
    domains: DomainVerifier,
    remediator: Arc<dyn Remediator>,
    store: Arc<dyn SessionStore>,
    sink: Arc<dyn StatusSink>,
    limits: SessionLimits,
}

impl LifecycleOrchestrator {
    pub fn new(config: &ShiplineConfig, caps: Capabilities) -> Self {
        Self::with_locks(config, caps, Arc::new(WorkspaceLocks::new()))
    }

    /// Share workspace locks with other orchestrators in the process.
    pub fn with_locks(
        config: &ShiplineConfig,
        caps: Capabilities,
        locks: Arc<WorkspaceLocks>,
    ) -> Self {
        Self {
            gateway: RepositoryGateway::with_locks(caps.source, locks),
            builds: BuildMonitor::new(caps.builds, config.build.clone()),
            deployments: DeploymentVerifier::new(
                caps.workloads,
                caps.prober,
                config.deploy.clone(),
            ),
            domains: DomainVerifier::new(caps.registrar, config.domain.clone()),
            remediator: caps.remediator,
            store: caps.store,
            sink: caps.sink,
            limits: config.session_limits(),
        }
    }

    /// Run a new delivery to a terminal state.
    ///
    /// Waits (FIFO) while another session holds the same workspace.
    pub async fn deliver(
        &self,
        request: DeliveryRequest,
        cancel: &CancellationToken,
    ) -> Result<LiveDeployment> {
        let mut session = LifecycleSession::new(request, self.limits);
        METRICS.inc_sessions_started();
        let span = obs::session_span(session.id.as_str());
        async {
            obs::emit_session_started(session.id.as_str(), &session.request.workspace);
            let _guard = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ShiplineError::Cancelled { phase: Phase::Committing });
                }
                guard = self.gateway.lock(&session.request.workspace) => guard?,
            };
            self.checkpoint(&session).await;
            self.drive(&mut session, cancel).await
        }
        .instrument(span)
        .await
    }

    /// Continue a checkpointed session from its recorded phase.
    pub async fn resume(
        &self,
        id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<LiveDeployment> {
        let mut session = self.store.load(id).await?;
        let span = obs::session_span(session.id.as_str());
        async {
            info!(phase = %session.phase(), "resuming session");
            let _guard = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ShiplineError::Cancelled { phase: session.phase() });
                }
                guard = self.gateway.lock(&session.request.workspace) => guard?,
            };
            self.drive(&mut session, cancel).await
        }
        .instrument(span)
        .await
    }

    /// Re-check a custom domain outside of any session.
    pub async fn reverify_domain(
        &self,
        binding: DomainBinding,
        cancel: &CancellationToken,
    ) -> Result<DomainBinding> {
        self.domains.verify(binding, cancel).await
    }

    /// Checkpointed sessions that have not reached a terminal phase.
    pub async fn pending_sessions(&self) -> Result<Vec<LifecycleSession>> {
        let mut sessions = Vec::new();
        for id in self.store.list().await? {
            sessions.push(self.store.load(&id).await?);
        }
        Ok(sessions)
    }

    async fn drive(
        &self,
        session: &mut LifecycleSession,
        cancel: &CancellationToken,
    ) -> Result<LiveDeployment> {
        let started = Instant::now();
        loop {
            let step = match session.state.clone() {
                SessionState::Live { .. } => return self.finish_live(session, started).await,
                SessionState::Failed { summary } => {
                    return Err(ShiplineError::AlreadyTerminal {
                        session_id: session.id.to_string(),
                        phase: summary.phase,
                    });
                }
                state => {
                    let phase = state.phase();
                    match ensure_active(cancel, phase) {
                        Ok(()) => self.step(session, state, cancel).await,
                        Err(e) => Err(e),
                    }
                }
            };

            match step {
                Ok((next, note)) => self.transition(session, next, note).await?,
                Err(err @ ShiplineError::Cancelled { .. }) => {
                    warn!(phase = %session.phase(), "session cancelled; checkpoint kept");
                    self.checkpoint(session).await;
                    return Err(err);
                }
                Err(err) => {
                    self.fail(session, &err, started).await?;
                    return Err(err);
                }
            }
        }
    }

    async fn step(
        &self,
        session: &mut LifecycleSession,
        state: SessionState,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        match state {
            SessionState::Committing => self.commit(session).await,
            SessionState::Building { revision } => self.build(session, revision, cancel).await,
            SessionState::Deploying { revision } => self.deploy(session, revision, cancel).await,
            SessionState::Verifying { revision } => self.verify(session, revision, cancel).await,
            SessionState::VerifyingDomain { revision, endpoint } => {
                self.verify_domain(session, revision, endpoint, cancel).await
            }
            SessionState::Live { .. } | SessionState::Failed { .. } => {
                Err(ShiplineError::AlreadyTerminal {
                    session_id: session.id.to_string(),
                    phase: session.phase(),
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    async fn commit(&self, session: &mut LifecycleSession) -> Result<Step> {
        let current = self.gateway.remote_head().await?;
        match &session.base_remote_head {
            Some(base) if *base != current => {
                // An earlier run of this session pushed before being interrupted.
                info!(revision = %current.short(), "remote already advanced; skipping commit");
                session.last_change_digest = Some(session.request.change_set.digest());
                return Ok((
                    SessionState::Building { revision: current },
                    "change set already pushed".to_string(),
                ));
            }
            Some(_) => {}
            None => {
                session.base_remote_head = Some(current);
                self.checkpoint(session).await;
            }
        }

        let revision = self.gateway.commit(&session.request.change_set).await?;
        session.last_change_digest = Some(session.request.change_set.digest());
        let files = session.request.change_set.changes.len();
        Ok((
            SessionState::Building {
                revision: revision.clone(),
            },
            format!("pushed {} ({files} files)", revision.short()),
        ))
    }

    async fn build(
        &self,
        session: &mut LifecycleSession,
        revision: RevisionId,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        let outcome = if session.build.has_attempted(&revision) {
            // Resumed mid-build: the remote job is still ours to observe.
            let attempt = session.build.budget.used;
            self.builds
                .observe(&revision, attempt, &mut session.build, cancel)
                .await
        } else {
            let attempt = self.builds.begin(&revision, &mut session.build)?;
            self.checkpoint(session).await;
            self.builds
                .observe(&revision, attempt, &mut session.build, cancel)
                .await
        };

        match outcome {
            Ok(run) => {
                let note = format!("build succeeded on attempt {}", run.attempt);
                session.latest_build = Some(run);
                Ok((SessionState::Deploying { revision }, note))
            }
            Err(ShiplineError::BuildFailed { run }) => {
                session.latest_build = Some(run.clone());
                let reason = run.reason();
                if !reason.is_fixable() {
                    return Err(ShiplineError::Unfixable { reason });
                }

                let Some(fix) = self.remediator.propose_fix(&run).await? else {
                    return Err(ShiplineError::Remediation(format!(
                        "no corrective change available for {reason}"
                    )));
                };
                let digest = fix.digest();
                if session.last_change_digest.as_deref() == Some(digest.as_str()) {
                    return Err(ShiplineError::Remediation(format!(
                        "corrective change for {reason} repeats the previous change"
                    )));
                }

                let corrected = self.gateway.commit(&fix).await?;
                if session.build.has_attempted(&corrected) {
                    return Err(ShiplineError::UnmodifiedRevision(corrected));
                }
                session.last_change_digest = Some(digest);
                Ok((
                    SessionState::Building {
                        revision: corrected.clone(),
                    },
                    format!("{reason}: pushed corrective change {}", corrected.short()),
                ))
            }
            Err(e) => Err(e),
        }
    }

    async fn deploy(
        &self,
        session: &mut LifecycleSession,
        revision: RevisionId,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        let selector = session.request.selector.clone();
        let Some(attempt) = session.deploy.begin() else {
            return Err(ShiplineError::DeployExhausted {
                attempts: session.deploy.used,
                last: Box::new(not_ready(&selector)),
            });
        };
        METRICS.inc_deploy_attempts();
        self.checkpoint(session).await;
        info!(attempt, max = session.deploy.max, "awaiting rollout");

        match self.deployments.await_rollout(&selector, cancel).await {
            Ok(state) => {
                let note = format!(
                    "{}/{} replicas ready",
                    state.ready_replicas, state.desired_replicas
                );
                session.latest_deployment = Some(state);
                Ok((SessionState::Verifying { revision }, note))
            }
            Err(err @ ShiplineError::WorkloadNotReady { failure: None, .. }) => {
                if session.deploy.is_exhausted() {
                    return Err(ShiplineError::DeployExhausted {
                        attempts: session.deploy.used,
                        last: Box::new(err),
                    });
                }
                Ok((SessionState::Deploying { revision }, format!("{err}; retrying")))
            }
            Err(e) => Err(e),
        }
    }

    async fn verify(
        &self,
        session: &mut LifecycleSession,
        revision: RevisionId,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        let selector = session.request.selector.clone();
        let endpoint = session.request.endpoint.clone();

        match self
            .deployments
            .confirm_reachable(&selector, &endpoint, cancel)
            .await
        {
            Ok(verified) => {
                session.record_verified(verified);
                if session.domain.is_some() {
                    Ok((
                        SessionState::VerifyingDomain { revision, endpoint },
                        "endpoint verified; checking custom domain".to_string(),
                    ))
                } else {
                    Ok((
                        SessionState::Live {
                            revision,
                            endpoint,
                            domain: None,
                        },
                        "endpoint verified live".to_string(),
                    ))
                }
            }
            Err(err @ ShiplineError::Unreachable { .. }) => {
                if session.deploy.is_exhausted() {
                    return Err(ShiplineError::DeployExhausted {
                        attempts: session.deploy.used,
                        last: Box::new(err),
                    });
                }
                Ok((SessionState::Deploying { revision }, format!("{err}; retrying")))
            }
            Err(e) => Err(e),
        }
    }

    async fn verify_domain(
        &self,
        session: &mut LifecycleSession,
        revision: RevisionId,
        endpoint: String,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        let Some(binding) = session.domain.clone() else {
            return Ok((
                SessionState::Live {
                    revision,
                    endpoint,
                    domain: None,
                },
                "endpoint verified live".to_string(),
            ));
        };

        let before = binding.checks;
        let checked = self.domains.verify(binding, cancel).await?;
        session.domain_checks += checked.checks.saturating_sub(before);
        let status = checked.status;
        let note = match status {
            DomainStatus::Active => format!("{} active", checked.hostname),
            DomainStatus::Pending => format!(
                "{} pending DNS or certificate; default endpoint live",
                checked.hostname
            ),
        };
        session.domain = Some(checked);
        Ok((
            SessionState::Live {
                revision,
                endpoint,
                domain: Some(status),
            },
            note,
        ))
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    async fn transition(
        &self,
        session: &mut LifecycleSession,
        next: SessionState,
        note: String,
    ) -> Result<()> {
        let narration = session.advance(next, note)?;
        obs::emit_phase_transition(
            session.id.as_str(),
            narration.from,
            narration.phase,
            narration.attempt,
        );
        self.sink.publish(&StatusUpdate::Transition {
            session_id: session.id.clone(),
            narration,
        });
        if !session.is_terminal() {
            self.checkpoint(session).await;
        }
        Ok(())
    }

    async fn fail(
        &self,
        session: &mut LifecycleSession,
        err: &ShiplineError,
        started: Instant,
    ) -> Result<()> {
        warn!(phase = %session.phase(), error = %err, "session failed");
        let narration = session.fail(err)?;
        obs::emit_phase_transition(
            session.id.as_str(),
            narration.from,
            narration.phase,
            narration.attempt,
        );
        self.sink.publish(&StatusUpdate::Transition {
            session_id: session.id.clone(),
            narration,
        });
        self.sink.publish(&StatusUpdate::Failed {
            session_id: session.id.clone(),
            message: err.to_string(),
        });
        METRICS.inc_sessions_failed();
        self.conclude(session, started).await;
        Ok(())
    }

    async fn finish_live(
        &self,
        session: &mut LifecycleSession,
        started: Instant,
    ) -> Result<LiveDeployment> {
        let SessionState::Live {
            revision, endpoint, ..
        } = session.state.clone()
        else {
            return Err(ShiplineError::InvalidTransition {
                from: session.phase(),
                to: Phase::Live,
            });
        };
        if session.verified.is_none() {
            return Err(ShiplineError::InvalidTransition {
                from: session.phase(),
                to: Phase::Live,
            });
        }

        self.sink.publish(&StatusUpdate::Live {
            session_id: session.id.clone(),
            revision: revision.clone(),
            endpoint: endpoint.clone(),
            domain: session.domain.clone(),
        });
        METRICS.inc_sessions_live();
        self.conclude(session, started).await;

        Ok(LiveDeployment {
            session_id: session.id.clone(),
            revision,
            endpoint,
            domain: session.domain.clone(),
            build_attempts: session.build.budget.used,
            deploy_attempts: session.deploy.used,
            narration: session.narration.clone(),
        })
    }

    /// Drop the checkpoint of a terminal session.
    async fn conclude(&self, session: &LifecycleSession, started: Instant) {
        if let Err(e) = self.store.remove(&session.id).await {
            obs::emit_checkpoint_error(session.id.as_str(), &e);
        }
        obs::emit_session_finished(
            session.id.as_str(),
            session.phase(),
            started.elapsed().as_millis() as u64,
        );
        METRICS.flush();
    }

    async fn checkpoint(&self, session: &LifecycleSession) {
        if let Err(e) = self.store.save(session).await {
            obs::emit_checkpoint_error(session.id.as_str(), &e);
        }
    }
}

fn not_ready(selector: &WorkloadSelector) -> ShiplineError {
    ShiplineError::WorkloadNotReady {
        selector: selector.to_string(),
        failure: None,
    }
}
