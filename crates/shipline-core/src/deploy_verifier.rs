//! Deployment verification: scheduler readiness plus external reachability.
//!
//! A deployment only counts as verified when the scheduler reports every
//! replica ready with no restarts *and* the public endpoint answers 2xx in the
//! same attempt. The result is a [`VerifiedDeployment`], which nothing outside
//! this crate can forge. Verification only reads; calling it again against an
//! unchanged workload gives the same answer.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capability::{Prober, WorkloadInspector};
use crate::classify::classify_workload_events;
use crate::config::DeployConfig;
use crate::domain::{
    DeploymentState, Phase, ProbeResult, ReplicaStatus, Result, ShiplineError,
    VerifiedDeployment, WorkloadSelector, MAX_ATTEMPTS,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::poll::{ensure_active, sleep_or_cancel};

pub struct DeploymentVerifier {
    inspector: Arc<dyn WorkloadInspector>,
    prober: Arc<dyn Prober>,
    config: DeployConfig,
}

impl DeploymentVerifier {
    pub fn new(
        inspector: Arc<dyn WorkloadInspector>,
        prober: Arc<dyn Prober>,
        config: DeployConfig,
    ) -> Self {
        Self {
            inspector,
            prober,
            config,
        }
    }

    /// Wait for a healthy rollout, then confirm the endpoint is reachable.
    pub async fn verify(
        &self,
        selector: &WorkloadSelector,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<VerifiedDeployment> {
        self.await_rollout(selector, cancel).await?;
        self.confirm_reachable(selector, url, cancel).await
    }

    /// Poll the scheduler until every desired replica is ready.
    ///
    /// On timeout the workload's events are inspected; the error carries the
    /// classified failure, or `None` when nothing explains the stall.
    pub async fn await_rollout(
        &self,
        selector: &WorkloadSelector,
        cancel: &CancellationToken,
    ) -> Result<DeploymentState> {
        let deadline = Instant::now() + self.config.rollout_timeout();
        let mut last: Option<ReplicaStatus> = None;

        loop {
            ensure_active(cancel, Phase::Deploying)?;

            match self.inspector.get_replica_status(selector).await {
                Ok(status) if status.is_healthy() => {
                    info!(
                        selector = %selector,
                        ready = status.ready,
                        desired = status.desired,
                        "rollout healthy"
                    );
                    return Ok(DeploymentState::observed(status));
                }
                Ok(status) => last = Some(status),
                Err(e) => warn!(selector = %selector, error = %e, "replica status read failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = self.config.poll_interval().min(deadline - now);
            sleep_or_cancel(wait, cancel, Phase::Deploying).await?;
        }

        let events = match self.inspector.get_failure_events(selector).await {
            Ok(events) => events,
            Err(e) => {
                warn!(selector = %selector, error = %e, "failure events unavailable");
                Vec::new()
            }
        };
        let failure = classify_workload_events(&events, last);
        warn!(
            selector = %selector,
            replicas = ?last,
            failure = ?failure,
            "rollout did not become ready"
        );
        Err(ShiplineError::WorkloadNotReady {
            selector: selector.to_string(),
            failure,
        })
    }

    /// Probe `url` and re-read the scheduler after a 2xx.
    ///
    /// Both checks must hold at the same instant; a scheduler that degraded
    /// between rollout and probe fails the attempt.
    pub async fn confirm_reachable(
        &self,
        selector: &WorkloadSelector,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<VerifiedDeployment> {
        let attempts = self.config.probe_attempts.clamp(1, MAX_ATTEMPTS);
        let mut last = String::from("no probe sent");

        for attempt in 1..=attempts {
            ensure_active(cancel, Phase::Verifying)?;

            METRICS.inc_probes();
            let result = match self.prober.http_get(url, self.config.probe_timeout()).await {
                Ok(status) => ProbeResult::Status(status),
                Err(e) => ProbeResult::NetworkError(e.to_string()),
            };
            obs::emit_probe_result(url, attempt, &result);

            if result.is_success() {
                match self.inspector.get_replica_status(selector).await {
                    Ok(status) if status.is_healthy() => {
                        let mut state = DeploymentState::observed(status);
                        state.last_probe = Some(result);
                        return Ok(VerifiedDeployment::new(state, url));
                    }
                    Ok(status) => {
                        last = format!(
                            "{result} but scheduler reports {}/{} ready, {} restarts",
                            status.ready, status.desired, status.restarts
                        );
                    }
                    Err(e) => last = format!("{result} but scheduler read failed: {e}"),
                }
            } else {
                last = result.to_string();
            }

            if attempt < attempts {
                sleep_or_cancel(self.config.probe_backoff(), cancel, Phase::Verifying).await?;
            }
        }

        Err(ShiplineError::Unreachable {
            url: url.to_string(),
            attempts,
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ProbeError;
    use crate::domain::{WorkloadEvent, WorkloadFailure};
    use crate::fakes::{FakeWorkloadInspector, ScriptedProber};

    const URL: &str = "https://web.example.app";

    fn selector() -> WorkloadSelector {
        WorkloadSelector::new("app=web")
    }

    fn verifier(
        inspector: &Arc<FakeWorkloadInspector>,
        prober: &Arc<ScriptedProber>,
    ) -> DeploymentVerifier {
        DeploymentVerifier::new(inspector.clone(), prober.clone(), DeployConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_and_reachable() {
        let inspector = Arc::new(FakeWorkloadInspector::healthy(1));
        let prober = Arc::new(ScriptedProber::always(Ok(200)));

        let verified = verifier(&inspector, &prober)
            .verify(&selector(), URL, &CancellationToken::new())
            .await
            .expect("verified");
        assert_eq!(verified.endpoint(), URL);
        assert_eq!(verified.state().ready_replicas, 1);
        assert_eq!(verified.state().last_probe, Some(ProbeResult::Status(200)));
        assert_eq!(prober.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_twice_is_idempotent() {
        let inspector = Arc::new(FakeWorkloadInspector::healthy(2));
        let prober = Arc::new(ScriptedProber::always(Ok(200)));
        let verifier = verifier(&inspector, &prober);
        let cancel = CancellationToken::new();

        let first = verifier.verify(&selector(), URL, &cancel).await.expect("first");
        let second = verifier.verify(&selector(), URL, &cancel).await.expect("second");
        assert_eq!(first.state().replicas(), second.state().replicas());
        assert_eq!(inspector.current(), ReplicaStatus::new(2, 2, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_waits_for_readiness() {
        let inspector = Arc::new(FakeWorkloadInspector::healthy(2));
        inspector.queue([ReplicaStatus::new(2, 0, 0), ReplicaStatus::new(2, 1, 0)]);
        let prober = Arc::new(ScriptedProber::always(Ok(200)));

        let state = verifier(&inspector, &prober)
            .await_rollout(&selector(), &CancellationToken::new())
            .await
            .expect("rollout");
        assert!(state.is_scheduler_healthy());
        assert_eq!(inspector.replica_reads(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_timeout_classifies_crash_loop() {
        let inspector = Arc::new(FakeWorkloadInspector::stuck(ReplicaStatus::new(1, 0, 4)));
        inspector.set_events(vec![WorkloadEvent::new(
            "BackOff",
            "Back-off restarting failed container",
        )]);
        let prober = Arc::new(ScriptedProber::always(Ok(200)));

        let err = verifier(&inspector, &prober)
            .verify(&selector(), URL, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.workload_failure(), Some(WorkloadFailure::CrashLoop));
        assert_eq!(prober.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_timeout_without_signal() {
        let inspector = Arc::new(FakeWorkloadInspector::stuck(ReplicaStatus::new(1, 0, 0)));
        let prober = Arc::new(ScriptedProber::always(Ok(200)));

        let err = verifier(&inspector, &prober)
            .await_rollout(&selector(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShiplineError::WorkloadNotReady { failure: None, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_refused_three_times_is_unreachable() {
        let inspector = Arc::new(FakeWorkloadInspector::healthy(1));
        let prober = Arc::new(ScriptedProber::always(Err(ProbeError::ConnectionRefused)));

        let err = verifier(&inspector, &prober)
            .verify(&selector(), URL, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ShiplineError::Unreachable { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(last.contains("connection refused"));
            }
            other => panic!("expected Unreachable, got {other:?}"),
        }
        assert_eq!(prober.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_attempts_never_exceed_three() {
        let inspector = Arc::new(FakeWorkloadInspector::healthy(1));
        let prober = Arc::new(ScriptedProber::always(Err(ProbeError::ConnectionRefused)));
        let config = DeployConfig {
            probe_attempts: 8,
            ..DeployConfig::default()
        };

        let err = DeploymentVerifier::new(inspector, prober.clone(), config)
            .confirm_reachable(&selector(), URL, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShiplineError::Unreachable { attempts: 3, .. }));
        assert_eq!(prober.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_recovers_within_attempts() {
        let inspector = Arc::new(FakeWorkloadInspector::healthy(1));
        let prober = Arc::new(ScriptedProber::always(Ok(200)));
        prober.queue([Ok(503), Err(ProbeError::Timeout(std::time::Duration::from_secs(10)))]);

        verifier(&inspector, &prober)
            .verify(&selector(), URL, &CancellationToken::new())
            .await
            .expect("third probe succeeds");
        assert_eq!(prober.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_2xx_with_degraded_scheduler_is_not_verified() {
        let inspector = Arc::new(FakeWorkloadInspector::healthy(1));
        let prober = Arc::new(ScriptedProber::always(Ok(200)));
        let verifier = verifier(&inspector, &prober);
        let cancel = CancellationToken::new();

        verifier.await_rollout(&selector(), &cancel).await.expect("rollout");
        inspector.set_status(ReplicaStatus::new(1, 1, 1));
        let err = verifier
            .confirm_reachable(&selector(), URL, &cancel)
            .await
            .unwrap_err();
        match err {
            ShiplineError::Unreachable { last, .. } => assert!(last.contains("1 restarts")),
            other => panic!("expected Unreachable, got {other:?}"),
        }
    }
}
