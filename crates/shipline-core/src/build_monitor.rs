//! Observes remote builds for pushed revisions.
//!
//! Pushing triggers CI; the monitor never starts or cancels a build. It polls
//! the provider until the run is terminal, classifies failures and enforces
//! the per-session attempt budget kept in the [`BuildLedger`].

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::BuildProvider;
use crate::classify::classify_build_log;
use crate::config::BuildConfig;
use crate::domain::{
    BuildFailureReason, BuildLedger, BuildRun, BuildStatus, Phase, Result, RevisionId,
    ShiplineError,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::poll::{ensure_active, sleep_or_cancel};

/// Polls a [`BuildProvider`] and turns what it sees into attempt outcomes.
pub struct BuildMonitor {
    provider: Arc<dyn BuildProvider>,
    config: BuildConfig,
}

impl BuildMonitor {
    pub fn new(provider: Arc<dyn BuildProvider>, config: BuildConfig) -> Self {
        Self { provider, config }
    }

    /// Start and observe a new attempt for `revision`.
    ///
    /// Returns the succeeded run, `BuildFailed` while budget remains, or
    /// `BuildExhausted` when the final attempt failed.
    pub async fn run(
        &self,
        revision: &RevisionId,
        ledger: &mut BuildLedger,
        cancel: &CancellationToken,
    ) -> Result<BuildRun> {
        let attempt = self.begin(revision, ledger)?;
        self.observe(revision, attempt, ledger, cancel).await
    }

    /// Claim the next attempt for `revision` without polling.
    ///
    /// A revision can only be built once per session; a budget that is
    /// already spent never yields another attempt.
    pub fn begin(&self, revision: &RevisionId, ledger: &mut BuildLedger) -> Result<u32> {
        if ledger.has_attempted(revision) {
            return Err(ShiplineError::UnmodifiedRevision(revision.clone()));
        }
        let Some(attempt) = ledger.budget.begin() else {
            return Err(ShiplineError::BuildExhausted {
                attempts: ledger.budget.used,
                reason: ledger.last_failure.unwrap_or(BuildFailureReason::Unknown),
            });
        };
        ledger.attempted.insert(revision.clone());
        METRICS.inc_build_attempts();
        info!(revision = %revision.short(), attempt, max = ledger.budget.max, "build attempt started");
        Ok(attempt)
    }

    /// Poll an attempt that was already claimed (e.g. after resuming a session).
    pub async fn observe(
        &self,
        revision: &RevisionId,
        attempt: u32,
        ledger: &mut BuildLedger,
        cancel: &CancellationToken,
    ) -> Result<BuildRun> {
        let run = self.poll_until_terminal(revision, attempt, cancel).await?;
        self.evaluate(run, ledger)
    }

    async fn poll_until_terminal(
        &self,
        revision: &RevisionId,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<BuildRun> {
        let started = Instant::now();
        let deadline = started + self.config.timeout();
        let mut last_status = BuildStatus::Pending;

        loop {
            ensure_active(cancel, Phase::Building)?;

            match self.provider.get_run_status(revision).await {
                Ok(mut run) => {
                    if !last_status.can_advance_to(run.status) {
                        debug!(
                            revision = %revision.short(),
                            from = ?last_status,
                            to = ?run.status,
                            "ignoring backwards build status"
                        );
                    } else {
                        last_status = run.status;
                        obs::emit_build_observed(revision.as_str(), run.status, attempt);
                        if run.status.is_terminal() {
                            run.attempt = attempt;
                            return Ok(run);
                        }
                    }
                }
                Err(e) => {
                    warn!(revision = %revision.short(), error = %e, "build status poll failed; retrying");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ShiplineError::BuildTimeout {
                    revision: revision.clone(),
                    waited_secs: now.duration_since(started).as_secs(),
                });
            }
            let wait = self.config.poll_interval().min(deadline - now);
            sleep_or_cancel(wait, cancel, Phase::Building).await?;
        }
    }

    fn evaluate(&self, mut run: BuildRun, ledger: &mut BuildLedger) -> Result<BuildRun> {
        if run.succeeded() {
            info!(revision = %run.revision.short(), attempt = run.attempt, "build succeeded");
            return Ok(run);
        }

        if matches!(run.failure, None | Some(BuildFailureReason::Unknown)) {
            let classification = classify_build_log(&run.log_excerpt);
            run.failure = Some(classification.reason);
            if let Some(evidence) = classification.evidence {
                debug!(reason = %classification.reason, evidence = %evidence, "classified build log");
            }
        }
        let reason = run.reason();
        ledger.last_failure = Some(reason);
        warn!(
            revision = %run.revision.short(),
            attempt = run.attempt,
            reason = %reason,
            "build failed"
        );

        if ledger.budget.is_exhausted() {
            return Err(ShiplineError::BuildExhausted {
                attempts: ledger.budget.used,
                reason,
            });
        }
        Err(ShiplineError::BuildFailed { run })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{BuildScript, ScriptedBuildProvider};
    use std::time::Duration;

    fn monitor(provider: Arc<ScriptedBuildProvider>) -> BuildMonitor {
        BuildMonitor::new(provider, BuildConfig::default())
    }

    fn rev(n: u32) -> RevisionId {
        RevisionId::new(format!("{n:040x}"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_polling() {
        let provider = Arc::new(ScriptedBuildProvider::new());
        provider.push_script(BuildScript::succeeds_after(3));
        let mut ledger = BuildLedger::new(3);

        let run = monitor(provider.clone())
            .run(&rev(1), &mut ledger, &CancellationToken::new())
            .await
            .expect("build succeeds");
        assert!(run.succeeded());
        assert_eq!(run.attempt, 1);
        assert_eq!(provider.polls(&rev(1)), 4);
        assert_eq!(ledger.budget.used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_classified_from_log() {
        let provider = Arc::new(ScriptedBuildProvider::new());
        provider.push_script(BuildScript::fails_with_log(
            "npm ERR! Error: Cannot find module 'left-pad'",
        ));
        let mut ledger = BuildLedger::new(3);

        let err = monitor(provider)
            .run(&rev(1), &mut ledger, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ShiplineError::BuildFailed { run } => {
                assert_eq!(run.reason(), BuildFailureReason::DependencyMissing);
                assert_eq!(run.attempt, 1);
            }
            other => panic!("expected BuildFailed, got {other:?}"),
        }
        assert_eq!(ledger.last_failure, Some(BuildFailureReason::DependencyMissing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_reason_is_kept() {
        let provider = Arc::new(ScriptedBuildProvider::new());
        provider.push_script(
            BuildScript::fails_with_log("something odd")
                .with_reason(BuildFailureReason::ConfigMismatch),
        );
        let mut ledger = BuildLedger::new(3);
        let err = monitor(provider)
            .run(&rev(1), &mut ledger, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(BuildFailureReason::ConfigMismatch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_failure_exhausts_and_fourth_never_polls() {
        let provider = Arc::new(ScriptedBuildProvider::new());
        for _ in 0..4 {
            provider.push_script(BuildScript::fails_with_log("error TS2322: Type 'x'"));
        }
        let monitor = monitor(provider.clone());
        let mut ledger = BuildLedger::new(3);
        let cancel = CancellationToken::new();

        for n in 1..=2 {
            let err = monitor.run(&rev(n), &mut ledger, &cancel).await.unwrap_err();
            assert!(matches!(err, ShiplineError::BuildFailed { .. }));
        }
        let err = monitor.run(&rev(3), &mut ledger, &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            ShiplineError::BuildExhausted {
                attempts: 3,
                reason: BuildFailureReason::TypeCheckFailed
            }
        ));

        let err = monitor.run(&rev(4), &mut ledger, &cancel).await.unwrap_err();
        assert!(matches!(err, ShiplineError::BuildExhausted { attempts: 3, .. }));
        assert_eq!(provider.polls(&rev(4)), 0);
        assert_eq!(ledger.budget.used, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_revision_twice_is_rejected() {
        let provider = Arc::new(ScriptedBuildProvider::new());
        provider.push_script(BuildScript::fails_with_log("boom"));
        let monitor = monitor(provider);
        let mut ledger = BuildLedger::new(3);
        let cancel = CancellationToken::new();

        monitor.run(&rev(1), &mut ledger, &cancel).await.unwrap_err();
        let err = monitor.run(&rev(1), &mut ledger, &cancel).await.unwrap_err();
        assert!(matches!(err, ShiplineError::UnmodifiedRevision(_)));
        assert_eq!(ledger.budget.used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_when_never_terminal() {
        let provider = Arc::new(ScriptedBuildProvider::new());
        provider.push_script(BuildScript::hangs());
        let mut ledger = BuildLedger::new(3);

        let err = monitor(provider)
            .run(&rev(1), &mut ledger, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ShiplineError::BuildTimeout { waited_secs, .. } => assert_eq!(waited_secs, 900),
            other => panic!("expected BuildTimeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_provider_errors_are_polled_through() {
        let provider = Arc::new(ScriptedBuildProvider::new());
        provider.push_script(BuildScript::succeeds_after(0).with_errors(2));
        let mut ledger = BuildLedger::new(3);

        let run = monitor(provider.clone())
            .run(&rev(1), &mut ledger, &CancellationToken::new())
            .await
            .expect("build succeeds");
        assert!(run.succeeded());
        assert_eq!(provider.polls(&rev(1)), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling_without_touching_remote() {
        let provider = Arc::new(ScriptedBuildProvider::new());
        provider.push_script(BuildScript::hangs());
        let monitor = monitor(provider.clone());
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(25)).await;
                cancel.cancel();
            })
        };
        let mut ledger = BuildLedger::new(3);
        let err = monitor.run(&rev(1), &mut ledger, &cancel).await.unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(
            err,
            ShiplineError::Cancelled {
                phase: Phase::Building
            }
        ));
        assert!(provider.polls(&rev(1)) <= 4);
    }
}
