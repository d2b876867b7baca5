//! Global atomic counters for lifecycle observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when a session concludes).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Process-wide lifecycle counters.
pub struct Metrics {
    sessions_started: AtomicU64,
    sessions_live: AtomicU64,
    sessions_failed: AtomicU64,
    build_attempts: AtomicU64,
    deploy_attempts: AtomicU64,
    probes_sent: AtomicU64,
    domain_checks: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            sessions_started: AtomicU64::new(0),
            sessions_live: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            build_attempts: AtomicU64::new(0),
            deploy_attempts: AtomicU64::new(0),
            probes_sent: AtomicU64::new(0),
            domain_checks: AtomicU64::new(0),
        }
    }

    pub fn inc_sessions_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sessions_started", "counter incremented");
    }

    pub fn inc_sessions_live(&self) {
        self.sessions_live.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sessions_live", "counter incremented");
    }

    pub fn inc_sessions_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sessions_failed", "counter incremented");
    }

    pub fn inc_build_attempts(&self) {
        self.build_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "build_attempts", "counter incremented");
    }

    pub fn inc_deploy_attempts(&self) {
        self.deploy_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deploy_attempts", "counter incremented");
    }

    pub fn inc_probes(&self) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "probes_sent", "counter incremented");
    }

    pub fn inc_domain_checks(&self) {
        self.domain_checks.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "domain_checks", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a session, CLI exit)
    /// rather than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            sessions_started = self.sessions_started(),
            sessions_live = self.sessions_live(),
            sessions_failed = self.sessions_failed(),
            build_attempts = self.build_attempts(),
            deploy_attempts = self.deploy_attempts(),
            probes_sent = self.probes_sent(),
            domain_checks = self.domain_checks(),
        );
    }

    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }

    pub fn sessions_live(&self) -> u64 {
        self.sessions_live.load(Ordering::Relaxed)
    }

    pub fn sessions_failed(&self) -> u64 {
        self.sessions_failed.load(Ordering::Relaxed)
    }

    pub fn build_attempts(&self) -> u64 {
        self.build_attempts.load(Ordering::Relaxed)
    }

    pub fn deploy_attempts(&self) -> u64 {
        self.deploy_attempts.load(Ordering::Relaxed)
    }

    pub fn probes_sent(&self) -> u64 {
        self.probes_sent.load(Ordering::Relaxed)
    }

    pub fn domain_checks(&self) -> u64 {
        self.domain_checks.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.sessions_started,
            &self.sessions_live,
            &self.sessions_failed,
            &self.build_attempts,
            &self.deploy_attempts,
            &self.probes_sent,
            &self.domain_checks,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
