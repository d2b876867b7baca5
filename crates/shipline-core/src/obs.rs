//! Structured observability hooks for lifecycle sessions.
//!
//! This module provides:
//! - Session-scoped tracing spans via [`session_span`]
//! - Emission functions for key lifecycle events: start, transition, build
//!   observation, probe, domain check, finish
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`).
//! For JSON output, pass `--json` to the CLI.

use tracing::{debug, info, warn};

use crate::domain::{BuildStatus, Phase, ProbeResult};

/// Span tagging everything a session does with its id.
///
/// Attach it with [`tracing::Instrument`] so it survives `.await` points:
///
/// ```ignore
/// drive(session).instrument(obs::session_span("0b6f...")).await
/// ```
pub fn session_span(session_id: &str) -> tracing::Span {
    tracing::info_span!("shipline.session", session_id = %session_id)
}

/// Emit event: session started for a workspace.
pub fn emit_session_started(session_id: &str, workspace: &str) {
    info!(event = "session.started", session_id = %session_id, workspace = %workspace);
}

/// Emit event: the session moved between phases.
pub fn emit_phase_transition(session_id: &str, from: Phase, to: Phase, attempt: u32) {
    info!(
        event = "session.transition",
        session_id = %session_id,
        from = %from,
        to = %to,
        attempt = attempt,
    );
}

/// Emit event: one build status observation.
pub fn emit_build_observed(revision: &str, status: BuildStatus, attempt: u32) {
    debug!(
        event = "build.observed",
        revision = %revision,
        status = ?status,
        attempt = attempt,
    );
}

/// Emit event: one reachability probe.
pub fn emit_probe_result(url: &str, attempt: u32, result: &ProbeResult) {
    if result.is_success() {
        info!(event = "probe.result", url = %url, attempt = attempt, result = %result);
    } else {
        warn!(event = "probe.result", url = %url, attempt = attempt, result = %result);
    }
}

/// Emit event: one custom-domain verification round.
pub fn emit_domain_checked(hostname: &str, check: u32, active: bool) {
    info!(event = "domain.checked", hostname = %hostname, check = check, active = active);
}

/// Emit event: session reached a terminal phase.
pub fn emit_session_finished(session_id: &str, phase: Phase, duration_ms: u64) {
    info!(
        event = "session.finished",
        session_id = %session_id,
        phase = %phase,
        duration_ms = duration_ms,
    );
}

/// Emit event: a checkpoint could not be persisted (warning level).
pub fn emit_checkpoint_error(session_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "session.checkpoint_error", session_id = %session_id, error = %error);
}
