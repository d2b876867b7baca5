//! Custom-domain verification.
//!
//! A binding becomes `Active` once the ownership TXT record, the connection
//! CNAME and an issued certificate are all observed in the same round.
//! Anything short of that leaves it `Pending`; DNS propagation is slow and a
//! pending domain never fails a delivery.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capability::DomainRegistrar;
use crate::config::DomainConfig;
use crate::domain::{
    CertificateState, DomainBinding, DomainStatus, Phase, RecordCheck, RecordType, Result,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::poll::{ensure_active, sleep_or_cancel};

pub struct DomainVerifier {
    registrar: Arc<dyn DomainRegistrar>,
    config: DomainConfig,
}

impl DomainVerifier {
    pub fn new(registrar: Arc<dyn DomainRegistrar>, config: DomainConfig) -> Self {
        Self { registrar, config }
    }

    /// Check `binding` up to `max_checks` times with a fixed backoff.
    ///
    /// Returns the binding `Active` or still `Pending`; only cancellation is
    /// an error.
    pub async fn verify(
        &self,
        mut binding: DomainBinding,
        cancel: &CancellationToken,
    ) -> Result<DomainBinding> {
        if binding.is_active() {
            return Ok(binding);
        }

        for round in 1..=self.config.max_checks {
            ensure_active(cancel, Phase::VerifyingDomain)?;
            self.check_once(&mut binding).await;
            if binding.is_active() {
                info!(hostname = %binding.hostname, round, "custom domain active");
                return Ok(binding);
            }
            if round < self.config.max_checks {
                sleep_or_cancel(self.config.backoff(), cancel, Phase::VerifyingDomain).await?;
            }
        }

        info!(
            hostname = %binding.hostname,
            ownership = ?binding.ownership_record,
            connection = ?binding.connection_record,
            certificate = ?binding.certificate,
            "custom domain still pending"
        );
        Ok(binding)
    }

    /// One verification round. Registrar errors count as "not yet".
    pub async fn check_once(&self, binding: &mut DomainBinding) {
        binding.checks += 1;
        METRICS.inc_domain_checks();

        let ownership_name = binding.ownership_record_name(&self.config.verification_prefix);
        binding.ownership_record = self
            .record(&ownership_name, RecordType::Txt, &binding.verification_token)
            .await;
        binding.connection_record = self
            .record(&binding.hostname, RecordType::Cname, &self.config.connection_target)
            .await;
        binding.certificate = match self.registrar.get_certificate_state(&binding.hostname).await {
            Ok(state) => state,
            Err(e) => {
                warn!(hostname = %binding.hostname, error = %e, "certificate lookup failed");
                match binding.certificate {
                    CertificateState::Issued => CertificateState::Pending,
                    other => other,
                }
            }
        };

        binding.status = if binding.requirements_met() {
            DomainStatus::Active
        } else {
            DomainStatus::Pending
        };
        binding.last_checked_at = Some(Utc::now());
        obs::emit_domain_checked(&binding.hostname, binding.checks, binding.is_active());
    }

    async fn record(&self, name: &str, kind: RecordType, expected: &str) -> RecordCheck {
        match self.registrar.check_record(name, kind, expected).await {
            Ok(true) => RecordCheck::Found,
            Ok(false) => RecordCheck::Missing,
            Err(e) => {
                warn!(name = %name, kind = %kind, error = %e, "record lookup failed");
                RecordCheck::Missing
            }
        }
    }
}
