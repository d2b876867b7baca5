//! Custom-domain bindings and their verification state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// DNS record types the registrar is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    Txt,
    Cname,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordType::Txt => "TXT",
            RecordType::Cname => "CNAME",
        })
    }
}

/// Outcome of a single DNS record check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCheck {
    #[default]
    Unchecked,
    Found,
    Missing,
}

/// TLS certificate issuance state for a hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateState {
    #[default]
    NotRequested,
    Pending,
    Issued,
    Failed,
}

/// Whether a binding is serving traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStatus {
    #[default]
    Pending,
    Active,
}

/// A requested custom hostname. Never expires: it stays `Pending` until a
/// later verification finds all records and the certificate in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainBinding {
    pub hostname: String,
    pub verification_token: String,
    #[serde(default)]
    pub ownership_record: RecordCheck,
    #[serde(default)]
    pub connection_record: RecordCheck,
    #[serde(default)]
    pub certificate: CertificateState,
    #[serde(default)]
    pub status: DomainStatus,
    #[serde(default)]
    pub checks: u32,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl DomainBinding {
    pub fn new(hostname: impl Into<String>, verification_token: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into().trim_end_matches('.').to_ascii_lowercase(),
            verification_token: verification_token.into(),
            ownership_record: RecordCheck::Unchecked,
            connection_record: RecordCheck::Unchecked,
            certificate: CertificateState::NotRequested,
            status: DomainStatus::Pending,
            checks: 0,
            last_checked_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == DomainStatus::Active
    }

    /// Name of the ownership TXT record, e.g. `_shipline-challenge.example.com`.
    pub fn ownership_record_name(&self, prefix: &str) -> String {
        format!("{}.{}", prefix.trim_end_matches('.'), self.hostname)
    }

    /// All three requirements hold.
    pub fn requirements_met(&self) -> bool {
        self.ownership_record == RecordCheck::Found
            && self.connection_record == RecordCheck::Found
            && self.certificate == CertificateState::Issued
    }

    pub fn endpoint(&self) -> String {
        format!("https://{}", self.hostname)
    }
}
