//! Build runs and the classified failure taxonomy.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::session::AttemptBudget;

/// Identifier of a pushed revision (a commit SHA for git).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(pub String);

impl RevisionId {
    pub fn new(id: impl Into<String>) -> Self {
        RevisionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 chars).
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a remote build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildStatus::Succeeded | BuildStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            BuildStatus::Pending => 0,
            BuildStatus::Running => 1,
            BuildStatus::Succeeded | BuildStatus::Failed => 2,
        }
    }

    /// Builds only move forward; a terminal status never changes again.
    pub fn can_advance_to(self, next: BuildStatus) -> bool {
        if self.is_terminal() {
            return self == next;
        }
        next.rank() >= self.rank()
    }
}

/// Classified cause of a failed build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildFailureReason {
    DependencyMissing,
    TypeCheckFailed,
    /// Code references files that no longer exist.
    StaleReference,
    /// Wrong build command or a missing required build flag.
    ConfigMismatch,
    BaseImageIncompatible,
    /// Out of memory during the build.
    ResourceExhausted,
    Unknown,
}

impl BuildFailureReason {
    /// Whether a source change can plausibly correct this failure.
    pub fn is_fixable(self) -> bool {
        !matches!(self, BuildFailureReason::ResourceExhausted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildFailureReason::DependencyMissing => "dependency_missing",
            BuildFailureReason::TypeCheckFailed => "type_check_failed",
            BuildFailureReason::StaleReference => "stale_reference",
            BuildFailureReason::ConfigMismatch => "config_mismatch",
            BuildFailureReason::BaseImageIncompatible => "base_image_incompatible",
            BuildFailureReason::ResourceExhausted => "resource_exhausted",
            BuildFailureReason::Unknown => "unknown",
        }
    }
}

impl fmt::Display for BuildFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed remote build attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRun {
    pub revision: RevisionId,
    pub status: BuildStatus,
    #[serde(default)]
    pub failure: Option<BuildFailureReason>,
    /// 1-based attempt number within the session (0 until assigned).
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub log_excerpt: String,
    pub observed_at: DateTime<Utc>,
}

impl BuildRun {
    pub fn new(revision: RevisionId, status: BuildStatus) -> Self {
        Self {
            revision,
            status,
            failure: None,
            attempt: 0,
            log_excerpt: String::new(),
            observed_at: Utc::now(),
        }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log_excerpt = log.into();
        self
    }

    pub fn with_failure(mut self, reason: BuildFailureReason) -> Self {
        self.failure = Some(reason);
        self
    }

    /// Classified reason, `Unknown` when the run failed unclassified.
    pub fn reason(&self) -> BuildFailureReason {
        self.failure.unwrap_or(BuildFailureReason::Unknown)
    }

    pub fn succeeded(&self) -> bool {
        self.status == BuildStatus::Succeeded
    }
}

/// Per-session build bookkeeping: the attempt budget and every revision that
/// has already been built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLedger {
    pub budget: AttemptBudget,
    pub attempted: BTreeSet<RevisionId>,
    #[serde(default)]
    pub last_failure: Option<BuildFailureReason>,
}

impl BuildLedger {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            budget: AttemptBudget::new(max_attempts),
            attempted: BTreeSet::new(),
            last_failure: None,
        }
    }

    pub fn has_attempted(&self, revision: &RevisionId) -> bool {
        self.attempted.contains(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_moves_forward_only() {
        assert!(BuildStatus::Pending.can_advance_to(BuildStatus::Running));
        assert!(BuildStatus::Running.can_advance_to(BuildStatus::Failed));
        assert!(BuildStatus::Pending.can_advance_to(BuildStatus::Succeeded));
        assert!(!BuildStatus::Running.can_advance_to(BuildStatus::Pending));
        assert!(!BuildStatus::Failed.can_advance_to(BuildStatus::Running));
        assert!(!BuildStatus::Failed.can_advance_to(BuildStatus::Succeeded));
        assert!(BuildStatus::Failed.can_advance_to(BuildStatus::Failed));
    }

    #[test]
    fn test_only_resource_exhaustion_is_unfixable() {
        assert!(!BuildFailureReason::ResourceExhausted.is_fixable());
        assert!(BuildFailureReason::Unknown.is_fixable());
        assert!(BuildFailureReason::DependencyMissing.is_fixable());
    }

    #[test]
    fn test_reason_defaults_to_unknown() {
        let run = BuildRun::new(RevisionId::new("abc"), BuildStatus::Failed);
        assert_eq!(run.reason(), BuildFailureReason::Unknown);
        let run = run.with_failure(BuildFailureReason::StaleReference);
        assert_eq!(run.reason(), BuildFailureReason::StaleReference);
    }

    #[test]
    fn test_revision_short() {
        let rev = RevisionId::new("0123456789abcdef0123");
        assert_eq!(rev.short(), "0123456789ab");
        assert_eq!(RevisionId::new("abc").short(), "abc");
        // Multi-byte ids are cut on a char boundary.
        assert_eq!(RevisionId::new("ééééééééééééé").short(), "éééééééééééé");
        assert_eq!(RevisionId::new("revision-🚀-one").short(), "revision-🚀-o");
    }

    #[test]
    fn test_reason_serde_matches_display() {
        let json = serde_json::to_string(&BuildFailureReason::BaseImageIncompatible).unwrap();
        assert_eq!(json, "\"base_image_incompatible\"");
        assert_eq!(
            BuildFailureReason::BaseImageIncompatible.to_string(),
            "base_image_incompatible"
        );
    }
}
