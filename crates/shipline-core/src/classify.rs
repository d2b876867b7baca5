//! Failure classification for build logs and scheduler events.
//!
//! Build logs are matched against an ordered list of regex signatures; the
//! first family with a matching line wins. More specific families come first
//! so that, e.g., a missing relative import is a stale reference rather than a
//! missing dependency.

use std::sync::OnceLock;

use regex::Regex;

use crate::domain::{BuildFailureReason, ReplicaStatus, WorkloadEvent, WorkloadFailure};

/// A classification together with the log line that triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub reason: BuildFailureReason,
    pub evidence: Option<String>,
}

const SIGNATURES: &[(BuildFailureReason, &[&str])] = &[
    (
        BuildFailureReason::ResourceExhausted,
        &[
            r"(?i)out of memory",
            r"(?i)heap out of memory",
            r"OOMKilled",
            r"(?i)exit code:? 137",
            r"(?i)cannot allocate memory",
            r"(?i)no space left on device",
        ],
    ),
    (
        BuildFailureReason::BaseImageIncompatible,
        &[
            r"(?i)exec format error",
            r"(?i)no matching manifest for",
            r"(?i)image'?s? platform .* does not match",
            r"GLIBC_[0-9.]+' not found",
            r"(?i)unsupported engine",
            r"(?i)requires node(\.js)? (version )?[>=^~]",
        ],
    ),
    (
        BuildFailureReason::StaleReference,
        &[
            r#"(?i)cannot find module ['"]\.{1,2}/"#,
            r#"(?i)can't resolve ['"]\.{1,2}/"#,
            r#"(?i)could not resolve ['"]\.{1,2}/"#,
            r#"(?i)failed to resolve import ['"]\.{1,2}/"#,
            r"(?i)ENOENT: no such file or directory",
            r"(?i)file not found: \S+",
        ],
    ),
    (
        BuildFailureReason::DependencyMissing,
        &[
            r#"(?i)cannot find module ['"][^./]"#,
            r#"(?i)can't resolve ['"][^./]"#,
            r#"(?i)could not resolve ['"][^./]"#,
            r"(?i)cannot find package",
            r"ModuleNotFoundError: No module named",
            r"(?i)npm ERR! 404",
            r"(?i)ERR_PNPM_FETCH_404",
            r"(?i)no matching version found for",
            r"(?i)could not find `\S+` in (the )?registry",
            r"(?i)unresolved import",
        ],
    ),
    (
        BuildFailureReason::TypeCheckFailed,
        &[
            r"error TS\d+:",
            r"(?i)^type error:",
            r"(?i)\btype ?error\b.*is not assignable",
            r"error\[E0308\]",
            r"(?i)mismatched types",
            r"(?i)found \d+ errors? in \d+ files?",
        ],
    ),
    (
        BuildFailureReason::ConfigMismatch,
        &[
            r"(?i)missing script:",
            r"(?i)unknown (command|option|flag)",
            r"(?i)unrecognized (argument|option)",
            r"(?i)required flag",
            r"(?i)build command .* not found",
            r"(?i)could not find a production build",
            r"(?i)output directory .* not found",
            r"(?i)invalid configuration",
        ],
    ),
];

fn compiled() -> &'static [(BuildFailureReason, Vec<Regex>)] {
    static COMPILED: OnceLock<Vec<(BuildFailureReason, Vec<Regex>)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        SIGNATURES
            .iter()
            .map(|(reason, patterns)| {
                let regexes = patterns
                    .iter()
                    .filter_map(|p| match Regex::new(p) {
                        Ok(re) => Some(re),
                        Err(e) => {
                            tracing::error!(pattern = %p, error = %e, "invalid build signature");
                            None
                        }
                    })
                    .collect();
                (*reason, regexes)
            })
            .collect()
    })
}

/// Classify a failed build from its log excerpt.
pub fn classify_build_log(log: &str) -> Classification {
    for (reason, regexes) in compiled() {
        for line in log.lines() {
            if regexes.iter().any(|re| re.is_match(line)) {
                return Classification {
                    reason: *reason,
                    evidence: Some(line.trim().to_string()),
                };
            }
        }
    }
    Classification {
        reason: BuildFailureReason::Unknown,
        evidence: None,
    }
}

/// Classify why a rollout never became ready, from scheduler events and the
/// last replica counters. `None` when nothing explains it.
pub fn classify_workload_events(
    events: &[WorkloadEvent],
    replicas: Option<ReplicaStatus>,
) -> Option<WorkloadFailure> {
    let matches = |needles: &[&str]| {
        events.iter().any(|e| {
            needles
                .iter()
                .any(|n| e.reason.eq_ignore_ascii_case(n) || e.message.contains(n))
        })
    };

    if matches(&["ImagePullBackOff", "ErrImagePull", "InvalidImageName", "ErrImageNeverPull"]) {
        return Some(WorkloadFailure::ImageUnavailable);
    }
    if matches(&["CrashLoopBackOff", "BackOff", "OOMKilled"]) {
        return Some(WorkloadFailure::CrashLoop);
    }
    if matches(&["FailedScheduling", "Unschedulable", "Insufficient cpu", "Insufficient memory"]) {
        return Some(WorkloadFailure::Unschedulable);
    }
    if replicas.is_some_and(|r| r.restarts > 0) {
        return Some(WorkloadFailure::CrashLoop);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_dependency() {
        let log = "step 4/7\nError: Cannot find module 'express'\nRequire stack:";
        let c = classify_build_log(log);
        assert_eq!(c.reason, BuildFailureReason::DependencyMissing);
        assert_eq!(
            c.evidence.as_deref(),
            Some("Error: Cannot find module 'express'")
        );
    }

    #[test]
    fn test_missing_relative_file_is_stale_reference() {
        let log = "Module not found: Error: Can't resolve './components/Header' in '/app/src'";
        assert_eq!(
            classify_build_log(log).reason,
            BuildFailureReason::StaleReference
        );
    }

    #[test]
    fn test_typescript_errors() {
        let log = "src/App.tsx(12,5): error TS2322: Type 'string' is not assignable to type 'number'.";
        assert_eq!(
            classify_build_log(log).reason,
            BuildFailureReason::TypeCheckFailed
        );
    }

    #[test]
    fn test_config_mismatch() {
        let log = "npm ERR! Missing script: \"build\"";
        assert_eq!(
            classify_build_log(log).reason,
            BuildFailureReason::ConfigMismatch
        );
    }

    #[test]
    fn test_base_image() {
        let log = "standard_init_linux.go:228: exec user process caused: exec format error";
        assert_eq!(
            classify_build_log(log).reason,
            BuildFailureReason::BaseImageIncompatible
        );
    }

    #[test]
    fn test_oom_wins_over_everything_else() {
        let log = "error TS2322: bad\nFATAL ERROR: Reached heap limit Allocation failed - JavaScript heap out of memory";
        assert_eq!(
            classify_build_log(log).reason,
            BuildFailureReason::ResourceExhausted
        );
    }

    #[test]
    fn test_unknown_fallback() {
        let c = classify_build_log("something odd happened");
        assert_eq!(c.reason, BuildFailureReason::Unknown);
        assert!(c.evidence.is_none());
        assert_eq!(classify_build_log("").reason, BuildFailureReason::Unknown);
    }

    #[test]
    fn test_all_signatures_compile() {
        let total: usize = SIGNATURES.iter().map(|(_, p)| p.len()).sum();
        let compiled_total: usize = compiled().iter().map(|(_, r)| r.len()).sum();
        assert_eq!(total, compiled_total);
    }

    #[test]
    fn test_workload_event_classification() {
        let image = vec![WorkloadEvent::new("Failed", "Back-off pulling image: ErrImagePull")];
        assert_eq!(
            classify_workload_events(&image, None),
            Some(WorkloadFailure::ImageUnavailable)
        );

        let crash = vec![WorkloadEvent::new("BackOff", "Back-off restarting failed container")];
        assert_eq!(
            classify_workload_events(&crash, None),
            Some(WorkloadFailure::CrashLoop)
        );

        let pending = vec![WorkloadEvent::new(
            "FailedScheduling",
            "0/3 nodes are available: 3 Insufficient memory.",
        )];
        assert_eq!(
            classify_workload_events(&pending, None),
            Some(WorkloadFailure::Unschedulable)
        );
    }

    #[test]
    fn test_restarts_without_events_mean_crash_loop() {
        assert_eq!(
            classify_workload_events(&[], Some(ReplicaStatus::new(1, 0, 4))),
            Some(WorkloadFailure::CrashLoop)
        );
        assert_eq!(
            classify_workload_events(&[], Some(ReplicaStatus::new(1, 0, 0))),
            None
        );
    }
}
