//! Configuration for the lifecycle orchestrator and its adapters.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or no
//! file at all) yields a working configuration. Durations are in seconds.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{Result, SessionLimits, ShiplineError, MAX_ATTEMPTS};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ShiplineConfig {
    pub build: BuildConfig,
    pub deploy: DeployConfig,
    pub domain: DomainConfig,
    pub platform: PlatformConfig,
    pub git: GitConfig,
    pub sessions: SessionsConfig,
}

impl ShiplineConfig {
    /// Load from `path`, or return defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ShiplineError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ShiplineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the retry bounds meaningless.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("build.max_attempts", self.build.max_attempts),
            ("deploy.max_attempts", self.deploy.max_attempts),
            ("deploy.probe_attempts", self.deploy.probe_attempts),
        ] {
            if !(1..=MAX_ATTEMPTS).contains(&value) {
                return Err(ShiplineError::Config(format!(
                    "{name} must be between 1 and {MAX_ATTEMPTS}, got {value}"
                )));
            }
        }
        if self.build.poll_interval_secs == 0 || self.deploy.poll_interval_secs == 0 {
            return Err(ShiplineError::Config(
                "poll intervals must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_build_attempts: self.build.max_attempts,
            max_deploy_attempts: self.deploy.max_attempts,
        }
    }
}

/// Build observation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            timeout_secs: 15 * 60,
            max_attempts: 3,
        }
    }
}

impl BuildConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Rollout and reachability settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub poll_interval_secs: u64,
    pub rollout_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub probe_attempts: u32,
    pub probe_backoff_secs: u64,
    pub max_attempts: u32,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            rollout_timeout_secs: 180,
            probe_timeout_secs: 10,
            probe_attempts: 3,
            probe_backoff_secs: 5,
            max_attempts: 3,
        }
    }
}

impl DeployConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn rollout_timeout(&self) -> Duration {
        Duration::from_secs(self.rollout_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn probe_backoff(&self) -> Duration {
        Duration::from_secs(self.probe_backoff_secs)
    }
}

/// Custom-domain verification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Checks per verification call; there is no cap across calls.
    pub max_checks: u32,
    pub backoff_secs: u64,
    /// Ownership record is `<prefix>.<hostname>` TXT = token.
    pub verification_prefix: String,
    /// The CNAME target custom domains must point at.
    pub connection_target: String,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            max_checks: 3,
            backoff_secs: 10,
            verification_prefix: "_shipline-challenge".to_string(),
            connection_target: "edge.shipline.app".to_string(),
        }
    }
}

impl DomainConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

/// Platform control-plane API used for builds, workloads and domains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            api_token: None,
            request_timeout_secs: 30,
        }
    }
}

impl PlatformConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Workspace git settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub remote: String,
    pub branch: String,
    pub protected_paths: BTreeSet<String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            branch: "main".to_string(),
            protected_paths: [".platform".to_string()].into_iter().collect(),
        }
    }
}

/// Where in-flight session checkpoints live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub dir: PathBuf,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".shipline/sessions"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ShiplineConfig::default();
        assert_eq!(config.build.max_attempts, 3);
        assert_eq!(config.deploy.max_attempts, 3);
        assert_eq!(config.deploy.rollout_timeout(), Duration::from_secs(180));
        assert_eq!(config.deploy.probe_attempts, 3);
        assert!(config.git.protected_paths.contains(".platform"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ShiplineConfig::from_toml(
            r#"
[build]
timeout_secs = 600

[platform]
base_url = "https://api.platform.test"

[git]
protected_paths = [".platform", ".github/workflows"]
"#,
        )
        .expect("parse");
        assert_eq!(config.build.timeout(), Duration::from_secs(600));
        assert_eq!(config.build.poll_interval_secs, 10);
        assert_eq!(config.platform.base_url, "https://api.platform.test");
        assert_eq!(config.git.protected_paths.len(), 2);
        assert_eq!(config.git.branch, "main");
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let err = ShiplineConfig::from_toml("[deploy]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ShiplineError::Config(_)));
    }

    #[test]
    fn test_attempts_above_ceiling_rejected() {
        for toml in [
            "[build]\nmax_attempts = 6\n",
            "[deploy]\nmax_attempts = 4\n",
            "[deploy]\nprobe_attempts = 10\n",
        ] {
            let err = ShiplineConfig::from_toml(toml).unwrap_err();
            assert!(err.to_string().contains("between 1 and 3"), "{toml}: {err}");
        }
        assert!(ShiplineConfig::from_toml("[build]\nmax_attempts = 3\n").is_ok());
    }

    #[test]
    fn test_load_without_path_is_default() {
        let config = ShiplineConfig::load(None).unwrap();
        assert_eq!(config, ShiplineConfig::default());
    }

    #[test]
    fn test_session_limits_follow_config() {
        let mut config = ShiplineConfig::default();
        config.build.max_attempts = 2;
        let limits = config.session_limits();
        assert_eq!(limits.max_build_attempts, 2);
        assert_eq!(limits.max_deploy_attempts, 3);
    }
}
