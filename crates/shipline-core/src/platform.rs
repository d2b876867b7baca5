//! HTTP adapters for the hosting platform.
//!
//! [`PlatformClient`] reads builds, workloads and domains from the platform
//! REST API; [`HttpProber`] checks public reachability. Both are read-only.

use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::capability::{BuildProvider, DomainRegistrar, ProbeError, Prober, WorkloadInspector};
use crate::config::PlatformConfig;
use crate::domain::{
    BuildFailureReason, BuildRun, BuildStatus, CertificateState, RecordType, ReplicaStatus,
    Result, RevisionId, ShiplineError, WorkloadEvent, WorkloadSelector,
};

#[derive(Debug, Deserialize)]
struct BuildResponse {
    status: BuildStatus,
    #[serde(default)]
    failure: Option<BuildFailureReason>,
    #[serde(default)]
    log: String,
}

#[derive(Debug, Deserialize)]
struct RecordResponse {
    found: bool,
}

#[derive(Debug, Deserialize)]
struct CertificateResponse {
    state: CertificateState,
}

/// Which capability a request serves; decides the error variant.
#[derive(Debug, Clone, Copy)]
enum Api {
    Builds,
    Workloads,
    Domains,
}

impl Api {
    fn error(self, message: String) -> ShiplineError {
        match self {
            Api::Builds => ShiplineError::BuildProvider(message),
            Api::Workloads => ShiplineError::WorkloadInspector(message),
            Api::Domains => ShiplineError::DomainRegistrar(message),
        }
    }
}

/// Client for the platform REST API.
#[derive(Debug, Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl PlatformClient {
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url).map_err(|e| {
            ShiplineError::Config(format!("invalid platform base_url {}: {e}", config.base_url))
        })?;
        if base.cannot_be_a_base() {
            return Err(ShiplineError::Config(format!(
                "platform base_url {} cannot carry a path",
                config.base_url
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ShiplineError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base,
            token: config.api_token.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        api: Api,
        url: Url,
    ) -> Result<Option<T>> {
        debug!(url = %url, "platform request");
        let mut request = self.http.get(url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| api.error(format!("GET {url}: {e}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(api.error(format!("GET {url}: HTTP {}", response.status())));
        }
        let body = response
            .json::<T>()
            .await
            .map_err(|e| api.error(format!("GET {url}: invalid response: {e}")))?;
        Ok(Some(body))
    }
}

#[async_trait]
impl BuildProvider for PlatformClient {
    async fn get_run_status(&self, revision: &RevisionId) -> Result<BuildRun> {
        let url = self.url(&["api", "builds", revision.as_str()]);
        // No build yet means CI has not picked the push up.
        let Some(body) = self.get_json::<BuildResponse>(Api::Builds, url).await? else {
            return Ok(BuildRun::new(revision.clone(), BuildStatus::Pending));
        };
        let mut run = BuildRun::new(revision.clone(), body.status).with_log(body.log);
        run.failure = body.failure;
        Ok(run)
    }
}

#[async_trait]
impl WorkloadInspector for PlatformClient {
    async fn get_replica_status(&self, selector: &WorkloadSelector) -> Result<ReplicaStatus> {
        let url = self.url(&["api", "workloads", selector.as_str(), "replicas"]);
        Ok(self
            .get_json::<ReplicaStatus>(Api::Workloads, url)
            .await?
            .unwrap_or_default())
    }

    async fn get_failure_events(&self, selector: &WorkloadSelector) -> Result<Vec<WorkloadEvent>> {
        let url = self.url(&["api", "workloads", selector.as_str(), "events"]);
        Ok(self
            .get_json::<Vec<WorkloadEvent>>(Api::Workloads, url)
            .await?
            .unwrap_or_default())
    }
}

#[async_trait]
impl DomainRegistrar for PlatformClient {
    async fn check_record(&self, name: &str, kind: RecordType, expected: &str) -> Result<bool> {
        // `_prefix.shop.example.com` is looked up under `shop.example.com`.
        let domain = name
            .split('.')
            .skip_while(|label| label.starts_with('_'))
            .collect::<Vec<_>>()
            .join(".");
        let mut url = self.url(&["api", "domains", &domain, "records"]);
        url.query_pairs_mut()
            .append_pair("name", name)
            .append_pair("type", &kind.to_string())
            .append_pair("expected", expected);
        Ok(self
            .get_json::<RecordResponse>(Api::Domains, url)
            .await?
            .is_some_and(|r| r.found))
    }

    async fn get_certificate_state(&self, domain: &str) -> Result<CertificateState> {
        let url = self.url(&["api", "domains", domain, "certificate"]);
        Ok(self
            .get_json::<CertificateResponse>(Api::Domains, url)
            .await?
            .map(|r| r.state)
            .unwrap_or_default())
    }
}

/// Reachability probe over plain HTTP(S) GET.
#[derive(Debug, Clone, Default)]
pub struct HttpProber {
    http: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Self {
        Self::default()
    }
}

fn connection_refused(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = e.source();
    }
    false
}

#[async_trait]
impl Prober for HttpProber {
    async fn http_get(&self, url: &str, timeout: Duration) -> std::result::Result<u16, ProbeError> {
        match self.http.get(url).timeout(timeout).send().await {
            Ok(response) => Ok(response.status().as_u16()),
            Err(e) if e.is_timeout() => Err(ProbeError::Timeout(timeout)),
            Err(e) if connection_refused(&e) => Err(ProbeError::ConnectionRefused),
            Err(e) => Err(ProbeError::Other(e.to_string())),
        }
    }
}
