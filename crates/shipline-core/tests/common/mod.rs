//! Shared wiring for the lifecycle integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use shipline_core::fakes::{
    FakeDomainRegistrar, FakeSourceControl, FakeWorkloadInspector, MemorySessionStore,
    RecordingSink, ScriptedBuildProvider, ScriptedProber, ScriptedRemediator,
};
use shipline_core::{
    Capabilities, ChangeSet, DeliveryRequest, DomainBinding, LifecycleOrchestrator,
    ShiplineConfig, WorkloadSelector,
};

pub const WORKSPACE: &str = "storefront";
pub const ENDPOINT: &str = "https://storefront.shipline.app";

/// One fake per capability, kept around for assertions.
pub struct Harness {
    pub source: Arc<FakeSourceControl>,
    pub builds: Arc<ScriptedBuildProvider>,
    pub workloads: Arc<FakeWorkloadInspector>,
    pub prober: Arc<ScriptedProber>,
    pub registrar: Arc<FakeDomainRegistrar>,
    pub remediator: Arc<ScriptedRemediator>,
    pub store: Arc<MemorySessionStore>,
    pub sink: Arc<RecordingSink>,
    pub config: ShiplineConfig,
}

impl Harness {
    /// A seeded repository, a healthy single-replica workload and an
    /// endpoint answering 200.
    pub fn new() -> Self {
        let source = FakeSourceControl::new([".platform"]);
        source.seed(".platform/workflow.yml", "build: npm run build\n");
        source.seed("package.json", r#"{"name":"storefront"}"#);
        source.seed("src/legacy.ts", "export const legacy = true;\n");

        Self {
            source: Arc::new(source),
            builds: Arc::new(ScriptedBuildProvider::new()),
            workloads: Arc::new(FakeWorkloadInspector::healthy(1)),
            prober: Arc::new(ScriptedProber::always(Ok(200))),
            registrar: Arc::new(FakeDomainRegistrar::new()),
            remediator: Arc::new(ScriptedRemediator::new()),
            store: Arc::new(MemorySessionStore::new()),
            sink: Arc::new(RecordingSink::new()),
            config: ShiplineConfig::default(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            source: self.source.clone(),
            builds: self.builds.clone(),
            workloads: self.workloads.clone(),
            prober: self.prober.clone(),
            registrar: self.registrar.clone(),
            remediator: self.remediator.clone(),
            store: self.store.clone(),
            sink: self.sink.clone(),
        }
    }

    pub fn orchestrator(&self) -> LifecycleOrchestrator {
        LifecycleOrchestrator::new(&self.config, self.capabilities())
    }
}

pub fn request(change_set: ChangeSet) -> DeliveryRequest {
    DeliveryRequest {
        workspace: WORKSPACE.to_string(),
        change_set,
        selector: WorkloadSelector::new("app=storefront"),
        endpoint: ENDPOINT.to_string(),
        domain: None,
    }
}

pub fn request_with_domain(change_set: ChangeSet, hostname: &str, token: &str) -> DeliveryRequest {
    DeliveryRequest {
        domain: Some(DomainBinding::new(hostname, token)),
        ..request(change_set)
    }
}

pub fn five_new_files() -> ChangeSet {
    ChangeSet::new("Add storefront pages")
        .write("src/index.ts", "export * from './pages';\n")
        .write("src/pages/home.ts", "export const home = 'home';\n")
        .write("src/pages/cart.ts", "export const cart = 'cart';\n")
        .write("src/pages/checkout.ts", "export const checkout = 'checkout';\n")
        .write("src/pages/index.ts", "export * from './home';\n")
}

pub fn add_express() -> ChangeSet {
    ChangeSet::new("Add express dependency").write(
        "package.json",
        r#"{"name":"storefront","dependencies":{"express":"^4.19.0"}}"#,
    )
}
