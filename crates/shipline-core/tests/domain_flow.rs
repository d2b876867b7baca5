//! Custom-domain verification inside and outside a session.

mod common;

use common::{five_new_files, request_with_domain, Harness};
use shipline_core::{
    CertificateState, DomainStatus, Phase, ProbeError, RecordCheck, RecordType, ShiplineError,
    StatusUpdate,
};
use tokio_util::sync::CancellationToken;

const HOST: &str = "shop.example.com";
const TOKEN: &str = "sl-verify-7f3a";

fn configure_dns(h: &Harness) {
    h.registrar.add_record(
        "_shipline-challenge.shop.example.com",
        RecordType::Txt,
        TOKEN,
    );
    h.registrar
        .add_record(HOST, RecordType::Cname, "edge.shipline.app");
    h.registrar.set_certificate(HOST, CertificateState::Issued);
}

#[tokio::test(start_paused = true)]
async fn configured_domain_goes_live_active() {
    let h = Harness::new();
    configure_dns(&h);

    let live = h
        .orchestrator()
        .deliver(
            request_with_domain(five_new_files(), HOST, TOKEN),
            &CancellationToken::new(),
        )
        .await
        .expect("live");

    assert_eq!(
        h.sink.phases(),
        vec![
            Phase::Building,
            Phase::Deploying,
            Phase::Verifying,
            Phase::VerifyingDomain,
            Phase::Live,
        ]
    );
    let domain = live.domain.expect("domain tracked");
    assert_eq!(domain.status, DomainStatus::Active);
    assert_eq!(domain.checks, 1);
    assert_eq!(domain.ownership_record, RecordCheck::Found);
    assert_eq!(domain.connection_record, RecordCheck::Found);

    let published = h
        .sink
        .updates()
        .into_iter()
        .find_map(|u| match u {
            StatusUpdate::Live { domain, .. } => domain,
            _ => None,
        })
        .expect("live update carries the domain");
    assert!(published.is_active());
}

#[tokio::test(start_paused = true)]
async fn missing_dns_leaves_domain_pending_but_app_live() {
    let h = Harness::new();

    let live = h
        .orchestrator()
        .deliver(
            request_with_domain(five_new_files(), HOST, TOKEN),
            &CancellationToken::new(),
        )
        .await
        .expect("default endpoint still goes live");

    let domain = live.domain.expect("domain tracked");
    assert_eq!(domain.status, DomainStatus::Pending);
    assert_eq!(domain.checks, 3);
    assert_eq!(domain.ownership_record, RecordCheck::Missing);
    let last = live.narration.last().expect("narrated");
    assert_eq!((last.from, last.phase), (Phase::VerifyingDomain, Phase::Live));
    assert!(last.note.contains("pending"));
}

#[tokio::test(start_paused = true)]
async fn registrar_outage_never_fails_the_session() {
    let h = Harness::new();
    configure_dns(&h);
    h.registrar.set_unavailable(true);

    let live = h
        .orchestrator()
        .deliver(
            request_with_domain(five_new_files(), HOST, TOKEN),
            &CancellationToken::new(),
        )
        .await
        .expect("live despite registrar outage");

    assert_eq!(
        live.domain.map(|d| d.status),
        Some(DomainStatus::Pending)
    );
    assert!(h.registrar.lookups() > 0);
}

#[tokio::test(start_paused = true)]
async fn pending_domain_is_reverified_later() {
    let h = Harness::new();
    let orchestrator = h.orchestrator();
    let cancel = CancellationToken::new();

    let live = orchestrator
        .deliver(request_with_domain(five_new_files(), HOST, TOKEN), &cancel)
        .await
        .expect("live");
    let pending = live.domain.expect("domain tracked");
    assert_eq!(pending.status, DomainStatus::Pending);

    // Still nothing configured: pending again, with no cap on checks.
    let pending = orchestrator.reverify_domain(pending, &cancel).await.unwrap();
    assert_eq!(pending.status, DomainStatus::Pending);
    assert_eq!(pending.checks, 6);

    configure_dns(&h);
    let active = orchestrator.reverify_domain(pending, &cancel).await.unwrap();
    assert_eq!(active.status, DomainStatus::Active);
    assert_eq!(active.checks, 7);
    assert!(active.last_checked_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn unreachable_endpoint_never_checks_domain() {
    let h = Harness::new();
    configure_dns(&h);
    h.prober.set_fallback(Err(ProbeError::Timeout(std::time::Duration::from_secs(10))));

    let err = h
        .orchestrator()
        .deliver(
            request_with_domain(five_new_files(), HOST, TOKEN),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ShiplineError::DeployExhausted { .. }));
    assert!(!h.sink.phases().contains(&Phase::VerifyingDomain));
    assert_eq!(h.registrar.lookups(), 0);
}
