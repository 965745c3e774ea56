//! Exercises the ACME issuance path end to end through the public API: a
//! `SelfSignedCa`-backed `AcmeManager` tick produces a certificate chain
//! that `CertStore` can actually install and later report as not needing
//! renewal.

use keymgr::acme::{AcmeEvent, AcmeManager, SelfSignedCa};
use keymgr::cert_store::CertStore;

#[test]
fn issued_certificate_installs_and_clears_renewal_need() {
    let domain = "integration.example".to_string();
    let mut mgr = AcmeManager::new(Box::new(SelfSignedCa::new()), &[domain.clone()]);
    let mut store = CertStore::new();

    assert!(store.needs_renewal(&domain, std::time::SystemTime::now()));

    let events = mgr.tick(&[domain.clone()]);
    let chain_pem = events
        .into_iter()
        .find_map(|e| match e {
            AcmeEvent::Issued { chain_pem, .. } => Some(chain_pem),
            _ => None,
        })
        .expect("tick should issue a certificate for a due domain");

    store.install(&domain, chain_pem);
    assert!(store.get(&domain).is_some());
    assert!(
        !store.needs_renewal(&domain, std::time::SystemTime::now()),
        "a freshly issued 90-day certificate should not need renewal yet"
    );
}

#[test]
fn domain_absent_from_due_list_never_produces_events() {
    let mut mgr = AcmeManager::new(
        Box::new(SelfSignedCa::new()),
        &["a.example".to_string(), "b.example".to_string()],
    );
    let events = mgr.tick(&["a.example".to_string()]);
    for event in &events {
        let domain = match event {
            AcmeEvent::ChallengeReady { domain, .. } => domain,
            AcmeEvent::ChallengeDone { domain } => domain,
            AcmeEvent::Issued { domain, .. } => domain,
        };
        assert_eq!(domain, "a.example");
    }
}
