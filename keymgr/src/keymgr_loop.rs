//! Key-manager main loop (spec §4.F "key-manager sibling", §4.C spawn order:
//! "key-manager is spawned after the ACME sibling so the domain set is
//! known before it starts answering requests").
//!
//! Runs post-fork in the child process selected for `WORKER_ID_KEYMGR`. Owns
//! the `CertStore`, `CrlCache`, and `EntropyGenerator`; answers
//! `CertificateReq`/`EntropyReq` from network workers (relayed by the
//! parent) and relays `Certificate`/`Crl`/`AcmeChallengeSetCert`/
//! `AcmeChallengeClearCert` frames arriving from the ACME sibling onward, so
//! the parent broadcasts them to every network worker (spec §4.C
//! `pump_messages`).

use std::thread;
use std::time::Duration;

use supervisor_proto::bus::{encode_keymgr_frame, parse_keymgr_frame, DomainName, KeymgrMessage, MessageId};
use supervisor_proto::transport::ControlChannel;
use supervisor_proto::signals;

use crate::cert_store::CertStore;
use crate::crl_cache::CrlCache;
use crate::entropy::EntropyGenerator;
use crate::KeymgrConfig;

/// How long to sleep between poll iterations when there's no socket activity
/// to react to immediately. Short enough that shutdown signals and CRL
/// refreshes are noticed promptly without busy-looping a whole CPU.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs until a quit signal is observed, then sends `Shutdown` and returns.
/// `supervisor::process::child_entry` calls this directly in the forked
/// child; it never returns control to the supervisor's own code.
pub fn run_keymgr(cfg: KeymgrConfig, mut channel: ControlChannel) {
    let mut store = CertStore::new();
    let crl_cache = CrlCache::new();
    let entropy = EntropyGenerator::new();

    if let Err(e) = signals::install() {
        log::error!(target: "keymgr::init", "failed to install signal handlers: {e}");
        return;
    }

    log::info!(target: "keymgr::init", "key-manager ready for {} domain(s)", cfg.domains.len());

    loop {
        let signals = signals::drain();
        if signals.wants_quit() {
            log::info!(target: "keymgr::shutdown", "quit signal received, shutting down");
            let frame = encode_keymgr_frame(MessageId::Shutdown, None, &[]);
            let _ = channel.send_frame(&frame);
            return;
        }

        match channel.try_recv_frame() {
            Ok(Some(raw)) => handle_frame(&raw, &mut channel, &mut store, &crl_cache, &entropy, &cfg),
            Ok(None) => {}
            Err(e) => {
                log::error!(target: "keymgr::bus", "control channel read failed: {e}");
                return;
            }
        }

        thread::sleep(POLL_INTERVAL);
    }
}

fn handle_frame(
    raw: &[u8],
    channel: &mut ControlChannel,
    store: &mut CertStore,
    crl_cache: &CrlCache,
    entropy: &EntropyGenerator,
    cfg: &KeymgrConfig,
) {
    let message = match parse_keymgr_frame(raw) {
        Ok(m) => m,
        Err(e) => {
            log::warn!(target: "keymgr::bus", "dropping malformed frame: {e}");
            return;
        }
    };

    match message {
        KeymgrMessage::CertificateReq { domain } => {
            if let Some(entry) = store.get(domain.as_str()) {
                let reply = encode_keymgr_frame(MessageId::Certificate, Some(&domain), &entry.chain_pem);
                if let Err(e) = channel.send_frame(&reply) {
                    log::error!(target: "keymgr::bus", "failed to send certificate reply: {e}");
                }
            } else {
                log::warn!(target: "keymgr::certs", "certificate requested for unknown/unissued domain {}", domain.as_str());
            }
        }
        KeymgrMessage::EntropyReq => {
            let buf = entropy.generate();
            let reply = encode_keymgr_frame(MessageId::EntropyResp, None, &buf[..]);
            if let Err(e) = channel.send_frame(&reply) {
                log::error!(target: "keymgr::bus", "failed to send entropy reply: {e}");
            }
        }
        KeymgrMessage::Certificate { domain, chain_pem } => {
            // Arrives from the ACME sibling via the parent. Install locally
            // and relay unchanged so the parent broadcasts it to every
            // network worker (spec §4.C pump_messages routing table).
            store.install(domain.as_str(), chain_pem.clone());
            let relay = encode_keymgr_frame(MessageId::Certificate, Some(&domain), &chain_pem);
            if let Err(e) = channel.send_frame(&relay) {
                log::error!(target: "keymgr::bus", "failed to relay certificate: {e}");
            }
            if cfg.crl_refresh_enabled {
                spawn_crl_refresh(domain, store.get(domain.as_str()).map(|e| e.parsed.crl_urls.clone()), crl_cache.clone());
            }
        }
        KeymgrMessage::Crl { domain, crl_pem } => {
            let relay = encode_keymgr_frame(MessageId::Crl, Some(&domain), &crl_pem);
            if let Err(e) = channel.send_frame(&relay) {
                log::error!(target: "keymgr::bus", "failed to relay CRL: {e}");
            }
        }
        KeymgrMessage::AcmeChallengeSetCert { domain, der } => {
            let relay = encode_keymgr_frame(MessageId::AcmeChallengeSetCert, Some(&domain), &der);
            if let Err(e) = channel.send_frame(&relay) {
                log::error!(target: "keymgr::bus", "failed to relay challenge cert: {e}");
            }
        }
        KeymgrMessage::AcmeChallengeClearCert { domain } => {
            let relay = encode_keymgr_frame(MessageId::AcmeChallengeClearCert, Some(&domain), &[]);
            if let Err(e) = channel.send_frame(&relay) {
                log::error!(target: "keymgr::bus", "failed to relay challenge clear: {e}");
            }
        }
        KeymgrMessage::AcceptAvailable | KeymgrMessage::Shutdown => {
            // Not addressed to the key-manager in the parent's routing
            // table; ignore rather than treat as an error (spec §4.G: the
            // bus is point-to-point, misrouting would be a parent bug, not
            // ours to recover from).
        }
    }
}

/// Kick off an out-of-band CRL check for a freshly installed certificate.
/// Runs on a detached thread since `CrlCache::is_revoked` is async and the
/// main loop here is a plain poll loop, not a tokio runtime; each refresh
/// only logs (spec §7 class 3: "logged, never fatal").
fn spawn_crl_refresh(domain: DomainName, crl_urls: Option<Vec<String>>, crl_cache: CrlCache) {
    let Some(urls) = crl_urls else { return };
    if urls.is_empty() {
        return;
    }
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                log::error!(target: "keymgr::crl", "failed to build refresh runtime: {e}");
                return;
            }
        };
        runtime.block_on(async {
            for url in &urls {
                let revoked = crl_cache.is_revoked(&[], url).await;
                log::debug!(target: "keymgr::crl", "refreshed CRL for {} from {url} (sample check revoked={revoked})", domain.as_str());
            }
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_domain_certificate_req_does_not_panic() {
        let mut store = CertStore::new();
        let crl_cache = CrlCache::new();
        let entropy = EntropyGenerator::new();
        let cfg = KeymgrConfig::from_domains(&["example.com".to_string()]);
        let (mut a, mut b) = ControlChannel::pair().expect("socketpair");

        let domain = DomainName::new("example.com").unwrap();
        let frame = encode_keymgr_frame(MessageId::CertificateReq, Some(&domain), &[]);
        handle_frame(&frame, &mut a, &mut store, &crl_cache, &entropy, &cfg);

        // No certificate installed, so nothing should have been sent back.
        assert!(b.try_recv_frame().unwrap().is_none());
    }

    #[test]
    fn entropy_req_replies_with_entropy_resp() {
        let mut store = CertStore::new();
        let crl_cache = CrlCache::new();
        let entropy = EntropyGenerator::new();
        let cfg = KeymgrConfig::from_domains(&[]);
        let (mut a, mut b) = ControlChannel::pair().expect("socketpair");

        let frame = encode_keymgr_frame(MessageId::EntropyReq, None, &[]);
        handle_frame(&frame, &mut a, &mut store, &crl_cache, &entropy, &cfg);

        let reply = b.try_recv_frame().unwrap().expect("reply frame");
        assert!(matches!(
            parse_keymgr_frame(&reply).unwrap(),
            KeymgrMessage::EntropyResp { .. }
        ));
    }

    #[test]
    fn certificate_from_acme_is_installed_and_relayed() {
        let mut store = CertStore::new();
        let crl_cache = CrlCache::new();
        let entropy = EntropyGenerator::new();
        let mut cfg = KeymgrConfig::from_domains(&["example.com".to_string()]);
        cfg.crl_refresh_enabled = false;
        let (mut a, mut b) = ControlChannel::pair().expect("socketpair");

        let domain = DomainName::new("example.com").unwrap();
        let frame = encode_keymgr_frame(MessageId::Certificate, Some(&domain), b"not-really-pem");
        handle_frame(&frame, &mut a, &mut store, &crl_cache, &entropy, &cfg);

        let relayed = b.try_recv_frame().unwrap().expect("relayed frame");
        assert!(matches!(
            parse_keymgr_frame(&relayed).unwrap(),
            KeymgrMessage::Certificate { .. }
        ));
    }
}
