//! ACME sibling main loop (spec §4.F "ACME sibling"): drives [`crate::acme::AcmeManager`]
//! and turns its events into bus frames relayed to the key-manager, which
//! installs them locally and forwards them onward for the parent to
//! broadcast to every network worker (spec §4.C `pump_messages` routing
//! table: "ACME → key-manager").
//!
//! The ACME sibling never sees `CertStore` directly — that lives in the
//! key-manager process — so it tracks its own renewal clock per domain
//! locally (DESIGN.md records this as the chosen resolution to spec.md's
//! open question on renewal-due tracking for a fully isolated sibling).

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use supervisor_proto::bus::{encode_keymgr_frame, DomainName, MessageId};
use supervisor_proto::signals;
use supervisor_proto::transport::ControlChannel;

use crate::acme::{AcmeCa, AcmeEvent, AcmeManager, SelfSignedCa};
use crate::KeymgrConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long after a successful issuance before a domain is offered to
/// `AcmeManager::tick` again. A real ACME client would derive this from the
/// issued certificate's actual expiry; the self-signed stand-in has no CA
/// round trip to report one, so this repo uses a fixed renewal cadence
/// instead (spec.md treats the wire-level ACME protocol as out of scope).
const RENEW_INTERVAL: Duration = Duration::from_secs(60 * 60 * 24 * 60);

/// Runs until a quit signal is observed, then sends `Shutdown` and returns.
/// Called directly from `supervisor::process::child_entry` in the forked
/// child selected for `WORKER_ID_ACME`; never returns control to the
/// supervisor's own code.
pub fn run_acme(cfg: KeymgrConfig, channel: ControlChannel) {
    run_acme_with_ca(cfg, channel, Box::new(SelfSignedCa::new()))
}

/// Split out so tests can supply a `CountingCa`-style double instead of the
/// real `SelfSignedCa` without forking a process.
fn run_acme_with_ca(cfg: KeymgrConfig, mut channel: ControlChannel, ca: Box<dyn AcmeCa>) {
    let mut mgr = AcmeManager::new(ca, &cfg.domains);
    let mut next_due: HashMap<String, Instant> =
        cfg.domains.iter().map(|d| (d.clone(), Instant::now())).collect();

    if let Err(e) = signals::install() {
        log::error!(target: "acme::init", "failed to install signal handlers: {e}");
        return;
    }
    log::info!(target: "acme::init", "ACME sibling ready for {} domain(s)", cfg.domains.len());

    loop {
        let signals = signals::drain();
        if signals.wants_quit() {
            log::info!(target: "acme::shutdown", "quit signal received, shutting down");
            let frame = encode_keymgr_frame(MessageId::Shutdown, None, &[]);
            let _ = channel.send_frame(&frame);
            return;
        }

        // The ACME sibling has no incoming requests to answer in this
        // protocol (spec §4.F catalogue only flows key-manager/ACME →
        // network workers); drain and discard anything that arrives rather
        // than let the socket buffer back up.
        while matches!(channel.try_recv_frame(), Ok(Some(_))) {}

        let now = Instant::now();
        let due: Vec<String> = next_due
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(d, _)| d.clone())
            .collect();

        for event in mgr.tick(&due) {
            let frame = match &event {
                AcmeEvent::ChallengeReady { domain, der } => {
                    let d = match DomainName::new(domain) {
                        Ok(d) => d,
                        Err(e) => {
                            log::warn!(target: "acme::bus", "domain {domain} does not fit the wire slot: {e}");
                            continue;
                        }
                    };
                    encode_keymgr_frame(MessageId::AcmeChallengeSetCert, Some(&d), der)
                }
                AcmeEvent::ChallengeDone { domain } => {
                    let d = match DomainName::new(domain) {
                        Ok(d) => d,
                        Err(_) => continue,
                    };
                    encode_keymgr_frame(MessageId::AcmeChallengeClearCert, Some(&d), &[])
                }
                AcmeEvent::Issued { domain, chain_pem } => {
                    let d = match DomainName::new(domain) {
                        Ok(d) => d,
                        Err(_) => continue,
                    };
                    next_due.insert(domain.clone(), Instant::now() + RENEW_INTERVAL);
                    encode_keymgr_frame(MessageId::Certificate, Some(&d), chain_pem)
                }
            };
            if let Err(e) = channel.send_frame(&frame) {
                log::error!(target: "acme::bus", "send to key-manager failed: {e}");
            }
        }

        thread::sleep(POLL_INTERVAL);
    }
}
