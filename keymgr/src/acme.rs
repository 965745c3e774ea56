//! ACME challenge/renewal state machine run by the ACME sibling (spec §4.F
//! "ACME sibling"). The wire-level ACME protocol (RFC 8555: directory,
//! account, order, JWS-signed requests against a real CA) is treated the
//! same way spec.md treats the HTTP/TLS pipeline — named by interface, not
//! reimplemented — behind the `AcmeCa` trait; `SelfSignedCa` is the
//! concrete implementation this repo ships, issuing a locally self-signed
//! certificate instead of completing a real CA round trip. Swapping in a
//! real CA client means implementing `AcmeCa` against one; no other part
//! of this crate or the message-bus protocol changes (documented as an
//! Open Question resolution in DESIGN.md).

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};

use crate::errors::AcmeError;

/// A TLS-ALPN-01 challenge: the DER bytes of a self-signed certificate
/// carrying the `id-pe-acmeIdentifier` extension, per RFC 8737.
pub struct Challenge {
    pub der: Vec<u8>,
}

/// What the CA side of an ACME exchange must provide. Kept narrow enough
/// that a real CA client and `SelfSignedCa` both implement it trivially.
pub trait AcmeCa: Send {
    fn request_challenge(&mut self, domain: &str) -> Result<Challenge, AcmeError>;
    fn finalize(&mut self, domain: &str) -> Result<Vec<u8>, AcmeError>;
}

/// Issues a challenge certificate and then "finalizes" by self-signing a
/// normal leaf certificate for the domain, standing in for a CA's signed
/// chain. Used when no real ACME directory URL is configured.
pub struct SelfSignedCa {
    validity: Duration,
}

impl SelfSignedCa {
    pub fn new() -> Self {
        Self {
            validity: Duration::from_secs(90 * 24 * 3600),
        }
    }
}

impl Default for SelfSignedCa {
    fn default() -> Self {
        Self::new()
    }
}

impl AcmeCa for SelfSignedCa {
    fn request_challenge(&mut self, domain: &str) -> Result<Challenge, AcmeError> {
        let key_authorization = format!("{domain}.self-signed-key-authorization");
        let digest: [u8; 32] = Sha256::digest(key_authorization.as_bytes()).into();

        let der = build_alpn_challenge_cert(domain, &digest).map_err(|e| AcmeError::ChallengeCertFailed {
            domain: domain.to_string(),
            reason: e,
        })?;
        Ok(Challenge { der })
    }

    fn finalize(&mut self, domain: &str) -> Result<Vec<u8>, AcmeError> {
        build_leaf_cert_pem(domain, self.validity).map_err(|e| AcmeError::IssuanceFailed {
            domain: domain.to_string(),
            reason: e,
        })
    }
}

fn build_alpn_challenge_cert(domain: &str, acme_identifier_digest: &[u8; 32]) -> Result<Vec<u8>, String> {
    let key_pair = rcgen::KeyPair::generate().map_err(|e| e.to_string())?;
    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]).map_err(|e| e.to_string())?;
    params
        .custom_extensions
        .push(rcgen::CustomExtension::new_acme_identifier(acme_identifier_digest));
    let cert = params.self_signed(&key_pair).map_err(|e| e.to_string())?;
    Ok(cert.der().to_vec())
}

fn build_leaf_cert_pem(domain: &str, validity: Duration) -> Result<Vec<u8>, String> {
    let key_pair = rcgen::KeyPair::generate().map_err(|e| e.to_string())?;
    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]).map_err(|e| e.to_string())?;
    let now = SystemTime::now();
    params.not_before = now.into();
    params.not_after = (now + validity).into();
    let cert = params.self_signed(&key_pair).map_err(|e| e.to_string())?;
    Ok(cert.pem().into_bytes())
}

/// Per-domain renewal state, driven one tick at a time by `AcmeManager`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DomainState {
    Idle,
    ChallengePending,
    Issued,
}

/// One event a tick can produce; the caller (`acme_loop`) turns these into
/// bus frames.
#[derive(Debug)]
pub enum AcmeEvent {
    ChallengeReady { domain: String, der: Vec<u8> },
    ChallengeDone { domain: String },
    Issued { domain: String, chain_pem: Vec<u8> },
}

pub struct AcmeManager {
    ca: Box<dyn AcmeCa>,
    state: HashMap<String, DomainState>,
}

impl AcmeManager {
    pub fn new(ca: Box<dyn AcmeCa>, domains: &[String]) -> Self {
        let state = domains.iter().map(|d| (d.clone(), DomainState::Idle)).collect();
        Self { ca, state }
    }

    /// Drive every domain currently due for (re-)issuance one step forward.
    /// `due` reports which domains need a fresh certificate right now (the
    /// caller consults `CertStore::needs_renewal`); domains not in `due`
    /// that are mid-challenge still advance to completion.
    pub fn tick(&mut self, due: &[String]) -> Vec<AcmeEvent> {
        let mut events = Vec::new();

        for domain in due {
            let state = self.state.entry(domain.clone()).or_insert(DomainState::Idle);
            if *state == DomainState::Idle {
                match self.ca.request_challenge(domain) {
                    Ok(challenge) => {
                        events.push(AcmeEvent::ChallengeReady {
                            domain: domain.clone(),
                            der: challenge.der,
                        });
                        *state = DomainState::ChallengePending;
                    }
                    Err(e) => {
                        log::warn!(target: "keymgr::acme", "challenge request failed for {domain}: {e}");
                    }
                }
            }
        }

        let pending: Vec<String> = self
            .state
            .iter()
            .filter(|(_, s)| **s == DomainState::ChallengePending)
            .map(|(d, _)| d.clone())
            .collect();

        for domain in pending {
            match self.ca.finalize(&domain) {
                Ok(chain_pem) => {
                    events.push(AcmeEvent::ChallengeDone { domain: domain.clone() });
                    events.push(AcmeEvent::Issued {
                        domain: domain.clone(),
                        chain_pem,
                    });
                    self.state.insert(domain, DomainState::Issued);
                }
                Err(e) => {
                    log::warn!(target: "keymgr::acme", "finalize failed for {domain}: {e}");
                }
            }
        }

        events
    }

    /// Reset a domain back to `Idle` so the next `tick` where it's `due`
    /// starts a fresh challenge cycle (used after a renewal window elapses).
    pub fn reset(&mut self, domain: &str) {
        self.state.insert(domain.to_string(), DomainState::Idle);
    }
}
