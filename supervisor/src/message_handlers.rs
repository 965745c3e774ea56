//! Message handlers (component G): request/response glue for certificate,
//! CRL, entropy, and ACME-challenge traffic arriving over the control
//! socket from the key-manager/ACME siblings (spec §4.F, §4.G).
//!
//! Frame validation (size fields consistent, domain NUL-terminated) already
//! happened in `supervisor_proto::bus::parse_keymgr_frame`; this module adds
//! the one check that's inherently application-level — whether the named
//! domain is one this worker actually serves — and then applies the message
//! to the `DomainTlsContexts` collaborator (spec.md names TLS context
//! management only by interface, per §1 "Out of scope").

use supervisor_proto::bus::{BusError, DomainName, KeymgrMessage};

/// What a network worker's TLS layer needs to expose so incoming keymgr
/// messages can be applied to it. A real implementation owns one TLS
/// `ServerConfig` per domain; this crate only drives the interface.
pub trait DomainTlsContexts {
    fn is_known_domain(&self, domain: &str) -> bool;
    fn install_certificate(&mut self, domain: &str, chain_pem: &[u8]);
    fn install_crl(&mut self, domain: &str, crl_pem: &[u8]);
    fn seed_rng(&mut self, buf: &[u8; supervisor_proto::bus::ENTROPY_LEN]);
    fn set_challenge_cert(&mut self, domain: &str, der: &[u8]);
    fn clear_challenge_cert(&mut self, domain: &str);
}

/// Outcome of handling one message, for logging/testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Certificate,
    Crl,
    Entropy,
    AcmeSet,
    AcmeClear,
    /// A request type arriving on the response-consuming side; nothing to
    /// apply locally (handled instead by the keymgr side of the bus).
    NotApplicable,
}

#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("unknown domain: {0}")]
    UnknownDomain(String),
}

/// Parse and apply one raw frame received from the key-manager/ACME bus.
/// Matches spec.md §4.F: "A response naming an unknown domain is logged and
/// dropped" and §8 scenario 6: malformed frames are logged, not acted upon,
/// and the loop continues either way — callers should log `HandleError` and
/// move on, never propagate it as fatal.
pub fn handle_keymgr_frame(
    raw: &[u8],
    contexts: &mut dyn DomainTlsContexts,
) -> Result<Applied, HandleError> {
    let msg = supervisor_proto::bus::parse_keymgr_frame(raw)?;
    apply(msg, contexts)
}

fn apply(
    msg: KeymgrMessage,
    contexts: &mut dyn DomainTlsContexts,
) -> Result<Applied, HandleError> {
    match msg {
        KeymgrMessage::Certificate { domain, chain_pem } => {
            require_known(&domain, contexts)?;
            contexts.install_certificate(domain.as_str(), &chain_pem);
            Ok(Applied::Certificate)
        }
        KeymgrMessage::Crl { domain, crl_pem } => {
            require_known(&domain, contexts)?;
            contexts.install_crl(domain.as_str(), &crl_pem);
            Ok(Applied::Crl)
        }
        KeymgrMessage::EntropyResp { buf } => {
            contexts.seed_rng(&buf);
            Ok(Applied::Entropy)
        }
        KeymgrMessage::AcmeChallengeSetCert { domain, der } => {
            // Lazily initialized on set, per spec §4.F; unknown domains are
            // not rejected here because the ACME challenge can introduce a
            // domain the worker hasn't seen a CERTIFICATE for yet.
            contexts.set_challenge_cert(domain.as_str(), &der);
            Ok(Applied::AcmeSet)
        }
        KeymgrMessage::AcmeChallengeClearCert { domain } => {
            contexts.clear_challenge_cert(domain.as_str());
            Ok(Applied::AcmeClear)
        }
        KeymgrMessage::CertificateReq { .. }
        | KeymgrMessage::EntropyReq
        | KeymgrMessage::AcceptAvailable
        | KeymgrMessage::Shutdown => Ok(Applied::NotApplicable),
    }
}

/// Minimal `DomainTlsContexts` for the `supervisor` binary: tracks which
/// domains this worker serves and logs what it would otherwise install. Real
/// TLS-context management is an external collaborator per spec.md §1.
pub struct LoggingDomainTlsContexts {
    known: std::collections::HashSet<String>,
}

impl LoggingDomainTlsContexts {
    pub fn new(domains: &[String]) -> Self {
        Self {
            known: domains.iter().cloned().collect(),
        }
    }
}

impl DomainTlsContexts for LoggingDomainTlsContexts {
    fn is_known_domain(&self, domain: &str) -> bool {
        self.known.contains(domain)
    }
    fn install_certificate(&mut self, domain: &str, chain_pem: &[u8]) {
        log::info!(target: "worker::tls", "installed certificate for {domain} ({} bytes)", chain_pem.len());
    }
    fn install_crl(&mut self, domain: &str, crl_pem: &[u8]) {
        log::info!(target: "worker::tls", "installed CRL for {domain} ({} bytes)", crl_pem.len());
    }
    fn seed_rng(&mut self, buf: &[u8; supervisor_proto::bus::ENTROPY_LEN]) {
        log::debug!(target: "worker::tls", "reseeded RNG with {} bytes of entropy", buf.len());
    }
    fn set_challenge_cert(&mut self, domain: &str, der: &[u8]) {
        self.known.insert(domain.to_string());
        log::info!(target: "worker::tls", "installed ACME challenge cert for {domain} ({} bytes)", der.len());
    }
    fn clear_challenge_cert(&mut self, domain: &str) {
        log::info!(target: "worker::tls", "cleared ACME challenge cert for {domain}");
    }
}

fn require_known(
    domain: &DomainName,
    contexts: &dyn DomainTlsContexts,
) -> Result<(), HandleError> {
    if contexts.is_known_domain(domain.as_str()) {
        Ok(())
    } else {
        Err(HandleError::UnknownDomain(domain.as_str().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use supervisor_proto::bus::{encode_keymgr_frame, MessageId, ENTROPY_LEN};

    #[derive(Default)]
    struct FakeContexts {
        known: std::collections::HashSet<String>,
        certs: HashMap<String, Vec<u8>>,
        crls: HashMap<String, Vec<u8>>,
        challenges: HashMap<String, Vec<u8>>,
        last_seed: Option<Vec<u8>>,
    }

    impl DomainTlsContexts for FakeContexts {
        fn is_known_domain(&self, domain: &str) -> bool {
            self.known.contains(domain)
        }
        fn install_certificate(&mut self, domain: &str, chain_pem: &[u8]) {
            self.certs.insert(domain.to_string(), chain_pem.to_vec());
        }
        fn install_crl(&mut self, domain: &str, crl_pem: &[u8]) {
            self.crls.insert(domain.to_string(), crl_pem.to_vec());
        }
        fn seed_rng(&mut self, buf: &[u8; ENTROPY_LEN]) {
            self.last_seed = Some(buf.to_vec());
        }
        fn set_challenge_cert(&mut self, domain: &str, der: &[u8]) {
            self.challenges.insert(domain.to_string(), der.to_vec());
        }
        fn clear_challenge_cert(&mut self, domain: &str) {
            self.challenges.remove(domain);
        }
    }

    #[test]
    fn certificate_applies_to_known_domain() {
        let mut ctx = FakeContexts::default();
        ctx.known.insert("example.com".to_string());
        let domain = DomainName::new("example.com").unwrap();
        let frame = encode_keymgr_frame(MessageId::Certificate, Some(&domain), b"pem-bytes");

        assert_eq!(handle_keymgr_frame(&frame, &mut ctx).unwrap(), Applied::Certificate);
        assert_eq!(ctx.certs.get("example.com").unwrap(), b"pem-bytes");
    }

    #[test]
    fn unknown_domain_is_dropped_with_an_error() {
        let mut ctx = FakeContexts::default();
        let domain = DomainName::new("unknown.example").unwrap();
        let frame = encode_keymgr_frame(MessageId::Certificate, Some(&domain), b"pem-bytes");

        let err = handle_keymgr_frame(&frame, &mut ctx).unwrap_err();
        assert!(matches!(err, HandleError::UnknownDomain(_)));
        assert!(ctx.certs.is_empty());
    }

    #[test]
    fn malformed_frame_does_not_mutate_any_domain_state() {
        let mut ctx = FakeContexts::default();
        ctx.known.insert("example.com".to_string());
        let short = [1u8, 2, 3];
        assert!(handle_keymgr_frame(&short, &mut ctx).is_err());
        assert!(ctx.certs.is_empty());
        assert!(ctx.crls.is_empty());
    }

    #[test]
    fn acme_set_then_clear_restores_no_challenge() {
        let mut ctx = FakeContexts::default();
        let domain = DomainName::new("acme.example").unwrap();
        let set = encode_keymgr_frame(MessageId::AcmeChallengeSetCert, Some(&domain), b"der");
        let clear = encode_keymgr_frame(MessageId::AcmeChallengeClearCert, Some(&domain), &[]);

        assert_eq!(handle_keymgr_frame(&set, &mut ctx).unwrap(), Applied::AcmeSet);
        assert!(ctx.challenges.contains_key("acme.example"));
        assert_eq!(handle_keymgr_frame(&clear, &mut ctx).unwrap(), Applied::AcmeClear);
        assert!(!ctx.challenges.contains_key("acme.example"));
    }

    #[test]
    fn entropy_response_seeds_rng_regardless_of_domain_knowledge() {
        let mut ctx = FakeContexts::default();
        let frame = encode_keymgr_frame(MessageId::EntropyResp, None, &[7u8; ENTROPY_LEN]);
        assert_eq!(handle_keymgr_frame(&frame, &mut ctx).unwrap(), Applied::Entropy);
        assert_eq!(ctx.last_seed.unwrap(), vec![7u8; ENTROPY_LEN]);
    }
}
