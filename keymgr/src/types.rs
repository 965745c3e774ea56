//! Shapes shared across the key-manager's cert store, CRL cache, and ACME
//! manager (adapted from the teacher's `tls::types`, which this retrieval
//! pack did not carry a copy of — rebuilt to the shape `crl_cache.rs` and
//! `ocsp.rs` expect of it).

use std::time::SystemTime;

/// A cached, parsed CRL (spec §4.F "CRL" response payload), downloaded and
/// cached by `crl_cache::CrlCache`.
#[derive(Debug, Clone)]
pub struct CrlCacheEntry {
    pub revoked_serials: std::collections::HashSet<Vec<u8>>,
    pub cached_at: SystemTime,
    pub next_update: Option<SystemTime>,
}

/// The handful of fields the key-manager needs out of a domain's leaf
/// certificate: its serial (for CRL lookups) and the CRL distribution point
/// URLs to poll. Real validation (chain-of-trust, signature) is an external
/// collaborator per spec.md §1; this is only enough to drive the cache.
#[derive(Debug, Clone, Default)]
pub struct ParsedCertificate {
    pub serial_number: Vec<u8>,
    pub crl_urls: Vec<String>,
    pub not_after: Option<SystemTime>,
}

/// Parse the handful of fields `CrlCache` and the renewal clock need out of
/// a DER certificate, via `x509-parser` (grounded in the teacher's own use
/// of `x509_parser::prelude::*` for certificate parsing).
pub fn parse_certificate(der: &[u8]) -> Result<ParsedCertificate, crate::errors::TlsError> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| crate::errors::TlsError::CertParse(e.to_string()))?;

    let serial_number = cert.raw_serial().to_vec();

    let mut crl_urls = Vec::new();
    if let Ok(Some(ext)) = cert.get_extension_unique(&oid_registry::OID_X509_EXT_CRL_DISTRIBUTION_POINTS)
    {
        if let ParsedExtension::CRLDistributionPoints(points) = ext.parsed_extension() {
            for point in points.iter() {
                if let Some(DistributionPointName::FullName(names)) = &point.distribution_point {
                    for name in names {
                        if let GeneralName::URI(uri) = name {
                            crl_urls.push(uri.to_string());
                        }
                    }
                }
            }
        }
    }

    let not_after = SystemTime::UNIX_EPOCH
        .checked_add(std::time::Duration::from_secs(cert.validity().not_after.timestamp().max(0) as u64));

    Ok(ParsedCertificate {
        serial_number,
        crl_urls,
        not_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_der_is_a_parse_error() {
        assert!(parse_certificate(&[1, 2, 3]).is_err());
    }
}
