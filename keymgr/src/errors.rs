use thiserror::Error;

/// Certificate/CRL handling failures inside the key-manager sibling
/// (spec §4.F). All of these are class-3 soft errors per spec §7: the
/// offending request or refresh is logged and dropped, never fatal.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("CRL validation failed: {0}")]
    CrlValidation(String),
    #[error("certificate parsing failed: {0}")]
    CertParse(String),
    #[error("unknown domain: {0}")]
    UnknownDomain(String),
}

/// ACME challenge/issuance failures inside the ACME sibling (spec §4.F
/// "ACME sibling"). Like `TlsError`, these are logged and the affected
/// domain's renewal is retried on the next tick; they never bring down the
/// sibling process.
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("failed to build challenge certificate for {domain}: {reason}")]
    ChallengeCertFailed { domain: String, reason: String },
    #[error("CA directory request failed: {0}")]
    DirectoryRequest(String),
    #[error("certificate issuance failed for {domain}: {reason}")]
    IssuanceFailed { domain: String, reason: String },
}
