//! Key-manager and ACME sibling (component F): spec §4.F.
//!
//! Shares the worker record/control-socket plumbing with `supervisor-proto`
//! but diverges immediately from a network worker — neither role touches
//! the network stack or the accept lock (spec §3 invariant 4). `supervisor`
//! forks this crate's two entry points, [`run_keymgr`] and [`run_acme`],
//! exactly where it forks a network worker, branching on the reserved
//! worker id (`process::child_entry`).

pub mod acme;
pub mod acme_loop;
pub mod bootstrap_client;
pub mod cert_store;
pub mod crl_cache;
pub mod entropy;
pub mod errors;
pub mod keymgr_loop;
pub mod types;

pub use acme_loop::run_acme;
pub use keymgr_loop::run_keymgr;

/// What both sibling entry points need at startup: which domains this
/// server answers for (spec §4.C restart semantics: also used by a
/// restarted network worker's `CERTIFICATE_REQ`), and whether the
/// key-manager should kick off a CRL refresh after installing a fresh
/// certificate.
#[derive(Debug, Clone)]
pub struct KeymgrConfig {
    pub domains: Vec<String>,
    pub crl_refresh_enabled: bool,
}

impl KeymgrConfig {
    pub fn from_domains(domains: &[String]) -> Self {
        Self {
            domains: domains.to_vec(),
            crl_refresh_enabled: true,
        }
    }
}
