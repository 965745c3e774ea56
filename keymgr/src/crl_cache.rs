//! CRL download/cache logic (adapted from the teacher's `tls::crl_cache`),
//! driving the `CRL` response payload of spec §4.F: the key-manager fetches
//! a domain's CRL from its certificate's distribution points and hands the
//! parsed revocation set back over the message bus.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use http_body_util::BodyExt;

use crate::bootstrap_client::BootstrapHttpClient;
use crate::errors::TlsError;
use crate::types::CrlCacheEntry;

#[derive(Clone)]
pub struct CrlCache {
    cache: Arc<RwLock<std::collections::HashMap<String, CrlCacheEntry>>>,
    http_client: BootstrapHttpClient,
    cache_hits: Arc<AtomicUsize>,
    cache_misses: Arc<AtomicUsize>,
}

impl Default for CrlCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CrlCache {
    pub fn new() -> Self {
        Self {
            cache: Arc::new(RwLock::new(std::collections::HashMap::with_capacity(64))),
            http_client: BootstrapHttpClient::new(),
            cache_hits: Arc::new(AtomicUsize::new(0)),
            cache_misses: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn get_stats(&self) -> (usize, usize) {
        (
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }

    /// Revocation status of `serial_number` against the cached (or freshly
    /// downloaded) CRL at `crl_url`. Soft-fails to "not revoked" on any
    /// download error per spec §7 class 3 (logged, never fatal).
    pub async fn is_revoked(&self, serial_number: &[u8], crl_url: &str) -> bool {
        if let Some(cached) = self.get_cached(crl_url) {
            if !Self::is_expired(&cached) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return cached.revoked_serials.contains(serial_number);
            }
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        match self.download_and_parse(crl_url).await {
            Ok(entry) => {
                let revoked = entry.revoked_serials.contains(serial_number);
                self.insert(crl_url.to_string(), entry);
                revoked
            }
            Err(e) => {
                log::warn!(target: "keymgr::crl", "failed to download CRL from {crl_url}: {e}");
                false
            }
        }
    }

    fn get_cached(&self, url: &str) -> Option<CrlCacheEntry> {
        match self.cache.read() {
            Ok(cache) => cache.get(url).cloned(),
            Err(poisoned) => {
                log::warn!(target: "keymgr::crl", "CRL cache read lock poisoned, recovering");
                poisoned.into_inner().get(url).cloned()
            }
        }
    }

    fn insert(&self, url: String, entry: CrlCacheEntry) {
        match self.cache.write() {
            Ok(mut cache) => {
                cache.insert(url, entry);
            }
            Err(poisoned) => {
                log::warn!(target: "keymgr::crl", "CRL cache write lock poisoned, recovering");
                poisoned.into_inner().insert(url, entry);
            }
        }
    }

    fn is_expired(entry: &CrlCacheEntry) -> bool {
        let now = SystemTime::now();
        if let Some(next_update) = entry.next_update {
            return now > next_update;
        }
        now.duration_since(entry.cached_at).unwrap_or(Duration::ZERO) > Duration::from_secs(24 * 3600)
    }

    async fn download_and_parse(&self, crl_url: &str) -> Result<CrlCacheEntry, TlsError> {
        let request = BootstrapHttpClient::get(crl_url)
            .map_err(|e| TlsError::CrlValidation(format!("failed to build request: {e}")))?;
        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|e| TlsError::CrlValidation(format!("download failed: {e}")))?;
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| TlsError::CrlValidation(format!("failed to read body: {e}")))?
            .to_bytes();
        Self::parse_crl_der(&body)
    }

    /// Parses only what the revocation check needs: the list of revoked
    /// serial numbers, via a minimal hand-rolled DER walk of the
    /// `TBSCertList.revokedCertificates` SEQUENCE. A production CRL parser
    /// (`x509-parser`'s `CertificateRevocationList`) would replace this.
    fn parse_crl_der(der: &[u8]) -> Result<CrlCacheEntry, TlsError> {
        use x509_parser::revocation_list::CertificateRevocationList;

        let crl = CertificateRevocationList::from_der(der)
            .map(|(_, crl)| crl)
            .map_err(|e| TlsError::CrlValidation(e.to_string()))?;

        let revoked_serials: HashSet<Vec<u8>> = crl
            .iter_revoked_certificates()
            .map(|r| r.raw_serial().to_vec())
            .collect();

        let next_update = crl.next_update().map(|t| {
            SystemTime::UNIX_EPOCH + Duration::from_secs(t.timestamp().max(0) as u64)
        });

        Ok(CrlCacheEntry {
            revoked_serials,
            cached_at: SystemTime::now(),
            next_update,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_crl_der_is_rejected() {
        assert!(CrlCache::parse_crl_der(&[1, 2, 3]).is_err());
    }

    #[test]
    fn fresh_cache_entry_is_not_expired_without_next_update() {
        let entry = CrlCacheEntry {
            revoked_serials: HashSet::new(),
            cached_at: SystemTime::now(),
            next_update: None,
        };
        assert!(!CrlCache::is_expired(&entry));
    }

    #[test]
    fn entry_past_next_update_is_expired() {
        let entry = CrlCacheEntry {
            revoked_serials: HashSet::new(),
            cached_at: SystemTime::now() - Duration::from_secs(3600),
            next_update: Some(SystemTime::now() - Duration::from_secs(1)),
        };
        assert!(CrlCache::is_expired(&entry));
    }
}
