//! In-memory catalog of hardware-backed certificates.
//!
//! The [`Catalog`] holds certificates the shim has adopted on behalf of its
//! clients.  The private key behind each certificate lives in the upstream
//! agent; only the certificate wrapping is kept here, so signing with a
//! catalog certificate means asking the upstream to sign with its base key.
//!
//! The catalog also carries the upstream-cert cache: fingerprints of vendor
//! certificates seen directly in the upstream agent, which suppress-upstream
//! mode hides from clients.
//!
//! Thread safety: the catalog is owned by the shim server's state and only
//! touched while the server lock is held.

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};
use ssh_key::Certificate;
use tracing::debug;

use crate::error::{Result, ShimError};
use crate::proto;
use crate::upstream::UpstreamAgent;

/// SHA-256 of a key or certificate wire blob.
pub type Fingerprint = [u8; 32];

pub fn fingerprint(blob: &[u8]) -> Fingerprint {
    Sha256::digest(blob).into()
}

/// Fingerprint of the key that signs for `blob`: the base key for a
/// certificate, the key itself otherwise.
pub fn base_fingerprint(blob: &[u8]) -> Fingerprint {
    match proto::parse_certificate(blob).map(|cert| proto::base_key_blob(&cert)) {
        Some(Ok(base)) => fingerprint(&base),
        _ => fingerprint(blob),
    }
}

/// A certificate adopted into the catalog.
#[derive(Clone)]
pub struct CatalogEntry {
    pub certificate: Certificate,
    /// Wire blob of the certificate.
    pub key_blob: Vec<u8>,
    /// Wire blob of the certified (base) public key.
    pub base_blob: Vec<u8>,
    pub label: String,
}

impl std::fmt::Debug for CatalogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogEntry")
            .field("label", &self.label)
            .field("key_id", &self.certificate.key_id())
            .field("valid_after", &self.certificate.valid_after())
            .field("valid_before", &self.certificate.valid_before())
            .finish_non_exhaustive()
    }
}

impl CatalogEntry {
    /// Outside its validity window at `now` (Unix seconds).
    pub fn is_expired(&self, now: u64) -> bool {
        is_expired(&self.certificate, now)
    }
}

pub fn is_expired(cert: &Certificate, now: u64) -> bool {
    cert.valid_after() > now || cert.valid_before() < now
}

#[derive(Debug, Default)]
pub struct Catalog {
    entries: HashMap<Fingerprint, CatalogEntry>,
    upstream_certs: HashSet<Fingerprint>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.entries.contains_key(fp)
    }

    pub fn get(&self, fp: &Fingerprint) -> Option<&CatalogEntry> {
        self.entries.get(fp)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `fp` is a vendor certificate already seen in the upstream.
    pub fn is_upstream_cert(&self, fp: &Fingerprint) -> bool {
        self.upstream_certs.contains(fp)
    }

    pub fn cache_upstream_cert(&mut self, fp: Fingerprint) {
        self.upstream_certs.insert(fp);
    }

    /// Adopt a certificate whose private key lives in the upstream agent.
    ///
    /// Idempotent on the certificate fingerprint.  Fails with
    /// [`ShimError::BaseKeyMissing`] unless the upstream currently lists the
    /// certificate's base public key.
    pub async fn adopt(
        &mut self,
        upstream: &mut dyn UpstreamAgent,
        cert_blob: &[u8],
        label: String,
    ) -> Result<()> {
        let certificate = proto::parse_certificate(cert_blob).ok_or(ShimError::NotACert)?;
        let fp = fingerprint(cert_blob);
        if self.entries.contains_key(&fp) {
            return Ok(());
        }

        let base_blob = proto::base_key_blob(&certificate)?;
        let listed = upstream.list().await?;
        if !listed.iter().any(|id| id.key_blob == base_blob) {
            return Err(ShimError::BaseKeyMissing);
        }

        debug!(label = %label, key_id = %certificate.key_id(), "catalog: adopting certificate");
        self.upstream_certs.remove(&fp);
        self.entries.insert(
            fp,
            CatalogEntry {
                certificate,
                key_blob: cert_blob.to_vec(),
                base_blob,
                label,
            },
        );
        Ok(())
    }

    /// Remove `key_blob` from the catalog and from the upstream agent.
    ///
    /// Returns `true` when the upstream removed the key.  An upstream refusal
    /// is only an error when the catalog did not hold the key either.
    pub async fn remove(&mut self, upstream: &mut dyn UpstreamAgent, key_blob: &[u8]) -> Result<bool> {
        let fp = fingerprint(key_blob);
        let held = self.entries.remove(&fp);
        self.upstream_certs.remove(&fp);
        if let Some(entry) = &held {
            debug!(label = %entry.label, "catalog: removed certificate");
        }

        match upstream.remove(key_blob).await {
            Ok(()) => Ok(true),
            Err(ShimError::UpstreamFailure) if held.is_some() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drop every entry and the upstream-cert cache, and empty the upstream.
    pub async fn clear(&mut self, upstream: &mut dyn UpstreamAgent) -> Result<()> {
        let removed = self.entries.len();
        self.entries.clear();
        self.upstream_certs.clear();
        debug!(removed, "catalog: cleared");
        upstream.remove_all().await
    }
}
