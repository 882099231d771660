//! The shim agent server.
//!
//! [`ShimServer`] combines the certificate catalog with the identities of the
//! upstream agent, prunes what should no longer be offered, and routes
//! signing to whichever key actually holds the private material.
//!
//! All state lives behind a single async mutex that is held across upstream
//! I/O, so at most one request is in flight to the upstream agent at a time.
//! The waiter table, the operator lock flag and the upstream close handle sit
//! outside that lock.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool};
use std::time::{SystemTime, UNIX_EPOCH};

use ssh_key::{Certificate, Signature};
use sshim_core::{KeyId, compose_label};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::{self, Catalog, Fingerprint, base_fingerprint, fingerprint};
use crate::error::{Result, ShimError};
use crate::proto::{self, AddedKey, Identity};
use crate::upstream::{CloseHandle, UpstreamAgent};
use crate::waiter::WaiterTable;

/// Orders identities by their key blobs.
pub type Comparator = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

#[derive(Clone)]
pub struct ServerOptions {
    /// Hide vendor certificates that live directly in the upstream agent.
    pub suppress_upstream: bool,
    pub comparator: Comparator,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            suppress_upstream: false,
            comparator: Arc::new(|a: &[u8], b: &[u8]| a.cmp(b)),
        }
    }
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("suppress_upstream", &self.suppress_upstream)
            .finish_non_exhaustive()
    }
}

impl ServerOptions {
    pub fn new(suppress_upstream: bool) -> Self {
        Self {
            suppress_upstream,
            ..Self::default()
        }
    }

    pub fn with_comparator<F>(mut self, comparator: F) -> Self
    where
        F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static,
    {
        self.comparator = Arc::new(comparator);
        self
    }
}

struct ShimState {
    upstream: Box<dyn UpstreamAgent>,
    catalog: Catalog,
}

/// Operator lock, distinct from the state mutex.  Only written while the
/// mutex is held, so readers holding the mutex see a settled value.
#[derive(Clone, Default)]
struct LockFlag(Arc<AtomicBool>);

impl LockFlag {
    fn get(&self) -> bool {
        self.0.load(atomic::Ordering::SeqCst)
    }

    fn set(&self, locked: bool) {
        self.0.store(locked, atomic::Ordering::SeqCst);
    }
}

pub struct ShimServer {
    state: Arc<Mutex<ShimState>>,
    locked: LockFlag,
    closer: Option<CloseHandle>,
    waiters: WaiterTable,
    options: ServerOptions,
}

impl std::fmt::Debug for ShimServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShimServer")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// A certificate key id that parses as a vendor [`KeyId`].
fn is_vendor_cert(cert: &Certificate) -> bool {
    KeyId::parse(cert.key_id()).is_ok()
}

fn is_vendor_blob(blob: &[u8]) -> bool {
    proto::parse_certificate(blob).is_some_and(|cert| is_vendor_cert(&cert))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl ShimServer {
    /// Build a server around an upstream connection.
    ///
    /// In suppress-upstream mode the vendor certificates the upstream holds
    /// right now are recorded so they are never offered.
    pub async fn new(mut upstream: Box<dyn UpstreamAgent>, options: ServerOptions) -> Result<Self> {
        let mut catalog = Catalog::new();
        if options.suppress_upstream {
            for identity in upstream.list().await? {
                if is_vendor_blob(&identity.key_blob) {
                    catalog.cache_upstream_cert(fingerprint(&identity.key_blob));
                }
            }
        }
        let closer = upstream.close_handle();
        Ok(Self {
            state: Arc::new(Mutex::new(ShimState { upstream, catalog })),
            locked: LockFlag::default(),
            closer,
            waiters: WaiterTable::new(),
            options,
        })
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub async fn list(&self) -> Result<Vec<Identity>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if self.locked.get() {
            return Ok(Vec::new());
        }
        let upstream = filter(state).await?;

        let mut identities: Vec<Identity> = state
            .catalog
            .iter()
            .map(|entry| Identity {
                key_blob: entry.key_blob.clone(),
                comment: entry.label.clone(),
            })
            .collect();
        for identity in upstream {
            if let Some(comment) = self.visible_comment(&mut state.catalog, &identity) {
                identities.push(Identity {
                    key_blob: identity.key_blob,
                    comment,
                });
            }
        }
        identities.sort_by(|a, b| (self.options.comparator)(&a.key_blob, &b.key_blob));

        debug!(count = identities.len(), "list");
        Ok(identities)
    }

    pub async fn sign(&self, key_blob: &[u8], data: &[u8], flags: u32) -> Result<Signature> {
        if key_blob.is_empty() {
            return Err(ShimError::NullKey);
        }
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if self.locked.get() {
            return Err(ShimError::Locked);
        }
        filter(state).await?;

        let vendor = is_vendor_blob(key_blob);
        if vendor && let Some(entry) = state.catalog.get(&fingerprint(key_blob)) {
            debug!(label = %entry.label, data_len = data.len(), "sign: catalog certificate, using base key");
            return state.upstream.sign(&entry.base_blob, data, flags).await;
        }
        if self.options.suppress_upstream && vendor {
            debug!("sign: refusing suppressed upstream certificate");
            return Err(ShimError::NotFound);
        }
        debug!(data_len = data.len(), "sign: upstream key");
        state.upstream.sign(key_blob, data, flags).await
    }

    pub async fn add(&self, key: AddedKey) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if self.locked.get() {
            return Err(ShimError::Locked);
        }
        state.upstream.add(&key).await?;

        if self.options.suppress_upstream
            && let Some(blob) = &key.certificate
            && is_vendor_blob(blob)
        {
            debug!("add: suppressing vendor certificate");
            state.catalog.cache_upstream_cert(fingerprint(blob));
        }
        Ok(())
    }

    pub async fn remove(&self, key_blob: &[u8]) -> Result<()> {
        if key_blob.is_empty() {
            return Err(ShimError::NullKey);
        }
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if self.locked.get() {
            return Err(ShimError::Locked);
        }
        state.catalog.remove(state.upstream.as_mut(), key_blob).await?;
        Ok(())
    }

    pub async fn remove_all(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if self.locked.get() {
            return Err(ShimError::Locked);
        }
        state.catalog.clear(state.upstream.as_mut()).await
    }

    /// Lock the shim and the upstream agent.  An upstream refusal leaves the
    /// shim unlocked.
    pub async fn lock(&self, passphrase: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.locked.get() {
            return Err(ShimError::AlreadyLocked);
        }
        state.upstream.lock(passphrase).await?;
        self.locked.set(true);
        info!("agent locked");
        Ok(())
    }

    pub async fn unlock(&self, passphrase: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !self.locked.get() {
            return Err(ShimError::NotLocked);
        }
        state.upstream.unlock(passphrase).await?;
        self.locked.set(false);
        info!("agent unlocked");
        Ok(())
    }

    /// Signing handles for every identity [`list`](Self::list) would offer.
    pub async fn signers(&self) -> Result<Vec<ShimSigner>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if self.locked.get() {
            return Err(ShimError::Locked);
        }
        let upstream = filter(state).await?;

        let mut signers: Vec<ShimSigner> = state
            .catalog
            .iter()
            .map(|entry| ShimSigner {
                state: Arc::clone(&self.state),
                locked: self.locked.clone(),
                key_blob: entry.key_blob.clone(),
                sign_blob: entry.base_blob.clone(),
                comment: entry.label.clone(),
            })
            .collect();
        for identity in upstream {
            if let Some(comment) = self.visible_comment(&mut state.catalog, &identity) {
                signers.push(ShimSigner {
                    state: Arc::clone(&self.state),
                    locked: self.locked.clone(),
                    sign_blob: identity.key_blob.clone(),
                    key_blob: identity.key_blob,
                    comment,
                });
            }
        }
        signers.sort_by(|a, b| (self.options.comparator)(&a.key_blob, &b.key_blob));
        Ok(signers)
    }

    /// Track a certificate whose private key is held by the upstream agent.
    ///
    /// The label is the classifier's label joined with `suffix`.
    pub async fn adopt_hw_cert(&self, key_blob: &[u8], suffix: &str) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if self.locked.get() {
            return Err(ShimError::Locked);
        }
        if key_blob.is_empty() {
            return Err(ShimError::NullKey);
        }
        if state.catalog.contains(&fingerprint(key_blob)) {
            return Ok(());
        }
        let cert = proto::parse_certificate(key_blob).ok_or(ShimError::NotACert)?;
        let kind_label = sshim_core::label(&cert).unwrap_or_default();
        let label = compose_label(&kind_label, suffix);

        state
            .catalog
            .adopt(state.upstream.as_mut(), key_blob, label.clone())
            .await?;
        info!(label = %label, "adopted hardware certificate");
        Ok(())
    }

    /// Pass a raw request to the upstream agent and return its raw reply.
    pub async fn forward(&self, request: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.state.lock().await;
        if self.locked.get() {
            return Err(ShimError::Locked);
        }
        state.upstream.forward(request).await
    }

    /// Park until the next [`broadcast`](Self::broadcast) of `op`.
    pub async fn wait(&self, op: u8) {
        self.waiters.wait(op).await;
    }

    pub fn broadcast(&self, op: u8) {
        self.waiters.broadcast(op);
    }

    /// Close the upstream connection.  A request stuck upstream is failed
    /// first, so this never waits on it.
    pub async fn close(&self) -> Result<()> {
        if self.locked.get() {
            return Err(ShimError::Locked);
        }
        if let Some(closer) = &self.closer {
            closer.close();
        }
        let mut state = self.state.lock().await;
        state.upstream.close().await
    }

    /// Comment for an upstream identity, or `None` when it must not be
    /// offered to clients.
    fn visible_comment(&self, catalog: &mut Catalog, identity: &Identity) -> Option<String> {
        let Some(cert) = proto::parse_certificate(&identity.key_blob) else {
            return Some(identity.comment.clone());
        };
        let fp = fingerprint(&identity.key_blob);
        if catalog.contains(&fp) || catalog.is_upstream_cert(&fp) {
            return None;
        }
        if self.options.suppress_upstream && is_vendor_cert(&cert) {
            debug!(comment = %identity.comment, "suppressing upstream vendor certificate");
            catalog.cache_upstream_cert(fp);
            return None;
        }
        let kind_label = sshim_core::label(&cert).unwrap_or_default();
        Some(compose_label(&kind_label, &identity.comment))
    }
}

/// Prune orphaned and expired certificates and return the upstream
/// identities that survived.
async fn filter(state: &mut ShimState) -> Result<Vec<Identity>> {
    let ShimState {
        upstream, catalog, ..
    } = state;
    let upstream = upstream.as_mut();
    let mut listed = upstream.list().await?;
    let mut errors = Vec::new();

    // An empty upstream may just be locked or unreachable.
    if !listed.is_empty() {
        let bases: HashSet<Fingerprint> = listed
            .iter()
            .map(|identity| base_fingerprint(&identity.key_blob))
            .collect();
        let orphans: Vec<Vec<u8>> = catalog
            .iter()
            .filter(|entry| !bases.contains(&fingerprint(&entry.base_blob)))
            .map(|entry| entry.key_blob.clone())
            .collect();
        for blob in orphans {
            debug!("filter: base key gone, dropping certificate");
            remove_and_prune(catalog, upstream, &mut listed, &blob, &mut errors).await;
        }
    }

    let now = unix_now();
    let expired: Vec<Vec<u8>> = listed
        .iter()
        .filter(|identity| {
            proto::parse_certificate(&identity.key_blob)
                .is_some_and(|cert| catalog::is_expired(&cert, now))
        })
        .map(|identity| identity.key_blob.clone())
        .chain(
            catalog
                .iter()
                .filter(|entry| entry.is_expired(now))
                .map(|entry| entry.key_blob.clone()),
        )
        .collect();
    for blob in expired {
        debug!("filter: dropping expired certificate");
        remove_and_prune(catalog, upstream, &mut listed, &blob, &mut errors).await;
    }

    if errors.is_empty() {
        Ok(listed)
    } else {
        Err(ShimError::Filter(errors))
    }
}

async fn remove_and_prune(
    catalog: &mut Catalog,
    upstream: &mut dyn UpstreamAgent,
    listed: &mut Vec<Identity>,
    blob: &[u8],
    errors: &mut Vec<ShimError>,
) {
    match catalog.remove(upstream, blob).await {
        Ok(true) => listed.retain(|identity| identity.key_blob != blob),
        Ok(false) => {}
        Err(e) => {
            warn!(error = %e, "filter: remove failed");
            errors.push(e);
        }
    }
}

/// Signing handle returned by [`ShimServer::signers`].
///
/// Signing goes through the server lock and fails while the server is
/// locked.
pub struct ShimSigner {
    state: Arc<Mutex<ShimState>>,
    locked: LockFlag,
    key_blob: Vec<u8>,
    /// Key the upstream signs with: the base key for catalog certificates.
    sign_blob: Vec<u8>,
    comment: String,
}

impl std::fmt::Debug for ShimSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShimSigner")
            .field("comment", &self.comment)
            .finish_non_exhaustive()
    }
}

impl ShimSigner {
    /// Wire blob of the public key or certificate this signer presents.
    pub fn public_key_blob(&self) -> &[u8] {
        &self.key_blob
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub async fn sign(&self, data: &[u8], flags: u32) -> Result<Signature> {
        let mut state = self.state.lock().await;
        if self.locked.get() {
            return Err(ShimError::Locked);
        }
        state.upstream.sign(&self.sign_blob, data, flags).await
    }
}
