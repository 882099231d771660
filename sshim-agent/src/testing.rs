//! Test fixtures: an in-memory upstream agent and a throwaway CA.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::rngs::OsRng;
use signature::Signer as _;
use ssh_key::certificate::Builder;
use ssh_key::{Algorithm, Certificate, PrivateKey, Signature};
use sshim_core::certkind::TOUCHLESS_SUDO_HOSTS;
use sshim_core::{KeyId, TouchPolicy};

use crate::error::{Result, ShimError};
use crate::proto::{self, op, AddedKey, Identity};
use crate::upstream::UpstreamAgent;

pub(crate) fn new_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

/// A valid hardware-key KeyID with touch policy `Always`.
pub(crate) fn key_id_json(trans_id: &str) -> String {
    KeyId {
        trans_id: trans_id.to_string(),
        principals: vec!["alice".to_string()],
        req_user: "alice".to_string(),
        is_hw_key: true,
        touch_policy: TouchPolicy::Always,
        ..KeyId::default()
    }
    .render()
    .unwrap()
}

/// `valid_before` for certificates that should not expire during a test
/// run.  The certificate builder rejects values near `u64::MAX`.
pub(crate) const FAR_FUTURE: u64 = 4_000_000_000;

pub(crate) fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

pub(crate) struct Certs {
    ca: PrivateKey,
}

impl Certs {
    pub(crate) fn new() -> Self {
        Self { ca: new_key() }
    }

    pub(crate) fn issue(&self, base: &PrivateKey, key_id: &str, after: u64, before: u64) -> Certificate {
        self.issue_with_hosts(base, key_id, after, before, None)
    }

    pub(crate) fn issue_with_hosts(
        &self,
        base: &PrivateKey,
        key_id: &str,
        after: u64,
        before: u64,
        sudo_hosts: Option<&str>,
    ) -> Certificate {
        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            base.public_key().key_data().clone(),
            after,
            before,
        )
        .unwrap();
        builder.key_id(key_id).unwrap();
        builder.all_principals_valid().unwrap();
        if let Some(hosts) = sudo_hosts {
            builder.critical_option(TOUCHLESS_SUDO_HOSTS, hosts).unwrap();
        }
        builder.sign(&self.ca).unwrap()
    }
}

struct MockEntry {
    blob: Vec<u8>,
    comment: String,
    key: Option<PrivateKey>,
}

#[derive(Default)]
struct MockState {
    entries: Vec<MockEntry>,
    passphrase: Option<String>,
    fail_locking: bool,
    fail_removes: bool,
    closed: bool,
    signed_with: Vec<Vec<u8>>,
    forwarded: Vec<Vec<u8>>,
}

/// In-memory upstream agent.  Clones share state, so a test can keep a
/// handle after boxing one into the server.
#[derive(Clone, Default)]
pub(crate) struct MockUpstream {
    state: Arc<Mutex<MockState>>,
}

impl MockUpstream {
    /// Hold a private key, listed as its plain public key.
    pub(crate) fn add_key(&self, key: PrivateKey, comment: &str) {
        let blob = proto::encode_blob(key.public_key().key_data()).unwrap();
        self.push(blob, comment, Some(key));
    }

    /// Hold a certificate backed by `key`.
    pub(crate) fn add_cert(&self, cert: &Certificate, key: PrivateKey, comment: &str) {
        let blob = proto::encode_blob(cert).unwrap();
        self.push(blob, comment, Some(key));
    }

    /// Forget a key without going through the agent protocol.
    pub(crate) fn drop_blob(&self, blob: &[u8]) {
        self.state.lock().unwrap().entries.retain(|e| e.blob != blob);
    }

    pub(crate) fn blobs(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|e| e.blob.clone())
            .collect()
    }

    pub(crate) fn signed_with(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().signed_with.clone()
    }

    pub(crate) fn forwarded(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().forwarded.clone()
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.state.lock().unwrap().passphrase.is_some()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Simulate the upstream going away.
    pub(crate) fn close_now(&self) {
        self.state.lock().unwrap().closed = true;
    }

    /// Make lock and unlock answer `FAILURE`.
    pub(crate) fn fail_locking(&self, fail: bool) {
        self.state.lock().unwrap().fail_locking = fail;
    }

    /// Make single-key removal answer `FAILURE`.
    pub(crate) fn fail_removes(&self, fail: bool) {
        self.state.lock().unwrap().fail_removes = fail;
    }

    fn push(&self, blob: Vec<u8>, comment: &str, key: Option<PrivateKey>) {
        self.state.lock().unwrap().entries.push(MockEntry {
            blob,
            comment: comment.to_string(),
            key,
        });
    }
}

#[async_trait]
impl UpstreamAgent for MockUpstream {
    async fn forward(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(ShimError::UpstreamClosed);
        }
        state.forwarded.push(request.to_vec());
        Ok(vec![op::SUCCESS])
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }

    async fn list(&mut self) -> Result<Vec<Identity>> {
        let state = self.state.lock().unwrap();
        if state.passphrase.is_some() {
            return Ok(Vec::new());
        }
        Ok(state
            .entries
            .iter()
            .map(|e| Identity {
                key_blob: e.blob.clone(),
                comment: e.comment.clone(),
            })
            .collect())
    }

    async fn sign(&mut self, key_blob: &[u8], data: &[u8], _flags: u32) -> Result<Signature> {
        let mut state = self.state.lock().unwrap();
        if state.passphrase.is_some() {
            return Err(ShimError::UpstreamFailure);
        }
        let key = state
            .entries
            .iter()
            .find(|e| e.blob == key_blob)
            .and_then(|e| e.key.clone())
            .ok_or(ShimError::UpstreamFailure)?;
        state.signed_with.push(key_blob.to_vec());
        key.try_sign(data).map_err(|_| ShimError::UpstreamFailure)
    }

    async fn add(&mut self, key: &AddedKey) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.passphrase.is_some() {
            return Err(ShimError::UpstreamFailure);
        }
        state.forwarded.push(key.message.to_vec());
        if let Some(blob) = &key.certificate {
            state.entries.push(MockEntry {
                blob: blob.clone(),
                comment: String::new(),
                key: None,
            });
        }
        Ok(())
    }

    async fn remove(&mut self, key_blob: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_removes {
            return Err(ShimError::UpstreamFailure);
        }
        let before = state.entries.len();
        state.entries.retain(|e| e.blob != key_blob);
        if state.entries.len() == before {
            return Err(ShimError::UpstreamFailure);
        }
        Ok(())
    }

    async fn remove_all(&mut self) -> Result<()> {
        self.state.lock().unwrap().entries.clear();
        Ok(())
    }

    async fn lock(&mut self, passphrase: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_locking || state.passphrase.is_some() {
            return Err(ShimError::UpstreamFailure);
        }
        state.passphrase = Some(passphrase.to_string());
        Ok(())
    }

    async fn unlock(&mut self, passphrase: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_locking || state.passphrase.as_deref() != Some(passphrase) {
            return Err(ShimError::UpstreamFailure);
        }
        state.passphrase = None;
        Ok(())
    }
}
