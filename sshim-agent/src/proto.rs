//! SSH agent message codec.
//!
//! Covers the subset of draft-miller-ssh-agent the shim handles itself, the
//! replies it needs to understand from the upstream agent, and the vendor
//! extension messages (`ADD_HARD_CERT`, slot operations, `WAIT`).
//!
//! Keys travel as their wire blobs; certificates are decoded on demand with
//! [`parse_certificate`].

use ssh_agent_lib::proto::{AddSmartcardKeyConstrained, KeyConstraint, SmartcardKey};
use ssh_encoding::{Decode, Encode, Reader as _};
use ssh_key::public::KeyData;
use ssh_key::{Certificate, Signature};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Result, ShimError};

/// Message numbers.
pub mod op {
    pub const REQUEST_V1_IDENTITIES: u8 = 1;
    pub const RSA_IDENTITIES_ANSWER: u8 = 2;
    pub const FAILURE: u8 = 5;
    pub const SUCCESS: u8 = 6;
    pub const REQUEST_IDENTITIES: u8 = 11;
    pub const IDENTITIES_ANSWER: u8 = 12;
    pub const SIGN_REQUEST: u8 = 13;
    pub const SIGN_RESPONSE: u8 = 14;
    pub const ADD_IDENTITY: u8 = 17;
    pub const REMOVE_IDENTITY: u8 = 18;
    pub const REMOVE_ALL_IDENTITIES: u8 = 19;
    pub const ADD_SMARTCARD_KEY: u8 = 20;
    pub const REMOVE_SMARTCARD_KEY: u8 = 21;
    pub const LOCK: u8 = 22;
    pub const UNLOCK: u8 = 23;
    pub const ADD_ID_CONSTRAINED: u8 = 25;
    pub const ADD_SMARTCARD_KEY_CONSTRAINED: u8 = 26;

    // Vendor extensions.
    pub const ADD_HARD_CERT: u8 = 31;
    pub const LIST_SLOTS: u8 = 32;
    pub const READ_SLOT: u8 = 33;
    pub const ATTEST_SLOT: u8 = 34;
    pub const WAIT: u8 = 35;

    // Key constraint tags.
    pub const CONSTRAIN_LIFETIME: u8 = 1;
    pub const CONSTRAIN_CONFIRM: u8 = 2;
}

/// Reply body for vendor requests that succeed.
pub const SUCCESS_REPLY: &[u8] = b"SUCCESS";

const CERT_ALGORITHM_SUFFIX: &str = "-cert-v01@openssh.com";

/// A public key (or certificate) blob with its comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub key_blob: Vec<u8>,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    pub key_blob: Vec<u8>,
    pub data: Vec<u8>,
    pub flags: u32,
}

/// An `ADD_IDENTITY` / `ADD_ID_CONSTRAINED` request.
///
/// The private key material is never decoded; `message` is forwarded to the
/// upstream agent byte for byte.  When the credential is a certificate its
/// blob is extracted so the shim can track it.
pub struct AddedKey {
    pub message: Zeroizing<Vec<u8>>,
    pub certificate: Option<Vec<u8>>,
}

impl std::fmt::Debug for AddedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddedKey")
            .field("message", &"[redacted]")
            .field("certificate", &self.certificate.as_ref().map(Vec::len))
            .finish()
    }
}

impl AddedKey {
    /// Decode from a full request payload (opcode included).
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = payload
            .get(1..)
            .ok_or_else(|| ShimError::Malformed("empty add-identity request".to_string()))?;
        let key_type = String::decode(&mut reader)?;
        let certificate = if key_type.ends_with(CERT_ALGORITHM_SUFFIX) {
            Some(Vec::<u8>::decode(&mut reader)?)
        } else {
            None
        };
        Ok(Self {
            message: Zeroizing::new(payload.to_vec()),
            certificate,
        })
    }
}

/// Standard requests the shim answers itself.
#[derive(Debug)]
pub enum Request {
    RequestV1Identities,
    RequestIdentities,
    Sign(SignRequest),
    Add(AddedKey),
    Remove(Vec<u8>),
    RemoveAll,
    Lock(Zeroizing<String>),
    Unlock(Zeroizing<String>),
}

impl Request {
    /// Decode a request payload.  Returns `Ok(None)` for message numbers that
    /// are not handled in-process.
    pub fn decode(payload: &[u8]) -> Result<Option<Self>> {
        let Some((&msg, mut body)) = payload.split_first() else {
            return Err(ShimError::Malformed("empty request".to_string()));
        };
        let request = match msg {
            op::REQUEST_V1_IDENTITIES => Self::RequestV1Identities,
            op::REQUEST_IDENTITIES => Self::RequestIdentities,
            op::SIGN_REQUEST => {
                let key_blob = Vec::<u8>::decode(&mut body)?;
                let data = Vec::<u8>::decode(&mut body)?;
                let flags = u32::decode(&mut body)?;
                Self::Sign(SignRequest { key_blob, data, flags })
            }
            op::ADD_IDENTITY | op::ADD_ID_CONSTRAINED => Self::Add(AddedKey::decode(payload)?),
            op::REMOVE_IDENTITY => Self::Remove(Vec::<u8>::decode(&mut body)?),
            op::REMOVE_ALL_IDENTITIES => Self::RemoveAll,
            op::LOCK => Self::Lock(Zeroizing::new(String::decode(&mut body)?)),
            op::UNLOCK => Self::Unlock(Zeroizing::new(String::decode(&mut body)?)),
            _ => return Ok(None),
        };
        Ok(Some(request))
    }

    /// Encode for sending to the upstream agent.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::RequestV1Identities => buf.push(op::REQUEST_V1_IDENTITIES),
            Self::RequestIdentities => buf.push(op::REQUEST_IDENTITIES),
            Self::Sign(req) => {
                buf.push(op::SIGN_REQUEST);
                req.key_blob.encode(&mut buf)?;
                req.data.encode(&mut buf)?;
                req.flags.encode(&mut buf)?;
            }
            Self::Add(key) => buf.extend_from_slice(&key.message),
            Self::Remove(key_blob) => {
                buf.push(op::REMOVE_IDENTITY);
                key_blob.encode(&mut buf)?;
            }
            Self::RemoveAll => buf.push(op::REMOVE_ALL_IDENTITIES),
            Self::Lock(passphrase) => {
                buf.push(op::LOCK);
                passphrase.as_str().encode(&mut buf)?;
            }
            Self::Unlock(passphrase) => {
                buf.push(op::UNLOCK);
                passphrase.as_str().encode(&mut buf)?;
            }
        }
        Ok(buf)
    }
}

/// Replies the shim sends to its clients.
#[derive(Debug)]
pub enum Response {
    Success,
    Failure,
    /// Protocol 1 is not supported; always answered with zero keys.
    V1IdentitiesAnswer,
    Identities(Vec<Identity>),
    Signature(Signature),
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::Success => buf.push(op::SUCCESS),
            Self::Failure => buf.push(op::FAILURE),
            Self::V1IdentitiesAnswer => {
                buf.push(op::RSA_IDENTITIES_ANSWER);
                0u32.encode(&mut buf)?;
            }
            Self::Identities(identities) => {
                buf.push(op::IDENTITIES_ANSWER);
                (identities.len() as u32).encode(&mut buf)?;
                for identity in identities {
                    identity.key_blob.encode(&mut buf)?;
                    identity.comment.encode(&mut buf)?;
                }
            }
            Self::Signature(signature) => {
                buf.push(op::SIGN_RESPONSE);
                encode_blob(signature)?.encode(&mut buf)?;
            }
        }
        Ok(buf)
    }
}

fn reply_type(reply: &[u8]) -> Result<(u8, &[u8])> {
    match reply.split_first() {
        Some((&op::FAILURE, _)) => Err(ShimError::UpstreamFailure),
        Some((&msg, body)) => Ok((msg, body)),
        None => Err(ShimError::Malformed("empty reply".to_string())),
    }
}

/// Decode an `IDENTITIES_ANSWER` from the upstream agent.
pub fn parse_identities(reply: &[u8]) -> Result<Vec<Identity>> {
    let (msg, mut body) = reply_type(reply)?;
    if msg != op::IDENTITIES_ANSWER {
        return Err(ShimError::UnexpectedReply(msg));
    }
    let count = u32::decode(&mut body)?;
    let mut identities = Vec::new();
    for _ in 0..count {
        let key_blob = Vec::<u8>::decode(&mut body)?;
        let comment = String::decode(&mut body)?;
        identities.push(Identity { key_blob, comment });
    }
    Ok(identities)
}

/// Decode a `SIGN_RESPONSE` from the upstream agent.
pub fn parse_signature(reply: &[u8]) -> Result<Signature> {
    let (msg, mut body) = reply_type(reply)?;
    if msg != op::SIGN_RESPONSE {
        return Err(ShimError::UnexpectedReply(msg));
    }
    let blob = Vec::<u8>::decode(&mut body)?;
    Ok(Signature::decode(&mut blob.as_slice())?)
}

/// Check for `SUCCESS`.
pub fn expect_success(reply: &[u8]) -> Result<()> {
    match reply_type(reply)? {
        (op::SUCCESS, _) => Ok(()),
        (msg, _) => Err(ShimError::UnexpectedReply(msg)),
    }
}

/// Serialize any SSH-encodable value to its wire bytes.
pub fn encode_blob(value: &impl Encode) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(value.encoded_len()?);
    value.encode(&mut buf)?;
    Ok(buf)
}

/// Decode a blob as an OpenSSH certificate, requiring the whole blob to be
/// consumed.
pub fn parse_certificate(blob: &[u8]) -> Option<Certificate> {
    let mut reader = blob;
    let cert = Certificate::decode(&mut reader).ok()?;
    reader.is_finished().then_some(cert)
}

/// Whether `blob` is a complete public key or certificate encoding.
pub fn is_public_key_blob(blob: &[u8]) -> bool {
    if parse_certificate(blob).is_some() {
        return true;
    }
    let mut reader = blob;
    KeyData::decode(&mut reader).is_ok() && reader.is_finished()
}

/// Wire blob of a certificate's base (certified) public key.
pub fn base_key_blob(cert: &Certificate) -> Result<Vec<u8>> {
    encode_blob(cert.public_key())
}

/// Decode the body of an `ADD_HARD_CERT` request into `(key_blob, comment)`.
///
/// Older clients send a bare public key blob; newer ones send
/// `string key_blob, string comment`.  The bare form is tried first.
pub fn decode_hard_cert(body: &[u8]) -> Result<(Vec<u8>, String)> {
    if is_public_key_blob(body) {
        return Ok((body.to_vec(), String::new()));
    }
    let mut reader = body;
    let key_blob = Vec::<u8>::decode(&mut reader)?;
    let comment = String::decode(&mut reader)?;
    Ok((key_blob, comment))
}

/// Encode a `ADD_HARD_CERT` request body in the structured form.
pub fn encode_hard_cert(key_blob: &[u8], comment: &str) -> Result<Vec<u8>> {
    let mut buf = vec![op::ADD_HARD_CERT];
    key_blob.encode(&mut buf)?;
    comment.encode(&mut buf)?;
    Ok(buf)
}

/// Decode the slot id carried by `READ_SLOT` / `ATTEST_SLOT`.
pub fn decode_slot_id(body: &[u8]) -> Result<String> {
    let mut reader = body;
    Ok(String::decode(&mut reader)?)
}

/// `LIST_SLOTS` reply: `string slots (comma-separated name-list), string err`.
pub fn encode_slot_list(slots: &[String], err: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    slots.join(",").encode(&mut buf)?;
    err.encode(&mut buf)?;
    Ok(buf)
}

/// `READ_SLOT` / `ATTEST_SLOT` reply: `string cert (PEM), string err`.
pub fn encode_slot_cert(pem: &[u8], err: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    pem.encode(&mut buf)?;
    err.encode(&mut buf)?;
    Ok(buf)
}

fn malformed(err: impl std::fmt::Display) -> ShimError {
    ShimError::Malformed(err.to_string())
}

/// Smartcard request details that are safe to log.  The PIN is discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartcardRequest {
    pub id: String,
    pub lifetime: Option<u32>,
    pub confirm: bool,
}

/// Decode `ADD_SMARTCARD_KEY`, `REMOVE_SMARTCARD_KEY` and
/// `ADD_SMARTCARD_KEY_CONSTRAINED`.  Other messages yield `None`.
pub fn decode_smartcard(payload: &[u8]) -> Option<Result<SmartcardRequest>> {
    let (&msg, mut body) = payload.split_first()?;
    let decoded = match msg {
        op::ADD_SMARTCARD_KEY | op::REMOVE_SMARTCARD_KEY => {
            SmartcardKey::decode(&mut body).map_err(malformed).map(|mut key| {
                key.pin.zeroize();
                SmartcardRequest { id: key.id, lifetime: None, confirm: false }
            })
        }
        op::ADD_SMARTCARD_KEY_CONSTRAINED => AddSmartcardKeyConstrained::decode(&mut body)
            .map_err(malformed)
            .map(|mut req| {
                req.key.pin.zeroize();
                let mut out = SmartcardRequest {
                    id: req.key.id,
                    lifetime: None,
                    confirm: false,
                };
                for constraint in req.constraints {
                    match constraint {
                        KeyConstraint::Lifetime(secs) => out.lifetime = Some(secs),
                        KeyConstraint::Confirm => out.confirm = true,
                        _ => {}
                    }
                }
                out
            }),
        _ => return None,
    };
    Some(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{key_id_json, new_key, Certs, FAR_FUTURE};

    #[test]
    fn sign_request_roundtrip() {
        let req = Request::Sign(SignRequest {
            key_blob: vec![1, 2, 3],
            data: b"session".to_vec(),
            flags: 4,
        });
        let bytes = req.encode().unwrap();
        assert_eq!(bytes[0], op::SIGN_REQUEST);
        match Request::decode(&bytes).unwrap() {
            Some(Request::Sign(decoded)) => {
                assert_eq!(decoded.key_blob, vec![1, 2, 3]);
                assert_eq!(decoded.data, b"session");
                assert_eq!(decoded.flags, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unhandled_messages_decode_to_none() {
        assert!(Request::decode(&[op::ADD_SMARTCARD_KEY]).unwrap().is_none());
        assert!(Request::decode(&[27, 0, 0, 0, 0]).unwrap().is_none());
        assert!(Request::decode(&[]).is_err());
    }

    #[test]
    fn identities_answer_roundtrip() {
        let ids = vec![
            Identity { key_blob: vec![9; 10], comment: "a".to_string() },
            Identity { key_blob: vec![8; 3], comment: String::new() },
        ];
        let bytes = Response::Identities(ids.clone()).encode().unwrap();
        assert_eq!(parse_identities(&bytes).unwrap(), ids);
        assert!(matches!(parse_identities(&[op::FAILURE]), Err(ShimError::UpstreamFailure)));
        assert!(matches!(parse_identities(&[op::SUCCESS]), Err(ShimError::UnexpectedReply(6))));
    }

    #[test]
    fn certificate_detection() {
        let certs = Certs::new();
        let base = new_key();
        let cert = certs.issue(&base, &key_id_json("abc"), 0, FAR_FUTURE);
        let cert_blob = encode_blob(&cert).unwrap();
        let key_blob = encode_blob(base.public_key().key_data()).unwrap();

        assert!(parse_certificate(&cert_blob).is_some());
        assert!(parse_certificate(&key_blob).is_none());
        assert!(is_public_key_blob(&cert_blob));
        assert!(is_public_key_blob(&key_blob));
        assert!(!is_public_key_blob(b"garbage"));
        assert_eq!(base_key_blob(&cert).unwrap(), key_blob);
    }

    #[test]
    fn hard_cert_accepts_bare_and_structured_bodies() {
        let certs = Certs::new();
        let cert = certs.issue(&new_key(), &key_id_json("abc"), 0, FAR_FUTURE);
        let blob = encode_blob(&cert).unwrap();

        assert_eq!(decode_hard_cert(&blob).unwrap(), (blob.clone(), String::new()));

        let structured = encode_hard_cert(&blob, "9a").unwrap();
        assert_eq!(
            decode_hard_cert(&structured[1..]).unwrap(),
            (blob, "9a".to_string())
        );
        assert!(decode_hard_cert(&[0, 0]).is_err());
    }

    #[test]
    fn added_certificate_is_extracted() {
        let mut msg = vec![op::ADD_IDENTITY];
        "ssh-ed25519-cert-v01@openssh.com".encode(&mut msg).unwrap();
        [7u8; 5].as_slice().encode(&mut msg).unwrap();
        msg.extend_from_slice(&[0, 0, 0, 1, 0xaa]);
        let added = AddedKey::decode(&msg).unwrap();
        assert_eq!(added.certificate, Some(vec![7u8; 5]));
        assert_eq!(added.message.as_slice(), msg.as_slice());

        let mut plain = vec![op::ADD_IDENTITY];
        "ssh-ed25519".encode(&mut plain).unwrap();
        assert!(AddedKey::decode(&plain).unwrap().certificate.is_none());
    }

    #[test]
    fn smartcard_requests_drop_the_pin() {
        let mut msg = vec![op::ADD_SMARTCARD_KEY_CONSTRAINED];
        "/usr/lib/opensc-pkcs11.so".encode(&mut msg).unwrap();
        "123456".encode(&mut msg).unwrap();
        msg.push(op::CONSTRAIN_LIFETIME);
        600u32.encode(&mut msg).unwrap();
        msg.push(op::CONSTRAIN_CONFIRM);

        let decoded = decode_smartcard(&msg).unwrap().unwrap();
        assert_eq!(
            decoded,
            SmartcardRequest {
                id: "/usr/lib/opensc-pkcs11.so".to_string(),
                lifetime: Some(600),
                confirm: true,
            }
        );
        assert!(decode_smartcard(&[op::REQUEST_IDENTITIES]).is_none());
    }

    #[test]
    fn slot_replies() {
        let list = encode_slot_list(&["9a".to_string(), "9c".to_string()], "").unwrap();
        let mut reader = list.as_slice();
        assert_eq!(String::decode(&mut reader).unwrap(), "9a,9c");
        assert_eq!(String::decode(&mut reader).unwrap(), "");

        let cert = encode_slot_cert(b"", "no such slot").unwrap();
        let mut reader = cert.as_slice();
        assert!(Vec::<u8>::decode(&mut reader).unwrap().is_empty());
        assert_eq!(String::decode(&mut reader).unwrap(), "no such slot");
    }
}
