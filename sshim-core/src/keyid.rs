//! Vendor identity embedded in the key id of issued SSH certificates.
//!
//! The certificate signing service stores a JSON object in the certificate's
//! key id field.  [`KeyId::parse`] turns that string back into a typed value
//! and [`KeyId::render`] produces the canonical encoding.  Both directions
//! enforce the same sanity rules, so a `KeyId` that renders will always parse.
//!
//! ```text
//! {"prins":["alice"],"transID":"1a2b","reqUser":"alice","reqIP":"10.0.0.1",
//!  "reqHost":"laptop","isFirefighter":false,"isHWKey":true,"isHeadless":false,
//!  "isNonce":false,"usage":0,"touchPolicy":2,"ver":1}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current (and only) KeyID schema version.
pub const VERSION_1: u64 = 1;

/// Keys that must literally appear in a version 1 KeyID object.
const V1_REQUIRED_KEYS: &[&str] = &[
    "prins",
    "transID",
    "reqUser",
    "reqIP",
    "reqHost",
    "isFirefighter",
    "isHWKey",
    "isHeadless",
    "isNonce",
    "usage",
    "touchPolicy",
    "ver",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyIdError {
    #[error("malformed key id: {0}")]
    Malformed(String),
    #[error("unsupported key id version {0}")]
    UnsupportedVersion(u64),
    #[error("key id invariant violated: {0}")]
    InvariantViolation(&'static str),
}

fn required_keys(version: u64) -> Option<&'static [&'static str]> {
    match version {
        VERSION_1 => Some(V1_REQUIRED_KEYS),
        _ => None,
    }
}

/// What the certificate may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Usage {
    #[default]
    All,
    SshOnly,
}

impl TryFrom<u8> for Usage {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::All),
            1 => Ok(Self::SshOnly),
            other => Err(format!("unknown usage {other}")),
        }
    }
}

impl From<Usage> for u8 {
    fn from(value: Usage) -> Self {
        match value {
            Usage::All => 0,
            Usage::SshOnly => 1,
        }
    }
}

/// Touch requirement the hardware enforces for the certified key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TouchPolicy {
    #[default]
    Default,
    Never,
    Always,
    Cached,
}

impl TryFrom<u8> for TouchPolicy {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Default),
            1 => Ok(Self::Never),
            2 => Ok(Self::Always),
            3 => Ok(Self::Cached),
            other => Err(format!("unknown touch policy {other}")),
        }
    }
}

impl From<TouchPolicy> for u8 {
    fn from(value: TouchPolicy) -> Self {
        match value {
            TouchPolicy::Default => 0,
            TouchPolicy::Never => 1,
            TouchPolicy::Always => 2,
            TouchPolicy::Cached => 3,
        }
    }
}

/// Typed view of the vendor KeyID.
///
/// Field declaration order is the rendering order; changing it changes the
/// bytes of every rendered key id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyId {
    #[serde(rename = "prins")]
    pub principals: Vec<String>,
    #[serde(rename = "transID")]
    pub trans_id: String,
    #[serde(rename = "reqUser")]
    pub req_user: String,
    #[serde(rename = "reqIP")]
    pub req_ip: String,
    #[serde(rename = "reqHost")]
    pub req_host: String,
    #[serde(rename = "isFirefighter")]
    pub is_firefighter: bool,
    #[serde(rename = "isHWKey")]
    pub is_hw_key: bool,
    #[serde(rename = "isHeadless")]
    pub is_headless: bool,
    #[serde(rename = "isNonce")]
    pub is_nonce: bool,
    pub usage: Usage,
    #[serde(rename = "touchPolicy")]
    pub touch_policy: TouchPolicy,
    #[serde(rename = "ver")]
    pub version: u64,
}

impl Default for KeyId {
    fn default() -> Self {
        Self {
            principals: Vec::new(),
            trans_id: String::new(),
            req_user: String::new(),
            req_ip: String::new(),
            req_host: String::new(),
            is_firefighter: false,
            is_hw_key: false,
            is_headless: false,
            is_nonce: false,
            usage: Usage::All,
            touch_policy: TouchPolicy::Default,
            version: VERSION_1,
        }
    }
}

impl KeyId {
    /// Parse a key id string.
    ///
    /// Fails unless the string is a JSON object of a known version carrying
    /// every required key, and the decoded value passes [`validate`](Self::validate).
    pub fn parse(s: &str) -> Result<Self, KeyIdError> {
        let object: Map<String, Value> =
            serde_json::from_str(s).map_err(|e| KeyIdError::Malformed(e.to_string()))?;

        let version = object
            .get("ver")
            .and_then(Value::as_u64)
            .ok_or_else(|| KeyIdError::Malformed("missing or non-integer \"ver\"".to_string()))?;
        let required = required_keys(version).ok_or(KeyIdError::UnsupportedVersion(version))?;

        if let Some(missing) = required.iter().find(|k| !object.contains_key(**k)) {
            return Err(KeyIdError::Malformed(format!("missing required key {missing:?}")));
        }

        let kid: KeyId = serde_json::from_value(Value::Object(object))
            .map_err(|e| KeyIdError::Malformed(e.to_string()))?;
        kid.validate()?;
        Ok(kid)
    }

    /// Render the canonical JSON encoding after checking invariants.
    pub fn render(&self) -> Result<String, KeyIdError> {
        self.validate()?;
        serde_json::to_string(self).map_err(|e| KeyIdError::Malformed(e.to_string()))
    }

    /// Per-version sanity checks shared by parse and render.
    pub fn validate(&self) -> Result<(), KeyIdError> {
        if required_keys(self.version).is_none() {
            return Err(KeyIdError::UnsupportedVersion(self.version));
        }
        if self.is_headless
            && (self.is_hw_key || self.is_firefighter || self.touch_policy != TouchPolicy::Never)
        {
            return Err(KeyIdError::InvariantViolation(
                "headless key id must be software-backed, non-firefighter, touch policy never",
            ));
        }
        if self.is_nonce
            && (self.is_firefighter || self.is_headless || self.touch_policy != TouchPolicy::Never)
        {
            return Err(KeyIdError::InvariantViolation(
                "nonce key id must be non-firefighter, non-headless, touch policy never",
            ));
        }
        Ok(())
    }

    /// Look up a field by its external name.
    ///
    /// Unknown names yield an empty string rather than an error; callers on
    /// the other side of a process boundary only know field names.
    pub fn get_property(&self, name: &str) -> String {
        match name {
            "touchPolicy" => u8::from(self.touch_policy).to_string(),
            "prins" => self.principals.join(","),
            "headless" => self.is_headless.to_string(),
            _ => String::new(),
        }
    }
}
