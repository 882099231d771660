//! Classification and labelling of vendor-issued SSH certificates.
//!
//! A certificate's kind is a pure function of its embedded [`KeyId`] and the
//! `touchless-sudo-hosts` critical option.  The kind drives the human label
//! the agent shows in `ssh-add -l` output, e.g. `TouchSudoSSH-c0ffee-9a`.

use ssh_key::Certificate;

use crate::keyid::{KeyId, TouchPolicy};

/// Critical option whose non-empty value promotes a touchless cert to its
/// sudo-capable variant.
pub const TOUCHLESS_SUDO_HOSTS: &str = "touchless-sudo-hosts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertKind {
    Unknown,
    TouchSudo,
    Touchless,
    TouchlessSudo,
    Firefighter,
    Nonce,
    TouchlessInAgent,
    TouchlessSudoInAgent,
}

impl CertKind {
    /// Short label prefix for the kind.  Empty for [`CertKind::Unknown`].
    pub fn tag(self) -> &'static str {
        match self {
            Self::Unknown => "",
            Self::TouchSudo => "TouchSudo",
            Self::Touchless => "Touchless",
            Self::TouchlessSudo => "TouchlessSudo",
            Self::Firefighter => "FireFighterSudo",
            Self::Nonce => "Nonce",
            Self::TouchlessInAgent => "TouchlessInAgent",
            Self::TouchlessSudoInAgent => "TouchlessSudoInAgent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    #[error("invalid certificate type")]
    InvalidType,
}

/// Classify from already-decoded inputs.  First matching rule wins.
pub fn classify_key_id(kid: &KeyId, has_sudo_hosts: bool) -> CertKind {
    if kid.is_nonce {
        return CertKind::Nonce;
    }
    if kid.is_firefighter {
        return match (kid.is_hw_key, has_sudo_hosts) {
            (true, _) => CertKind::Firefighter,
            (false, true) => CertKind::TouchlessSudoInAgent,
            (false, false) => CertKind::TouchlessInAgent,
        };
    }
    match kid.touch_policy {
        TouchPolicy::Cached | TouchPolicy::Always => CertKind::TouchSudo,
        TouchPolicy::Never if has_sudo_hosts => CertKind::TouchlessSudo,
        TouchPolicy::Never => CertKind::Touchless,
        TouchPolicy::Default => CertKind::Unknown,
    }
}

fn has_sudo_hosts(cert: &Certificate) -> bool {
    cert.critical_options()
        .get(TOUCHLESS_SUDO_HOSTS)
        .is_some_and(|hosts| !hosts.is_empty())
}

/// Classify a certificate.  Absent certificates and certificates whose key id
/// is not a vendor KeyID are [`CertKind::Unknown`].
pub fn classify(cert: Option<&Certificate>) -> CertKind {
    let Some(cert) = cert else {
        return CertKind::Unknown;
    };
    match KeyId::parse(cert.key_id()) {
        Ok(kid) => classify_key_id(&kid, has_sudo_hosts(cert)),
        Err(_) => CertKind::Unknown,
    }
}

/// `<tag>SSH-<transID>` for a classifiable vendor certificate.
pub fn label(cert: &Certificate) -> Result<String, LabelError> {
    let kid = KeyId::parse(cert.key_id()).map_err(|_| LabelError::InvalidType)?;
    match classify_key_id(&kid, has_sudo_hosts(cert)) {
        CertKind::Unknown => Err(LabelError::InvalidType),
        kind => Ok(format!("{}SSH-{}", kind.tag(), kid.trans_id)),
    }
}

/// Join two label parts with `-`, dropping empty parts.
pub fn compose_label(primary: &str, secondary: &str) -> String {
    match (primary.is_empty(), secondary.is_empty()) {
        (false, false) => format!("{primary}-{secondary}"),
        (false, true) => primary.to_string(),
        (true, _) => secondary.to_string(),
    }
}
