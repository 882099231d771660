//! Value objects shared by the sshim agent and daemon.
//!
//! - [`keyid`]: the JSON identity embedded in vendor certificates.
//! - [`certkind`]: certificate classification and display labels.
//! - [`config`]: the TOML configuration file.

pub mod certkind;
pub mod config;
pub mod keyid;

pub use certkind::{CertKind, LabelError, classify, compose_label, label};
pub use keyid::{KeyId, KeyIdError, TouchPolicy, Usage};
