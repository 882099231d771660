//! Error type for the shim agent.

use sshim_core::{KeyIdError, LabelError};

#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("agent locked")]
    Locked,

    #[error("agent already locked")]
    AlreadyLocked,

    #[error("agent not locked")]
    NotLocked,

    #[error("null key")]
    NullKey,

    #[error("key is not a certificate")]
    NotACert,

    #[error("base public key not found in upstream agent")]
    BaseKeyMissing,

    #[error("key not found")]
    NotFound,

    /// The upstream agent answered `SSH_AGENT_FAILURE`.
    #[error("upstream agent refused the request")]
    UpstreamFailure,

    #[error("upstream agent connection closed")]
    UpstreamClosed,

    #[error("unexpected reply from upstream agent (message type {0})")]
    UnexpectedReply(u8),

    /// Per-entry failures collected by the filter pass.
    #[error("{}", join_errors(.0))]
    Filter(Vec<ShimError>),

    #[error(transparent)]
    KeyId(#[from] KeyIdError),

    #[error(transparent)]
    Label(#[from] LabelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH encoding error: {0}")]
    Encoding(#[from] ssh_encoding::Error),

    #[error("SSH key error: {0}")]
    SshKey(#[from] ssh_key::Error),
}

fn join_errors(errors: &[ShimError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T, E = ShimError> = std::result::Result<T, E>;
