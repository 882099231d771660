use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Endpoint of the upstream agent: a Unix socket path, or a named pipe
    /// on Windows.  Falls back to `$SSH_AUTH_SOCK` when unset.
    #[serde(default)]
    pub address: Option<String>,

    /// Socket the shim listens on.  Falls back to
    /// `$XDG_RUNTIME_DIR/sshim/agent.sock` when unset.
    #[serde(default)]
    pub listen: Option<PathBuf>,

    /// Hide vendor certificates that live in the upstream agent from
    /// listings and refuse to sign with them.
    #[serde(default)]
    pub suppress_upstream: bool,
}

impl AgentConfig {
    /// Resolve the upstream address, consulting `SSH_AUTH_SOCK` if the
    /// config leaves it unset.
    pub fn upstream_address(&self) -> Option<String> {
        self.address
            .clone()
            .filter(|a| !a.is_empty())
            .or_else(|| std::env::var("SSH_AUTH_SOCK").ok().filter(|a| !a.is_empty()))
    }

    /// Resolve the listen path, defaulting under `XDG_RUNTIME_DIR`.
    pub fn listen_path(&self) -> Option<PathBuf> {
        self.listen.clone().or_else(|| {
            std::env::var_os("XDG_RUNTIME_DIR")
                .map(PathBuf::from)
                .map(|dir| dir.join("sshim").join("agent.sock"))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}
