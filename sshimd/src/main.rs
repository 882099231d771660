mod bootstrap;

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use sshim_core::config::Config;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
#[tokio::main]
async fn main() -> Result<()> {
    use std::sync::Arc;

    use sshim_agent::{ServerOptions, ShimAgent, ShimServer};

    let config_path = parse_config_path(std::env::args().skip(1));
    let config = read_config(&config_path)?;
    init_logging(config.as_ref().map(|c| c.log.filter.as_str()));

    // Before the upstream connection is opened or any passphrase is read.
    bootstrap::secure_bootstrap();

    let config = match config {
        Some(config) => {
            check_config_permissions(&config_path);
            tracing::info!("loaded config from {}", config_path.display());
            config
        }
        None => {
            tracing::warn!(
                "config file not found at {}, using defaults",
                config_path.display()
            );
            Config::default()
        }
    };

    let address = config
        .agent
        .upstream_address()
        .context("no upstream agent: set agent.address or SSH_AUTH_SOCK")?;
    let socket_path = config
        .agent
        .listen_path()
        .context("no listen socket: set agent.listen or XDG_RUNTIME_DIR")?;
    if Path::new(&address) == socket_path {
        anyhow::bail!(
            "listen socket {} is the upstream agent itself",
            socket_path.display()
        );
    }
    prepare_socket_dir(&socket_path)?;
    remove_stale_socket(&socket_path)?;

    let upstream = sshim_agent::upstream::connect(&address)
        .await
        .with_context(|| format!("connect to upstream agent at {address}"))?;
    let options = ServerOptions::new(config.agent.suppress_upstream);
    let server = Arc::new(
        ShimServer::new(upstream, options)
            .await
            .context("initialise shim server")?,
    );

    let agent = ShimAgent::new(Arc::clone(&server), socket_path.clone());
    let listener = tokio::spawn(async move {
        if let Err(e) = agent.listen().await {
            tracing::error!("agent listener exited: {e:#}");
        }
    });

    tracing::info!(
        upstream = %address,
        socket = %socket_path.display(),
        suppress_upstream = config.agent.suppress_upstream,
        "sshimd ready"
    );

    shutdown_signal().await;
    tracing::info!("received shutdown signal, exiting");

    listener.abort();
    if let Err(e) = server.close().await {
        tracing::warn!("closing upstream connection failed: {e}");
    }
    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::debug!("removing {}: {e}", socket_path.display());
    }
    Ok(())
}

#[cfg(not(unix))]
fn main() -> Result<()> {
    anyhow::bail!("sshimd serves a Unix socket and only runs on Unix platforms")
}

fn init_logging(configured: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(unix)]
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("failed to register SIGTERM handler: {e}, falling back to SIGINT only");
            ctrl_c.await.ok();
        }
    }
}

fn parse_config_path(mut args: impl Iterator<Item = String>) -> PathBuf {
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
            eprintln!("error: --config requires a path argument");
            std::process::exit(1);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return PathBuf::from(path);
        }
        if arg == "--help" || arg == "-h" {
            eprintln!("Usage: sshimd [--config <path>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  -c, --config <path>  Path to config file (default: $XDG_CONFIG_HOME/sshim/config.toml)");
            eprintln!("  -h, --help           Show this help message");
            std::process::exit(0);
        }
    }
    default_config_path()
}

fn default_config_path() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sshim")
        .join("config.toml")
}

/// Parse the config file.  `Ok(None)` when it does not exist.
fn read_config(path: &Path) -> Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("parse config file {}", path.display()))?;
    Ok(Some(config))
}

fn check_config_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        match std::fs::metadata(path) {
            Ok(meta) => {
                let mode = meta.mode();
                if mode & 0o077 != 0 {
                    tracing::warn!(
                        path = %path.display(),
                        mode = format!("{:o}", mode & 0o777),
                        "config file is readable by group or others, recommend: chmod 600 {}",
                        path.display()
                    );
                }
            }
            Err(e) => {
                tracing::warn!("could not check config file permissions: {e}");
            }
        }
    }
}

/// Create the socket's directory, private to the user.
#[cfg(unix)]
fn prepare_socket_dir(socket_path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    let Some(dir) = socket_path.parent() else {
        return Ok(());
    };
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create socket directory {}", dir.display()))?;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("chmod 0700 {}", dir.display()))?;
    }
    Ok(())
}

/// Remove a socket left behind by a previous run.  Refuses when something
/// is still accepting connections on it.
#[cfg(unix)]
fn remove_stale_socket(socket_path: &Path) -> Result<()> {
    use std::os::unix::fs::FileTypeExt as _;

    let meta = match std::fs::symlink_metadata(socket_path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("stat {}", socket_path.display()));
        }
    };
    if !meta.file_type().is_socket() {
        anyhow::bail!("{} exists and is not a socket", socket_path.display());
    }
    if std::os::unix::net::UnixStream::connect(socket_path).is_ok() {
        anyhow::bail!("another agent is already listening on {}", socket_path.display());
    }
    std::fs::remove_file(socket_path)
        .with_context(|| format!("remove stale socket {}", socket_path.display()))?;
    tracing::debug!(path = %socket_path.display(), "removed stale socket");
    Ok(())
}
