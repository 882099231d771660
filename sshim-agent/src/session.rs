//! Client-facing socket listener.

use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::UnixListener;
use tracing::{debug, info};

use crate::dispatch::Dispatcher;
use crate::server::ShimServer;
use crate::slots::SlotProvider;

/// The shim agent as seen by SSH clients: a Unix socket whose connections
/// are each served by a [`Dispatcher`] task.
#[derive(Clone, Debug)]
pub struct ShimAgent {
    dispatcher: Dispatcher,
    socket_path: PathBuf,
}

impl ShimAgent {
    pub fn new(server: Arc<ShimServer>, socket_path: PathBuf) -> Self {
        Self {
            dispatcher: Dispatcher::new(server),
            socket_path,
        }
    }

    pub fn with_slots(mut self, slots: Arc<dyn SlotProvider>) -> Self {
        self.dispatcher = self.dispatcher.with_slots(slots);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the Unix socket and serve connections until an accept fails.
    pub async fn listen(self) -> anyhow::Result<()> {
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("bind agent socket {:?}", self.socket_path))?;

        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod 0600 {:?}", self.socket_path))?;

        info!(path = %self.socket_path.display(), "agent listening");

        loop {
            let (stream, _) = listener.accept().await.context("accept agent connection")?;
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.serve(stream).await {
                    debug!(error = %e, "agent connection ended with error");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::proto::{self, op};
    use crate::server::ServerOptions;
    use crate::testing::{MockUpstream, new_key};
    use crate::wire;

    #[tokio::test]
    async fn listen_serves_clients_on_private_socket() {
        let dir = std::env::temp_dir().join(format!("sshim-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let socket = dir.join("agent.sock");
        let _ = std::fs::remove_file(&socket);

        let upstream = MockUpstream::default();
        upstream.add_key(new_key(), "yubikey");
        let server = ShimServer::new(Box::new(upstream), ServerOptions::default())
            .await
            .unwrap();
        let agent = ShimAgent::new(Arc::new(server), socket.clone());
        let listener = tokio::spawn(agent.listen());

        let mut stream = None;
        for _ in 0..50 {
            if let Ok(s) = tokio::net::UnixStream::connect(&socket).await {
                stream = Some(s);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mut stream = stream.expect("listener did not come up");

        wire::write_frame(&mut stream, &[op::REQUEST_IDENTITIES]).await.unwrap();
        let reply = wire::read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(proto::parse_identities(&reply).unwrap().len(), 1);

        let mode = std::fs::metadata(&socket).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        listener.abort();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
