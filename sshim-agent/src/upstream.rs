//! Client side of the connection to the upstream (key-holding) agent.
//!
//! [`UpstreamAgent`] is the seam between the shim server and whatever agent
//! actually holds private keys.  Every typed operation has a default
//! implementation layered on [`UpstreamAgent::forward`], so a transport only
//! needs to move frames; tests substitute an in-memory agent.

use std::sync::Arc;

use async_trait::async_trait;
use ssh_key::Signature;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tokio::sync::watch;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Result, ShimError};
use crate::proto::{self, AddedKey, Identity, Request, SignRequest};
use crate::wire;

/// Operations the shim needs from the upstream agent.
///
/// Calls are serialized by the server lock; implementations never see two
/// requests in flight.
#[async_trait]
pub trait UpstreamAgent: Send {
    /// Send one raw request payload and return the raw reply payload.
    async fn forward(&mut self, request: &[u8]) -> Result<Vec<u8>>;

    /// Close the connection.  Later calls fail.
    async fn close(&mut self) -> Result<()>;

    /// Handle that aborts the request in flight without waiting for it.
    /// `None` when the transport cannot be interrupted.
    fn close_handle(&self) -> Option<CloseHandle> {
        None
    }

    async fn list(&mut self) -> Result<Vec<Identity>> {
        let reply = self.forward(&Request::RequestIdentities.encode()?).await?;
        proto::parse_identities(&reply)
    }

    async fn sign(&mut self, key_blob: &[u8], data: &[u8], flags: u32) -> Result<Signature> {
        let request = Request::Sign(SignRequest {
            key_blob: key_blob.to_vec(),
            data: data.to_vec(),
            flags,
        });
        let reply = self.forward(&request.encode()?).await?;
        proto::parse_signature(&reply)
    }

    async fn add(&mut self, key: &AddedKey) -> Result<()> {
        let reply = self.forward(&key.message).await?;
        proto::expect_success(&reply)
    }

    async fn remove(&mut self, key_blob: &[u8]) -> Result<()> {
        let reply = self
            .forward(&Request::Remove(key_blob.to_vec()).encode()?)
            .await?;
        proto::expect_success(&reply)
    }

    async fn remove_all(&mut self) -> Result<()> {
        let reply = self.forward(&Request::RemoveAll.encode()?).await?;
        proto::expect_success(&reply)
    }

    async fn lock(&mut self, passphrase: &str) -> Result<()> {
        let request = Zeroizing::new(
            Request::Lock(Zeroizing::new(passphrase.to_string())).encode()?,
        );
        let reply = self.forward(&request).await?;
        proto::expect_success(&reply)
    }

    async fn unlock(&mut self, passphrase: &str) -> Result<()> {
        let request = Zeroizing::new(
            Request::Unlock(Zeroizing::new(passphrase.to_string())).encode()?,
        );
        let reply = self.forward(&request).await?;
        proto::expect_success(&reply)
    }
}

/// Shuts an upstream connection from outside the server lock.
///
/// Once closed, the request in flight fails with
/// [`ShimError::UpstreamClosed`] and so does every later one.
#[derive(Clone, Debug)]
pub struct CloseHandle(Arc<watch::Sender<bool>>);

impl CloseHandle {
    pub fn close(&self) {
        self.0.send_replace(true);
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        let done = *closed.borrow_and_update();
        if done {
            return;
        }
        if closed.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn exchange<S>(stream: &mut S, request: &[u8]) -> Result<Option<Vec<u8>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    wire::write_frame(stream, request).await?;
    wire::read_frame(stream).await
}

/// Upstream agent reached over a framed byte stream.
pub struct StreamUpstream<S> {
    stream: Option<S>,
    closed: Arc<watch::Sender<bool>>,
}

impl<S> StreamUpstream<S> {
    pub fn new(stream: S) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            stream: Some(stream),
            closed: Arc::new(closed),
        }
    }
}

impl<S> std::fmt::Debug for StreamUpstream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamUpstream")
            .field("open", &self.stream.is_some())
            .finish()
    }
}

#[async_trait]
impl<S> UpstreamAgent for StreamUpstream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn forward(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            self.stream = None;
        }
        let stream = self.stream.as_mut().ok_or(ShimError::UpstreamClosed)?;
        let outcome = tokio::select! {
            reply = exchange(stream, request) => Some(reply),
            () = wait_closed(&mut closed) => None,
        };
        match outcome {
            Some(Ok(Some(reply))) => Ok(reply),
            Some(Err(e)) => Err(e),
            Some(Ok(None)) => {
                self.stream = None;
                Err(ShimError::UpstreamClosed)
            }
            None => {
                // A half-written or half-read frame leaves the stream unusable.
                self.stream = None;
                debug!("upstream request aborted by close");
                Err(ShimError::UpstreamClosed)
            }
        }
    }

    fn close_handle(&self) -> Option<CloseHandle> {
        Some(CloseHandle(Arc::clone(&self.closed)))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.send_replace(true);
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
            debug!("upstream connection closed");
        }
        Ok(())
    }
}

/// Connect to the upstream agent's Unix socket.
#[cfg(unix)]
pub async fn connect(address: &str) -> Result<Box<dyn UpstreamAgent>> {
    let stream = tokio::net::UnixStream::connect(address).await?;
    debug!(address, "connected to upstream agent");
    Ok(Box::new(StreamUpstream::new(stream)))
}

/// Connect to the upstream agent's named pipe.
#[cfg(windows)]
pub async fn connect(address: &str) -> Result<Box<dyn UpstreamAgent>> {
    let pipe = tokio::net::windows::named_pipe::ClientOptions::new().open(address)?;
    debug!(address, "connected to upstream agent");
    Ok(Box::new(StreamUpstream::new(pipe)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{op, Response};

    /// Plays the upstream side of a duplex pipe: answers each request with
    /// the next canned reply and records what it received.
    async fn scripted_peer(
        mut stream: tokio::io::DuplexStream,
        replies: Vec<Vec<u8>>,
    ) -> Vec<Vec<u8>> {
        let mut seen = Vec::new();
        for reply in replies {
            let Some(request) = wire::read_frame(&mut stream).await.unwrap() else {
                break;
            };
            seen.push(request);
            wire::write_frame(&mut stream, &reply).await.unwrap();
        }
        seen
    }

    #[tokio::test]
    async fn typed_calls_go_over_frames() {
        let (client, server) = tokio::io::duplex(4096);
        let identities = vec![Identity {
            key_blob: vec![1, 2, 3],
            comment: "upstream".to_string(),
        }];
        let replies = vec![
            Response::Identities(identities.clone()).encode().unwrap(),
            vec![op::SUCCESS],
            vec![op::FAILURE],
        ];
        let peer = tokio::spawn(scripted_peer(server, replies));

        let mut upstream = StreamUpstream::new(client);
        assert_eq!(upstream.list().await.unwrap(), identities);
        upstream.lock("hunter2").await.unwrap();
        assert!(matches!(
            upstream.remove(&[1, 2, 3]).await,
            Err(ShimError::UpstreamFailure)
        ));

        let seen = peer.await.unwrap();
        assert_eq!(seen[0], vec![op::REQUEST_IDENTITIES]);
        assert_eq!(seen[1][0], op::LOCK);
        assert_eq!(seen[2][0], op::REMOVE_IDENTITY);
    }

    #[tokio::test]
    async fn closed_upstream_refuses_requests() {
        let (client, _server) = tokio::io::duplex(64);
        let mut upstream = StreamUpstream::new(client);
        upstream.close().await.unwrap();
        assert!(matches!(
            upstream.forward(&[op::REQUEST_IDENTITIES]).await,
            Err(ShimError::UpstreamClosed)
        ));
    }

    #[tokio::test]
    async fn close_handle_aborts_request_in_flight() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (got_request, request_seen) = tokio::sync::oneshot::channel();
        let _peer = tokio::spawn(async move {
            let request = wire::read_frame(&mut server).await.unwrap();
            got_request.send(request).unwrap();
            // Never answer; keep the pipe open.
            std::future::pending::<()>().await;
        });

        let mut upstream = StreamUpstream::new(client);
        let handle = upstream.close_handle().unwrap();
        let in_flight = tokio::spawn(async move {
            let result = upstream.list().await;
            (upstream, result)
        });
        request_seen.await.unwrap();
        handle.close();

        let (mut upstream, result) =
            tokio::time::timeout(std::time::Duration::from_secs(2), in_flight)
                .await
                .expect("request still blocked after close")
                .unwrap();
        assert!(matches!(result, Err(ShimError::UpstreamClosed)));
        assert!(matches!(
            upstream.forward(&[op::REQUEST_IDENTITIES]).await,
            Err(ShimError::UpstreamClosed)
        ));
        upstream.close().await.unwrap();
    }

    #[tokio::test]
    async fn peer_hangup_is_reported() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut upstream = StreamUpstream::new(client);
        assert!(upstream.list().await.is_err());
    }
}
