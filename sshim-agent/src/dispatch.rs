//! Per-connection request loop.
//!
//! Every frame is dispatched on its own: vendor messages are handled here,
//! standard agent requests go to the [`ShimServer`], and anything else is
//! relayed to the upstream agent untouched.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::error::{Result, ShimError};
use crate::proto::{self, Request, Response, SUCCESS_REPLY, op};
use crate::server::ShimServer;
use crate::slots::{SLOTS_UNSUPPORTED, SlotProvider};
use crate::wire;

#[derive(Clone)]
pub struct Dispatcher {
    server: Arc<ShimServer>,
    slots: Option<Arc<dyn SlotProvider>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("server", &self.server)
            .field("slots", &self.slots.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(server: Arc<ShimServer>) -> Self {
        Self { server, slots: None }
    }

    pub fn with_slots(mut self, slots: Arc<dyn SlotProvider>) -> Self {
        self.slots = Some(slots);
        self
    }

    /// Serve one client until it hangs up.
    pub async fn serve<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        while let Some(request) = wire::read_frame(&mut stream).await? {
            let reply = self.handle(&request).await?;
            wire::write_frame(&mut stream, &reply).await?;
        }
        debug!("client disconnected");
        Ok(())
    }

    /// Answer a single request payload.
    pub async fn handle(&self, request: &[u8]) -> Result<Vec<u8>> {
        let Some((&msg, body)) = request.split_first() else {
            return Response::Failure.encode();
        };
        self.server.broadcast(msg);

        match msg {
            op::ADD_HARD_CERT => Ok(self.add_hard_cert(body).await),
            op::LIST_SLOTS | op::READ_SLOT | op::ATTEST_SLOT => self.slot_request(msg, body).await,
            op::WAIT => Ok(self.wait(body).await),
            op::REQUEST_V1_IDENTITIES
            | op::REQUEST_IDENTITIES
            | op::SIGN_REQUEST
            | op::ADD_IDENTITY
            | op::REMOVE_IDENTITY
            | op::REMOVE_ALL_IDENTITIES
            | op::LOCK
            | op::UNLOCK
            | op::ADD_ID_CONSTRAINED => self.standard(request).await,
            _ => self.forward(request).await,
        }
    }

    async fn add_hard_cert(&self, body: &[u8]) -> Vec<u8> {
        let result = match proto::decode_hard_cert(body) {
            Ok((key_blob, comment)) => self.server.adopt_hw_cert(&key_blob, &comment).await,
            Err(e) => Err(e),
        };
        vendor_reply(result, "add hard cert")
    }

    async fn wait(&self, body: &[u8]) -> Vec<u8> {
        let result = match body.first() {
            Some(&target) => {
                self.server.wait(target).await;
                Ok(())
            }
            None => Err(ShimError::Malformed("wait request without message number".to_string())),
        };
        vendor_reply(result, "wait")
    }

    async fn slot_request(&self, msg: u8, body: &[u8]) -> Result<Vec<u8>> {
        let Some(slots) = &self.slots else {
            return if msg == op::LIST_SLOTS {
                proto::encode_slot_list(&[], SLOTS_UNSUPPORTED)
            } else {
                proto::encode_slot_cert(&[], SLOTS_UNSUPPORTED)
            };
        };

        if msg == op::LIST_SLOTS {
            return match slots.list_slots().await {
                Ok(names) => proto::encode_slot_list(&names, ""),
                Err(e) => {
                    warn!(error = %e, "list slots failed");
                    proto::encode_slot_list(&[], &e.to_string())
                }
            };
        }

        let slot = match proto::decode_slot_id(body) {
            Ok(slot) => slot,
            Err(e) => return proto::encode_slot_cert(&[], &e.to_string()),
        };
        let result = if msg == op::READ_SLOT {
            slots.read_slot(&slot).await
        } else {
            slots.attest_slot(&slot).await
        };
        match result {
            Ok(pem) => proto::encode_slot_cert(pem.as_bytes(), ""),
            Err(e) => {
                warn!(slot = %slot, msg, error = %e, "slot request failed");
                proto::encode_slot_cert(&[], &e.to_string())
            }
        }
    }

    async fn standard(&self, request: &[u8]) -> Result<Vec<u8>> {
        let response = match Request::decode(request) {
            Ok(Some(decoded)) => match self.answer(decoded).await {
                Ok(response) => response,
                Err(e) => {
                    debug!(msg = request[0], error = %e, "request failed");
                    Response::Failure
                }
            },
            Ok(None) => return self.forward(request).await,
            Err(e) => {
                warn!(msg = request[0], error = %e, "malformed request");
                Response::Failure
            }
        };
        response.encode()
    }

    async fn answer(&self, request: Request) -> Result<Response> {
        let response = match request {
            Request::RequestV1Identities => Response::V1IdentitiesAnswer,
            Request::RequestIdentities => Response::Identities(self.server.list().await?),
            Request::Sign(req) => {
                let signature = self.server.sign(&req.key_blob, &req.data, req.flags).await?;
                Response::Signature(signature)
            }
            Request::Add(key) => {
                self.server.add(key).await?;
                Response::Success
            }
            Request::Remove(key_blob) => {
                self.server.remove(&key_blob).await?;
                Response::Success
            }
            Request::RemoveAll => {
                self.server.remove_all().await?;
                Response::Success
            }
            Request::Lock(passphrase) => {
                self.server.lock(&passphrase).await?;
                Response::Success
            }
            Request::Unlock(passphrase) => {
                self.server.unlock(&passphrase).await?;
                Response::Success
            }
        };
        Ok(response)
    }

    async fn forward(&self, request: &[u8]) -> Result<Vec<u8>> {
        match proto::decode_smartcard(request) {
            Some(Ok(card)) => info!(
                msg = request[0],
                id = %card.id,
                lifetime = ?card.lifetime,
                confirm = card.confirm,
                "forwarding smartcard request"
            ),
            Some(Err(e)) => warn!(msg = request[0], error = %e, "undecodable smartcard request"),
            None => debug!(msg = request[0], "forwarding request"),
        }

        match self.server.forward(request).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                debug!(error = %e, "forward failed");
                Response::Failure.encode()
            }
        }
    }
}

/// `SUCCESS`, or the error text, for vendor messages.
fn vendor_reply(result: Result<()>, what: &str) -> Vec<u8> {
    match result {
        Ok(()) => SUCCESS_REPLY.to_vec(),
        Err(e) => {
            debug!(error = %e, "{what} failed");
            e.to_string().into_bytes()
        }
    }
}
