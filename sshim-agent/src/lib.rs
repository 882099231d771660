//! Shimming SSH agent.
//!
//! Sits between SSH clients and an upstream key-holding agent (a software
//! keyring or a hardware-token helper), speaking the OpenSSH agent protocol
//! plus a handful of vendor extensions.
//!
//! # Architecture
//!
//! ```text
//! ssh client ──► ShimAgent (listen) ──► Dispatcher (per connection)
//!                                           │
//!                                           ├─ vendor messages (hard certs, slots, wait)
//!                                           ├─ standard requests ──► ShimServer
//!                                           └─ everything else ───► forwarded verbatim
//!
//! ShimServer ── Mutex<{ Catalog, upstream }> ──► UpstreamAgent
//!     │
//!     ├── lock flag, upstream CloseHandle (outside the mutex)
//!     └── WaiterTable (broadcast/wait, outside the mutex)
//! ```
//!
//! # What the shim adds
//!
//! - Hardware-backed certificates adopted with `ADD_HARD_CERT` are kept in a
//!   [`Catalog`]; signing with one signs upstream with its base key.
//! - Expired certificates, and catalog certificates whose base key has left
//!   the upstream, are pruned before every list and sign.
//! - In suppress-upstream mode vendor certificates stored directly in the
//!   upstream are hidden from clients.

pub mod catalog;
pub mod dispatch;
pub mod error;
pub mod proto;
pub mod server;
#[cfg(unix)]
pub mod session;
pub mod slots;
pub mod upstream;
pub mod waiter;
pub mod wire;

#[cfg(test)]
mod testing;

pub use catalog::{Catalog, CatalogEntry};
pub use dispatch::Dispatcher;
pub use error::{Result, ShimError};
pub use server::{ServerOptions, ShimServer, ShimSigner};
#[cfg(unix)]
pub use session::ShimAgent;
pub use slots::SlotProvider;
pub use upstream::{CloseHandle, UpstreamAgent};
