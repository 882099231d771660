//! Broadcast/wait rendezvous keyed by agent message number.
//!
//! The dispatcher broadcasts the message number of every request it reads;
//! a `WAIT` request parks the caller until the named message next arrives.
//! Only waits registered before a broadcast are woken by it.

use tokio::sync::Notify;
use tracing::trace;

/// Number of slots; message numbers at or above this are ignored.
pub const WAITER_SLOTS: usize = 40;

#[derive(Debug)]
pub struct WaiterTable {
    slots: [Notify; WAITER_SLOTS],
}

impl Default for WaiterTable {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| Notify::new()),
        }
    }
}

impl WaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park until the next [`broadcast`](Self::broadcast) of `op`.
    /// Returns immediately for out-of-range message numbers.
    pub async fn wait(&self, op: u8) {
        let Some(slot) = self.slots.get(usize::from(op)) else {
            return;
        };
        trace!(op, "waiting");
        slot.notified().await;
    }

    /// Wake every task currently waiting on `op`.
    pub fn broadcast(&self, op: u8) {
        if let Some(slot) = self.slots.get(usize::from(op)) {
            slot.notify_waiters();
        }
    }
}
