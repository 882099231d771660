//! Hardware slot access for the `LIST_SLOTS`, `READ_SLOT` and `ATTEST_SLOT`
//! vendor messages.
//!
//! The shim does not talk to tokens itself; a [`SlotProvider`] is plugged
//! into the dispatcher by whoever embeds it.

use async_trait::async_trait;

/// Error text sent when no provider is configured.
pub const SLOTS_UNSUPPORTED: &str = "slot operations not supported";

#[async_trait]
pub trait SlotProvider: Send + Sync {
    /// Names of the populated slots, e.g. `["9a", "9c"]`.
    async fn list_slots(&self) -> anyhow::Result<Vec<String>>;

    /// PEM-encoded certificate stored in `slot`.
    async fn read_slot(&self, slot: &str) -> anyhow::Result<String>;

    /// PEM-encoded attestation certificate for the key in `slot`.
    async fn attest_slot(&self, slot: &str) -> anyhow::Result<String>;
}
