//! Warble Bluetooth LE host core.
//!
//! Connection management, TX flow control, L2CAP reassembly, and a GATT
//! server and client on top of a host controller interface. The controller
//! itself is reached through the [`hci::Controller`] trait and the
//! transport feeds events and ACL data to [`host::Host`].

use crate::le::Addr;

pub mod att;
pub mod conn;
pub mod gap;
pub mod gatt;
pub mod hci;
pub mod host;
pub mod le;
mod util;

#[cfg(test)]
mod test_util;

/// Persistent storage of per-peer records, keyed by local identity and peer
/// address. Implementations must be safe to call from the system work queue.
pub trait PeerStore: Send + Sync {
    /// Record type.
    type Value;

    /// Saves a record, replacing any existing one. Returns `false` on
    /// failure.
    fn save(&self, id: u8, peer: Addr, v: &Self::Value) -> bool;

    /// Loads a previously saved record.
    fn load(&self, id: u8, peer: Addr) -> Option<Self::Value>;

    /// Removes a record.
    fn remove(&self, id: u8, peer: Addr);

    /// Removes all records.
    fn clear(&self);
}
