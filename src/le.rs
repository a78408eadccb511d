//! LE-specific types.

use std::collections::HashSet;
use std::fmt::{Debug, Display, Formatter};

use parking_lot::RwLock;

/// Bluetooth device address ([Vol 6] Part B, Section 1.3).
#[allow(clippy::exhaustive_enums)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Addr {
    Public(RawAddr),
    Random(RawAddr),
}

impl Addr {
    /// Constructs a peer address from type and raw components. Returns `None`
    /// for an unknown address type.
    #[inline]
    #[must_use]
    pub const fn peer(typ: u8, raw: RawAddr) -> Option<Self> {
        // [Vol 4] Part E, Sections 7.7.65.1 and 7.7.65.10
        match typ {
            // Public Device Address or Public Identity Address
            0x00 | 0x02 => Some(Self::Public(raw)),
            // Random Device Address or Random (Static) Identity Address
            0x01 | 0x03 => Some(Self::Random(raw)),
            _ => None,
        }
    }

    /// Returns the raw 48-bit address.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> RawAddr {
        match self {
            Self::Public(addr) | Self::Random(addr) => addr,
        }
    }

    /// Returns the HCI address type (0 for public, 1 for random).
    #[inline]
    #[must_use]
    pub const fn typ(self) -> u8 {
        match self {
            Self::Public(_) => 0x00,
            Self::Random(_) => 0x01,
        }
    }
}

impl Default for Addr {
    #[inline]
    fn default() -> Self {
        Self::Public(RawAddr::default())
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Public(ref raw) => write!(f, "{raw} (public)"),
            Self::Random(ref raw) => write!(f, "{raw} (random)"),
        }
    }
}

/// 48-bit untyped device address stored in little-endian byte order.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct RawAddr([u8; 6]);

impl RawAddr {
    /// Creates an address from little-endian bytes.
    #[inline(always)]
    #[must_use]
    pub const fn from_le_bytes(v: [u8; 6]) -> Self {
        Self(v)
    }

    /// Returns the address as little-endian bytes.
    #[inline(always)]
    #[must_use]
    pub const fn as_le_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl From<[u8; 6]> for RawAddr {
    #[inline]
    fn from(v: [u8; 6]) -> Self {
        Self(v)
    }
}

impl AsRef<[u8]> for RawAddr {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl Debug for RawAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // [Vol 3] Part C, Section 3.2.1.3
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[5], self.0[4], self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

crate::impl_display_via_debug! { RawAddr }

/// Set of bonded peers keyed by local identity and peer address. Bonding
/// itself happens outside of this crate; the host only needs to know whether
/// a peer's state should outlive its connection.
#[derive(Debug, Default)]
pub struct Bonds(RwLock<HashSet<(u8, Addr)>>);

impl Bonds {
    /// Marks the peer as bonded. Returns `false` if it already was.
    #[inline]
    pub fn add(&self, id: u8, peer: Addr) -> bool {
        self.0.write().insert((id, peer))
    }

    /// Removes the bond. Returns `false` if the peer was not bonded.
    #[inline]
    pub fn remove(&self, id: u8, peer: Addr) -> bool {
        self.0.write().remove(&(id, peer))
    }

    /// Returns whether the peer is bonded.
    #[inline]
    #[must_use]
    pub fn contains(&self, id: u8, peer: Addr) -> bool {
        self.0.read().contains(&(id, peer))
    }
}
