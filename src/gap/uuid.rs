#![allow(clippy::use_self)]

use std::fmt::{Debug, Formatter};
use std::num::{NonZeroU128, NonZeroU16};

use structbuf::{Packer, Unpack};

const SHIFT: u32 = u128::BITS - u32::BITS;
const BASE: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;
const MASK_16: u128 = !((u16::MAX as u128) << SHIFT);

/// 16- or 128-bit UUID ([Vol 3] Part B, Section 2.5.1).
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Uuid(NonZeroU128);

impl Uuid {
    /// UUID size in bytes.
    pub const BYTES: usize = std::mem::size_of::<Self>();

    /// Creates a UUID from a `u128`.
    #[inline]
    #[must_use]
    pub const fn new(v: u128) -> Option<Self> {
        match NonZeroU128::new(v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Returns a [`Uuid16`] representation or [`None`] if the UUID is not an
    /// assigned 16-bit UUID.
    #[inline]
    #[must_use]
    pub fn as_uuid16(self) -> Option<Uuid16> {
        #[allow(clippy::cast_possible_truncation)]
        let v = (self.0.get() >> SHIFT) as u16;
        (self.0.get() & MASK_16 == BASE).then(|| Uuid16::new(v)).flatten()
    }

    /// Returns the number of bytes used to encode the UUID in ATT PDUs.
    #[inline]
    #[must_use]
    pub fn wire_len(self) -> usize {
        self.as_uuid16().map_or(Self::BYTES, |_| Uuid16::BYTES)
    }

    /// Writes the shortest encoding of the UUID.
    #[inline]
    pub fn pack(self, p: &mut Packer) {
        match self.as_uuid16() {
            Some(u) => {
                p.u16(u.raw());
            }
            None => {
                p.u128(self.0.get());
            }
        }
    }

    /// Returns the shortest little-endian encoding of the UUID.
    #[must_use]
    pub fn to_wire(self) -> Vec<u8> {
        match self.as_uuid16() {
            Some(u) => u.raw().to_le_bytes().to_vec(),
            None => self.0.get().to_le_bytes().to_vec(),
        }
    }
}

impl From<Uuid16> for Uuid {
    #[inline]
    fn from(u: Uuid16) -> Self {
        u.as_uuid()
    }
}

impl TryFrom<&[u8]> for Uuid {
    type Error = ();

    #[inline]
    fn try_from(v: &[u8]) -> Result<Self, Self::Error> {
        match v.len() {
            Self::BYTES => Self::new(v.unpack().u128()),
            Uuid16::BYTES => Uuid16::new(v.unpack().u16()).map(Uuid16::as_uuid),
            _ => None,
        }
        .ok_or(())
    }
}

impl Debug for Uuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        #[allow(clippy::cast_possible_truncation)]
        if let Some(v) = self.as_uuid16() {
            Debug::fmt(&v, f)
        } else {
            let v = self.0.get();
            write!(
                f,
                "{:08X}-{:04X}-{:04X}-{:04X}-{:012X}",
                (v >> 96) as u32,
                (v >> 80) as u16,
                (v >> 64) as u16,
                (v >> 48) as u16,
                (v & ((1 << 48) - 1)) as u64
            )
        }
    }
}

impl From<Uuid> for u128 {
    #[inline]
    fn from(u: Uuid) -> Self {
        u.0.get()
    }
}

impl PartialEq<Uuid16> for Uuid {
    #[inline]
    fn eq(&self, other: &Uuid16) -> bool {
        *self == other.as_uuid()
    }
}

/// 16-bit Bluetooth SIG UUID.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Uuid16(NonZeroU16);

impl Uuid16 {
    /// UUID size in bytes.
    pub const BYTES: usize = std::mem::size_of::<Self>();

    /// Creates a 16-bit SIG UUID from a `u16`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Option<Self> {
        match NonZeroU16::new(v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Returns 128-bit UUID representation.
    #[inline]
    #[must_use]
    pub const fn as_uuid(self) -> Uuid {
        match Uuid::new((self.0.get() as u128) << SHIFT | BASE) {
            Some(u) => u,
            None => unreachable!(),
        }
    }

    /// Returns the raw 16-bit UUID value.
    #[inline(always)]
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0.get()
    }
}

impl Debug for Uuid16 {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06X}", self.0.get())
    }
}

impl From<Uuid16> for u16 {
    #[inline]
    fn from(u: Uuid16) -> Self {
        u.raw()
    }
}

impl PartialEq<Uuid> for Uuid16 {
    #[inline]
    fn eq(&self, other: &Uuid) -> bool {
        self.as_uuid() == *other
    }
}

crate::impl_display_via_debug! { Uuid, Uuid16 }

/// Creates an assigned 16-bit SIG UUID in a const context.
///
/// # Panics
///
/// Panics if `v` is 0.
#[inline]
#[must_use]
pub const fn uuid16(v: u16) -> Uuid16 {
    match Uuid16::new(v) {
        Some(u) => u,
        None => panic!("invalid 16-bit UUID"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid16_round_trip() {
        let u = uuid16(0x2902).as_uuid();
        assert_eq!(u.as_uuid16(), Some(uuid16(0x2902)));
        assert_eq!(u.wire_len(), 2);
        assert_eq!(u.to_wire(), [0x02, 0x29]);
        assert_eq!(Uuid::try_from(&[0x02, 0x29][..]), Ok(u));
        assert_eq!(format!("{u}"), "0x2902");
    }

    #[test]
    fn uuid128() {
        let u = Uuid::new(0x12345678_9ABC_DEF0_1234_56789ABCDEF0).unwrap();
        assert_eq!(u.as_uuid16(), None);
        assert_eq!(u.wire_len(), 16);
        assert_eq!(Uuid::try_from(u.to_wire().as_slice()), Ok(u));
        assert_eq!(format!("{u}"), "12345678-9ABC-DEF0-1234-56789ABCDEF0");
        assert!(Uuid::try_from(&[1, 2, 3][..]).is_err());
    }
}
