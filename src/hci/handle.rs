use std::fmt::{Debug, Formatter};

use crate::util::name_of;

/// Controller-assigned connection handle ([Vol 4] Part E, Section 5.4.2).
/// Only valid while the connection has a handle (see
/// [`State::has_handle`](crate::conn::State::has_handle)).
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct ConnHandle(u16);

impl ConnHandle {
    /// Handle width in the ACL data packet header.
    pub(crate) const BITS: u16 = 12;
    /// Values above this are reserved.
    const MAX: u16 = 0x0EFF;
    const MASK: u16 = (1 << Self::BITS) - 1;

    /// Extracts the handle from the low 12 bits of `v`. Returns `None` for
    /// reserved values.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Option<Self> {
        match v & Self::MASK {
            h @ 0..=Self::MAX => Some(Self(h)),
            _ => None,
        }
    }
}

impl From<ConnHandle> for u16 {
    #[inline(always)]
    fn from(cn: ConnHandle) -> Self {
        cn.0
    }
}

impl Debug for ConnHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#05X})", name_of!(ConnHandle), self.0)
    }
}

crate::impl_display_via_debug! { ConnHandle }
