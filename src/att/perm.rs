use crate::conn::SecurityLevel;

use super::*;

bitflags::bitflags! {
    /// Attribute permissions ([Vol 3] Part F, Section 3.2.5).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Perms: u8 {
        /// Attribute value can be read.
        const READ = 1 << 0;
        /// Attribute value can be written.
        const WRITE = 1 << 1;
        /// Reads require an encrypted link.
        const READ_ENCRYPT = 1 << 2;
        /// Writes require an encrypted link.
        const WRITE_ENCRYPT = 1 << 3;
        /// Reads require an authenticated link.
        const READ_AUTHEN = 1 << 4;
        /// Writes require an authenticated link.
        const WRITE_AUTHEN = 1 << 5;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl Perms {
    /// Tests whether a read is allowed at the specified link security level.
    #[inline]
    pub fn test_read(self, sec: SecurityLevel) -> std::result::Result<(), ErrorCode> {
        if !self.contains(Self::READ) {
            return Err(ErrorCode::ReadNotPermitted);
        }
        Self::test_sec(
            sec,
            self.contains(Self::READ_AUTHEN),
            self.contains(Self::READ_ENCRYPT),
        )
    }

    /// Tests whether a write is allowed at the specified link security level.
    #[inline]
    pub fn test_write(self, sec: SecurityLevel) -> std::result::Result<(), ErrorCode> {
        if !self.contains(Self::WRITE) {
            return Err(ErrorCode::WriteNotPermitted);
        }
        Self::test_sec(
            sec,
            self.contains(Self::WRITE_AUTHEN),
            self.contains(Self::WRITE_ENCRYPT),
        )
    }

    const fn test_sec(
        sec: SecurityLevel,
        authn: bool,
        encrypt: bool,
    ) -> std::result::Result<(), ErrorCode> {
        // Order matches ATT_READ_REQ ([Vol 3] Part F, Section 3.4.4.3)
        if authn && (sec as u8) < SecurityLevel::L3 as u8 {
            Err(ErrorCode::InsufficientAuthentication)
        } else if encrypt && (sec as u8) < SecurityLevel::L2 as u8 {
            Err(ErrorCode::InsufficientEncryption)
        } else {
            Ok(())
        }
    }
}
