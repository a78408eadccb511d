//! Host Controller Interface ([Vol 4] Part E).
//!
//! The host talks to the controller through the [`Controller`] trait, which
//! issues commands and waits for their status synchronously, and receives
//! events and ACL data as raw packets that are decoded here.

use structbuf::{Pack, StructBuf, Unpack};

pub use {consts::*, event::*, handle::*};

use crate::conn::SecurityLevel;
use crate::le::Addr;

mod consts;
mod event;
mod handle;

#[cfg(test)]
mod tests;

/// Error type returned by the HCI layer.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("HCI command failed with {0}")]
    Status(#[from] Status),
    #[error("HCI transport failure")]
    Transport,
    #[error("unsupported HCI event {code:#04X}")]
    UnknownEvent { code: u8 },
    #[error("malformed HCI event {code:#04X}")]
    InvalidEvent { code: u8 },
    #[error("malformed ACL data packet")]
    InvalidAcl,
}

/// Common HCI result type.
pub type Result<T> = std::result::Result<T, Error>;

/// ACL data packet header length ([Vol 4] Part E, Section 5.4.2).
pub(crate) const ACL_HDR: usize = 4;

/// ACL data packet boundary flag ([Vol 4] Part E, Section 5.4.2).
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum Boundary {
    /// First non-automatically-flushable packet of a higher layer message.
    FirstNonFlushable = 0x00,
    /// Continuing fragment of a higher layer message.
    Continuing = 0x01,
    /// First automatically flushable packet of a higher layer message.
    First = 0x02,
    /// Complete automatically flushable L2CAP PDU (BR/EDR only).
    Complete = 0x03,
}

/// LE connection parameters ([Vol 4] Part E, Section 7.8.12). Intervals are
/// in 1.25 ms units and the supervision timeout in 10 ms units.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ConnParams {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub timeout: u16,
}

impl ConnParams {
    /// Returns whether the parameters are within the ranges allowed by
    /// [Vol 4] Part E, Section 7.8.12.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.interval_min > self.interval_max
            || self.interval_min < 6
            || self.interval_max > 3200
            || self.timeout < 10
            || self.timeout > 3200
        {
            return false;
        }
        // Timeout must exceed (1 + latency) * interval_max * 2
        let max_latency = (u32::from(self.timeout) * 4 / u32::from(self.interval_max)).saturating_sub(1);
        u32::from(self.latency) <= max_latency.min(499)
    }

    /// Returns whether the current link parameters satisfy this request.
    #[inline]
    #[must_use]
    pub fn is_met_by(&self, interval: u16, latency: u16, timeout: u16) -> bool {
        (self.interval_min..=self.interval_max).contains(&interval)
            && self.latency == latency
            && self.timeout == timeout
    }
}

impl Default for ConnParams {
    #[inline]
    fn default() -> Self {
        Self {
            interval_min: 0x0018,
            interval_max: 0x0028,
            latency: 0,
            timeout: 400,
        }
    }
}

/// Controller interface used by the host. Command methods block until the
/// controller reports the command status.
pub trait Controller: Send + Sync {
    /// Sends one ACL data packet, including its header, to the controller.
    fn acl_data(&self, pkt: &[u8]) -> Result<()>;

    /// Terminates an existing connection ([Vol 4] Part E, Section 7.1.6).
    fn disconnect(&self, cn: ConnHandle, reason: Status) -> Result<()>;

    /// Starts LE connection establishment. `peer` is `None` when the filter
    /// accept list should be used ([Vol 4] Part E, Section 7.8.12).
    fn le_create_conn(&self, peer: Option<Addr>, p: &ConnParams) -> Result<()>;

    /// Cancels a pending LE connection attempt
    /// ([Vol 4] Part E, Section 7.8.13).
    fn le_create_conn_cancel(&self) -> Result<()>;

    /// Requests new connection parameters
    /// ([Vol 4] Part E, Section 7.8.18).
    fn le_conn_update(&self, cn: ConnHandle, p: &ConnParams) -> Result<()>;

    /// Requests link encryption at the specified level. The result arrives as
    /// an Encryption Change event.
    fn start_security(&self, cn: ConnHandle, level: SecurityLevel) -> Result<()> {
        let _ = (cn, level);
        Err(Error::Status(Status::PairingNotAllowed))
    }
}

/// Encodes an ACL data packet.
#[must_use]
pub(crate) fn acl_packet(cn: ConnHandle, pb: Boundary, data: &[u8]) -> Vec<u8> {
    let mut b = StructBuf::new(ACL_HDR + data.len());
    #[allow(clippy::cast_possible_truncation)]
    b.append()
        .u16(u16::from(cn) | u16::from(u8::from(pb)) << ConnHandle::BITS)
        .u16(data.len() as u16)
        .put(data);
    b.as_ref().to_vec()
}

/// Decodes an ACL data packet header, returning the connection handle,
/// packet boundary flag, and payload.
pub(crate) fn acl_split(pkt: &[u8]) -> Result<(ConnHandle, Boundary, &[u8])> {
    if pkt.len() < ACL_HDR {
        return Err(Error::InvalidAcl);
    }
    let mut p = pkt.unpack();
    let (hdr, n) = (p.u16(), usize::from(p.u16()));
    let data = &pkt[ACL_HDR..];
    if data.len() != n {
        return Err(Error::InvalidAcl);
    }
    let cn = ConnHandle::new(hdr).ok_or(Error::InvalidAcl)?;
    #[allow(clippy::cast_possible_truncation)]
    let pb = Boundary::try_from((hdr >> ConnHandle::BITS) as u8 & 0x03).map_err(|_| Error::InvalidAcl)?;
    Ok((cn, pb, data))
}
