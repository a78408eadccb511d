use smallvec::SmallVec;
use structbuf::{Unpack, Unpacker};

use crate::le::{Addr, RawAddr};

use super::*;

/// HCI event relevant to connection management ([Vol 4] Part E, Section 7.7).
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Event {
    DisconnectionComplete(DisconnectionComplete),
    EncryptionChange(EncryptionChange),
    NumberOfCompletedPackets(NumberOfCompletedPackets),
    LeConnectionComplete(LeConnectionComplete),
    LeConnectionUpdateComplete(LeConnectionUpdateComplete),
}

impl Event {
    /// Decodes an HCI event packet consisting of the event code, parameter
    /// length, and parameters ([Vol 4] Part E, Section 5.4.4).
    pub fn parse(pkt: &[u8]) -> Result<Self> {
        let (&code, hdr) = pkt.split_first().ok_or(Error::InvalidEvent { code: 0 })?;
        let (&n, params) = hdr.split_first().ok_or(Error::InvalidEvent { code })?;
        if params.len() != usize::from(n) {
            return Err(Error::InvalidEvent { code });
        }
        let typ = EventCode::try_from(code).map_err(|_| Error::UnknownEvent { code })?;
        let mut p = params.unpack();
        let evt = match typ {
            EventCode::DisconnectionComplete => Self::DisconnectionComplete(DisconnectionComplete {
                status: Status::from(p.u8()),
                handle: conn_handle(&mut p, code)?,
                reason: Status::from(p.u8()),
            }),
            EventCode::EncryptionChange => Self::EncryptionChange(EncryptionChange {
                status: Status::from(p.u8()),
                handle: conn_handle(&mut p, code)?,
                enabled: p.u8() != 0,
            }),
            EventCode::NumberOfCompletedPackets => {
                let n = usize::from(p.u8());
                let mut v = SmallVec::with_capacity(n);
                for _ in 0..n {
                    let (cn, n) = (conn_handle(&mut p, code)?, p.u16());
                    v.push((cn, n));
                }
                Self::NumberOfCompletedPackets(NumberOfCompletedPackets(v))
            }
            EventCode::LeMeta => {
                let sub = p.u8();
                match SubeventCode::try_from(sub).map_err(|_| Error::UnknownEvent { code })? {
                    SubeventCode::ConnectionComplete => {
                        Self::LeConnectionComplete(LeConnectionComplete::unpack(&mut p, code, false)?)
                    }
                    SubeventCode::EnhancedConnectionComplete => {
                        Self::LeConnectionComplete(LeConnectionComplete::unpack(&mut p, code, true)?)
                    }
                    SubeventCode::ConnectionUpdateComplete => {
                        Self::LeConnectionUpdateComplete(LeConnectionUpdateComplete {
                            status: Status::from(p.u8()),
                            handle: conn_handle(&mut p, code)?,
                            interval: p.u16(),
                            latency: p.u16(),
                            timeout: p.u16(),
                        })
                    }
                }
            }
        };
        if p.is_ok() {
            Ok(evt)
        } else {
            Err(Error::InvalidEvent { code })
        }
    }
}

/// `HCI_Disconnection_Complete` event parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DisconnectionComplete {
    pub status: Status,
    pub handle: ConnHandle,
    pub reason: Status,
}

/// `HCI_Encryption_Change` event parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EncryptionChange {
    pub status: Status,
    pub handle: ConnHandle,
    pub enabled: bool,
}

/// `HCI_Number_Of_Completed_Packets` event parameters.
#[derive(Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct NumberOfCompletedPackets(pub SmallVec<[(ConnHandle, u16); 4]>);

impl AsRef<[(ConnHandle, u16)]> for NumberOfCompletedPackets {
    #[inline]
    fn as_ref(&self) -> &[(ConnHandle, u16)] {
        self.0.as_ref()
    }
}

/// `HCI_LE_Connection_Complete` and `HCI_LE_Enhanced_Connection_Complete`
/// event parameters. Handle is `None` when the connection failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LeConnectionComplete {
    pub status: Status,
    pub handle: Option<ConnHandle>,
    pub role: Role,
    pub peer: Addr,
    pub interval: u16,
    pub latency: u16,
    pub timeout: u16,
}

impl LeConnectionComplete {
    fn unpack(p: &mut Unpacker, code: u8, enhanced: bool) -> Result<Self> {
        let status = Status::from(p.u8());
        let handle = ConnHandle::new(p.u16());
        let role = Role::try_from(p.u8()).map_err(|_| Error::InvalidEvent { code })?;
        let typ = p.u8();
        let peer = Addr::peer(typ, raw_addr(p)).ok_or(Error::InvalidEvent { code })?;
        if enhanced {
            // Local and peer resolvable private addresses
            let _ = (raw_addr(p), raw_addr(p));
        }
        let (interval, latency, timeout) = (p.u16(), p.u16(), p.u16());
        let _clock_accuracy = p.u8();
        Ok(Self {
            status,
            handle: if status.is_ok() { handle } else { None },
            role,
            peer,
            interval,
            latency,
            timeout,
        })
    }
}

/// `HCI_LE_Connection_Update_Complete` event parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LeConnectionUpdateComplete {
    pub status: Status,
    pub handle: ConnHandle,
    pub interval: u16,
    pub latency: u16,
    pub timeout: u16,
}

#[inline]
fn conn_handle(p: &mut Unpacker, code: u8) -> Result<ConnHandle> {
    ConnHandle::new(p.u16()).ok_or(Error::InvalidEvent { code })
}

#[inline]
fn raw_addr(p: &mut Unpacker) -> RawAddr {
    let mut v = [0; 6];
    for b in &mut v {
        *b = p.u8();
    }
    RawAddr::from_le_bytes(v)
}
