use std::cmp::Ordering as CmpOrdering;

use structbuf::Unpack;
use tracing::{error, trace};

use crate::hci::Boundary;

use super::*;

impl Conn {
    /// Reassembles an L2CAP frame from ACL fragments. Returns the complete
    /// frame, including its basic header, once the final fragment arrives.
    pub(crate) fn recv(&self, data: &[u8], pb: Boundary) -> Option<Vec<u8>> {
        // Pending TX callbacks go before new data for this connection
        self.tx_notify();

        let cap = self.shared.cfg.rx_mtu;
        let mut l = self.slot().link.lock();
        match pb {
            Boundary::FirstNonFlushable | Boundary::First => {
                if l.rx.is_some() {
                    error!("{self:?} unexpected first L2CAP frame");
                    l.rx = None;
                }
                if data.len() > cap {
                    error!("{self:?} L2CAP frame exceeds {cap} bytes");
                    return None;
                }
                l.rx = Some(data.to_vec());
            }
            Boundary::Continuing => {
                let Some(rx) = l.rx.as_mut() else {
                    error!("{self:?} unexpected L2CAP continuation");
                    return None;
                };
                if data.is_empty() {
                    trace!("{self:?} empty ACL continuation");
                    return None;
                }
                if rx.len() + data.len() > cap {
                    error!("{self:?} not enough buffer space for L2CAP data");
                    l.rx = None;
                    return None;
                }
                rx.extend_from_slice(data);
            }
            Boundary::Complete => {
                error!("{self:?} unexpected ACL flags ({:#04X})", u8::from(pb));
                l.rx = None;
                return None;
            }
        }

        let n = l.rx.as_ref().map_or(0, Vec::len);
        if n < 2 {
            return None;
        }
        let want = l.rx.as_deref().map_or(0, |rx| usize::from(rx.unpack().u16())) + L2CAP_HDR;
        match n.cmp(&want) {
            CmpOrdering::Less => None,
            CmpOrdering::Greater => {
                error!("{self:?} ACL length mismatch ({n} > {want})");
                l.rx = None;
                None
            }
            CmpOrdering::Equal => l.rx.take(),
        }
    }
}
