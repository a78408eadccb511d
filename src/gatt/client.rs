//! GATT client procedures ([Vol 3] Part G, Section 4).
//!
//! All procedures return as soon as the first request is queued on the ATT
//! bearer. Results are delivered to callbacks from the thread that processes
//! received ACL data. A procedure that fails to start returns an error and
//! never calls its callback.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use structbuf::Unpack;
use tracing::{debug, trace, warn};

use crate::att::{self, Att, ErrorCode, Handle, HandleRange, Opcode, MAX_VAL_LEN};
use crate::conn::{Conn, SecurityLevel};
use crate::gap::{self, Uuid, Uuid16};
use crate::le::Addr;

use super::{Cccd, CharProps, Error, Result};

#[cfg(test)]
mod tests;

/// Signature field length of `ATT_SIGNED_WRITE_CMD`
/// ([Vol 3] Part F, Section 3.4.5.4).
const SIGNATURE_LEN: usize = 12;

/// Iteration control returned by client callbacks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Iter {
    Continue,
    Stop,
}

/// Discovery procedure ([Vol 3] Part G, Sections 4.4 - 4.7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Discover {
    Primary,
    Secondary,
    Include,
    Characteristic,
    Descriptor,
}

/// Attribute found by a discovery procedure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Found {
    Service {
        hdl: Handle,
        end: Handle,
        uuid: Uuid,
    },
    Include {
        hdl: Handle,
        range: HandleRange,
        uuid: Uuid,
    },
    Characteristic {
        hdl: Handle,
        props: CharProps,
        value: Handle,
        uuid: Uuid,
    },
    Descriptor {
        hdl: Handle,
        uuid: Uuid,
    },
}

impl Found {
    /// Returns the attribute handle.
    #[must_use]
    pub const fn handle(&self) -> Handle {
        match *self {
            Self::Service { hdl, .. }
            | Self::Include { hdl, .. }
            | Self::Characteristic { hdl, .. }
            | Self::Descriptor { hdl, .. } => hdl,
        }
    }

    /// Returns the service, characteristic, or descriptor UUID.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        match *self {
            Self::Service { uuid, .. }
            | Self::Include { uuid, .. }
            | Self::Characteristic { uuid, .. }
            | Self::Descriptor { uuid, .. } => uuid,
        }
    }
}

/// Discovery callback. Receives each attribute found and finally [`None`]
/// unless it returned [`Iter::Stop`].
pub type DiscoverCallback = Box<dyn FnMut(&Conn, Option<&Found>) -> Iter + Send>;

/// Read completion callback.
pub type ReadCallback = Box<dyn FnOnce(&Conn, att::Result<Vec<u8>>) + Send>;

/// Write completion callback.
pub type WriteCallback = Box<dyn FnOnce(&Conn, att::Result<()>) + Send>;

/// MTU exchange completion callback. Receives the new ATT_MTU.
pub type MtuCallback = Box<dyn FnOnce(&Conn, att::Result<u16>) + Send>;

/// Notification callback. Receives the value of each notification or
/// indication and [`None`] when the subscription is removed.
pub type NotifyCallback = Box<dyn Fn(&Conn, Option<&[u8]>) -> Iter + Send + Sync>;

/// Subscription to notifications or indications of a remote characteristic.
pub struct Subscription {
    value: Handle,
    ccc: Handle,
    cccd: Cccd,
    volatile: bool,
    f: NotifyCallback,
}

impl Subscription {
    /// Creates a subscription for the characteristic with value handle
    /// `value` and CCC descriptor handle `ccc`.
    #[must_use]
    pub fn new(value: Handle, ccc: Handle, cccd: Cccd, f: NotifyCallback) -> Self {
        Self {
            value,
            ccc,
            cccd,
            volatile: false,
            f,
        }
    }

    /// Makes the subscription volatile. Volatile subscriptions are removed on
    /// disconnection even if the peer is bonded.
    #[must_use]
    pub const fn volatile(mut self) -> Self {
        self.volatile = true;
        self
    }

    /// Returns the characteristic value handle.
    #[inline]
    #[must_use]
    pub const fn value_handle(&self) -> Handle {
        self.value
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("value", &self.value)
            .field("ccc", &self.ccc)
            .field("cccd", &self.cccd)
            .field("volatile", &self.volatile)
            .finish_non_exhaustive()
    }
}

struct Sub {
    id: u8,
    peer: Addr,
    s: Arc<Subscription>,
}

impl Sub {
    #[inline]
    fn is_peer(&self, conn: &Conn) -> bool {
        self.id == conn.id() && self.peer == conn.dst()
    }
}

struct Inner {
    att: Att,
    mtu: u16,
    subs: Mutex<Vec<Sub>>,
}

/// GATT client.
#[derive(Clone)]
pub struct Client(Arc<Inner>);

impl Client {
    pub(super) fn new(att: Att, mtu: u16) -> Self {
        Self(Arc::new(Inner {
            att,
            mtu,
            subs: Mutex::default(),
        }))
    }

    /// Discovers services, includes, characteristics, or descriptors within
    /// `range`, optionally filtered by UUID.
    pub fn discover(
        &self,
        conn: &Conn,
        typ: Discover,
        uuid: Option<Uuid>,
        range: HandleRange,
        cb: DiscoverCallback,
    ) -> Result<()> {
        let d = Arc::new(Mutex::new(Discovery {
            typ,
            uuid,
            start: range.start(),
            end: range.end(),
            st: DiscoverState::NotStarted,
            cb,
        }));
        Ok(self.disc_send(conn, &d)?)
    }

    /// Reads a complete attribute value, continuing with `ATT_READ_BLOB_REQ`
    /// while responses fill the ATT_MTU ([Vol 3] Part G, Section 4.8.3).
    pub fn read(&self, conn: &Conn, hdl: Handle, cb: ReadCallback) -> Result<()> {
        let r = Arc::new(Mutex::new(LongRead {
            hdl,
            buf: Vec::new(),
            cb: Some(cb),
        }));
        Ok(self.read_send(conn, &r)?)
    }

    /// Reads part of an attribute value starting at offset `off`
    /// ([Vol 3] Part F, Section 3.4.4.5).
    pub fn read_at(&self, conn: &Conn, hdl: Handle, off: u16, cb: ReadCallback) -> Result<()> {
        let pdu = att::pdu(Opcode::ReadBlobReq, |p| {
            p.u16(hdl).u16(off);
        });
        let cb: att::RspCallback = Box::new(move |c: &Conn, r: att::Result<&[u8]>| cb(c, r.map(<[u8]>::to_vec)));
        Ok(self.0.att.request(conn, pdu, cb)?)
    }

    /// Reads multiple attribute values with one request
    /// ([Vol 3] Part G, Section 4.8.4).
    pub fn read_multiple(&self, conn: &Conn, hdls: &[Handle], cb: ReadCallback) -> Result<()> {
        if hdls.len() < 2 {
            return Err(Error::InvalidArgument);
        }
        let pdu = att::pdu(Opcode::ReadMultipleReq, |p| {
            for &h in hdls {
                p.u16(h);
            }
        });
        let cb: att::RspCallback = Box::new(move |c: &Conn, r: att::Result<&[u8]>| cb(c, r.map(<[u8]>::to_vec)));
        Ok(self.0.att.request(conn, pdu, cb)?)
    }

    /// Writes an attribute value. Values that do not fit in one
    /// `ATT_WRITE_REQ` are written with prepared writes
    /// ([Vol 3] Part G, Sections 4.9.3 and 4.9.4).
    pub fn write(&self, conn: &Conn, hdl: Handle, v: &[u8], cb: WriteCallback) -> Result<()> {
        if v.len() > MAX_VAL_LEN {
            return Err(Error::InvalidArgument);
        }
        let mtu = usize::from(self.0.att.mtu(conn));
        if v.len() <= mtu - 3 {
            let pdu = att::pdu(Opcode::WriteReq, |p| {
                p.u16(hdl).put(v);
            });
            let cb: att::RspCallback = Box::new(move |c: &Conn, r: att::Result<&[u8]>| cb(c, r.map(|_| ())));
            return Ok(self.0.att.request(conn, pdu, cb)?);
        }
        let w = Arc::new(Mutex::new(LongWrite {
            hdl,
            data: v.to_vec(),
            off: 0,
            chunk: mtu - 5,
            cb: Some(cb),
        }));
        Ok(self.write_send(conn, &w)?)
    }

    /// Writes an attribute value without a response. A signed write is sent
    /// only if `signed` is set and the link is not encrypted
    /// ([Vol 3] Part G, Sections 4.9.1 and 4.9.2).
    pub fn write_without_response(&self, conn: &Conn, hdl: Handle, v: &[u8], signed: bool) -> Result<()> {
        let signed = signed && conn.security() < SecurityLevel::L2;
        let op = if signed { Opcode::SignedWriteCmd } else { Opcode::WriteCmd };
        let pdu = att::pdu(op, |p| {
            p.u16(hdl).put(v);
            if signed {
                p.put([0; SIGNATURE_LEN]);
            }
        });
        Ok(self.0.att.send(conn, &pdu, None)?)
    }

    /// Exchanges the ATT_MTU with the server ([Vol 3] Part G, Section 4.3.1).
    pub fn exchange_mtu(&self, conn: &Conn, cb: MtuCallback) -> Result<()> {
        let local = self.0.mtu;
        let pdu = att::pdu(Opcode::ExchangeMtuReq, |p| {
            p.u16(local);
        });
        let att = self.0.att.clone();
        let cb: att::RspCallback = Box::new(move |c: &Conn, r: att::Result<&[u8]>| {
            let r = r.and_then(|p| {
                if p.len() != 2 {
                    return Err(att::Error::InvalidPdu);
                }
                att.set_mtu(c, p.unpack().u16().min(local));
                Ok(att.mtu(c))
            });
            cb(c, r);
        });
        Ok(self.0.att.request(conn, pdu, cb)?)
    }

    /// Subscribes to notifications or indications
    /// ([Vol 3] Part G, Sections 4.10 and 4.11). The subscription is active
    /// before the CCC write completes. If the write fails, the subscription
    /// is removed and its callback receives [`None`].
    pub fn subscribe(&self, conn: &Conn, s: &Arc<Subscription>) -> Result<()> {
        if s.cccd.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let write = {
            let mut subs = self.0.subs.lock();
            if (subs.iter()).any(|e| e.is_peer(conn) && Arc::ptr_eq(&e.s, s)) {
                return Err(Error::Already);
            }
            let covered = (subs.iter())
                .any(|e| e.is_peer(conn) && e.s.value == s.value && e.s.cccd >= s.cccd);
            subs.push(Sub {
                id: conn.id(),
                peer: conn.dst(),
                s: Arc::clone(s),
            });
            !covered
        };
        if !write {
            trace!("{conn:?} CCC {} already configured", s.ccc);
            return Ok(());
        }
        let (this, s2) = (self.clone(), Arc::clone(s));
        let cb: WriteCallback = Box::new(move |c: &Conn, r: att::Result<()>| {
            if let Err(e) = r {
                warn!("{c:?} subscription to {} failed: {e}", s2.value);
                if this.remove(c, &s2) {
                    (s2.f)(c, None);
                }
            }
        });
        self.write_ccc(conn, s.ccc, s.cccd, cb).map_err(|e| {
            self.remove(conn, s);
            e
        })
    }

    /// Removes a subscription. The CCC descriptor is cleared unless other
    /// subscriptions for the same characteristic remain.
    pub fn unsubscribe(&self, conn: &Conn, s: &Arc<Subscription>) -> Result<()> {
        if !self.remove(conn, s) {
            return Err(Error::InvalidArgument);
        }
        let others = (self.0.subs.lock().iter()).any(|e| e.is_peer(conn) && e.s.value == s.value);
        if others {
            (s.f)(conn, None);
            return Ok(());
        }
        let s2 = Arc::clone(s);
        let cb: WriteCallback = Box::new(move |c: &Conn, r: att::Result<()>| {
            if let Err(e) = r {
                debug!("{c:?} CCC {} clear failed: {e}", s2.ccc);
            }
            (s2.f)(c, None);
        });
        self.write_ccc(conn, s.ccc, Cccd::empty(), cb)
    }

    /// Delivers a received notification or indication to matching
    /// subscriptions.
    pub(super) fn notification(&self, conn: &Conn, hdl: Handle, v: &[u8]) {
        let subs: Vec<_> = (self.0.subs.lock().iter())
            .filter(|e| e.is_peer(conn) && e.s.value == hdl)
            .map(|e| Arc::clone(&e.s))
            .collect();
        if subs.is_empty() {
            trace!("{conn:?} unhandled notification for {hdl}");
        }
        for s in subs {
            if (s.f)(conn, Some(v)) == Iter::Stop {
                if let Err(e) = self.unsubscribe(conn, &s) {
                    warn!("{conn:?} unsubscribe from {hdl} failed: {e}");
                }
            }
        }
    }

    /// Rewrites the CCC descriptors of remaining subscriptions after a
    /// reconnection.
    pub(super) fn connected(&self, conn: &Conn) {
        let mut cccs: Vec<(Handle, Cccd)> = Vec::new();
        for e in self.0.subs.lock().iter().filter(|e| e.is_peer(conn)) {
            match cccs.iter_mut().find(|(h, _)| *h == e.s.ccc) {
                Some((_, v)) => *v = (*v).max(e.s.cccd),
                None => cccs.push((e.s.ccc, e.s.cccd)),
            }
        }
        for (hdl, v) in cccs {
            debug!("{conn:?} restoring CCC {hdl} = {v:?}");
            let cb: WriteCallback = Box::new(move |c: &Conn, r: att::Result<()>| {
                if let Err(e) = r {
                    warn!("{c:?} failed to restore CCC {hdl}: {e}");
                }
            });
            if let Err(e) = self.write_ccc(conn, hdl, v, cb) {
                warn!("{conn:?} failed to restore CCC {hdl}: {e}");
            }
        }
    }

    /// Removes the subscriptions of an unbonded peer and all volatile
    /// subscriptions.
    pub(super) fn disconnected(&self, conn: &Conn, bonded: bool) {
        let mut gone = Vec::new();
        self.0.subs.lock().retain(|e| {
            let keep = !e.is_peer(conn) || (bonded && !e.s.volatile);
            if !keep {
                gone.push(Arc::clone(&e.s));
            }
            keep
        });
        for s in gone {
            (s.f)(conn, None);
        }
    }

    /// Returns the number of subscriptions for the peer of `conn`.
    #[must_use]
    pub fn subscriptions(&self, conn: &Conn) -> usize {
        (self.0.subs.lock().iter()).filter(|e| e.is_peer(conn)).count()
    }

    fn remove(&self, conn: &Conn, s: &Arc<Subscription>) -> bool {
        let mut subs = self.0.subs.lock();
        let Some(i) = (subs.iter()).position(|e| e.is_peer(conn) && Arc::ptr_eq(&e.s, s)) else {
            return false;
        };
        subs.remove(i);
        true
    }

    fn write_ccc(&self, conn: &Conn, hdl: Handle, v: Cccd, cb: WriteCallback) -> Result<()> {
        let pdu = att::pdu(Opcode::WriteReq, |p| {
            p.u16(hdl).u16(v.bits());
        });
        let cb: att::RspCallback = Box::new(move |c: &Conn, r: att::Result<&[u8]>| cb(c, r.map(|_| ())));
        Ok(self.0.att.request(conn, pdu, cb)?)
    }
}

impl Debug for Client {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("mtu", &self.0.mtu)
            .field("subs", &self.0.subs.lock().len())
            .finish_non_exhaustive()
    }
}

/// Discovery procedures.
impl Client {
    fn disc_send(&self, conn: &Conn, d: &Arc<Mutex<Discovery>>) -> att::Result<()> {
        let pdu = {
            let mut d = d.lock();
            debug_assert_ne!(d.st, DiscoverState::Done);
            d.st = DiscoverState::AwaitingResponse;
            d.pdu()
        };
        let (this, d2) = (self.clone(), Arc::clone(d));
        let cb: att::RspCallback = Box::new(move |c: &Conn, r: att::Result<&[u8]>| this.disc_rsp(c, &d2, r));
        self.0.att.request(conn, pdu, cb)
    }

    fn disc_rsp(&self, conn: &Conn, d: &Arc<Mutex<Discovery>>, r: att::Result<&[u8]>) {
        let mut g = d.lock();
        debug_assert_eq!(g.st, DiscoverState::AwaitingResponse);
        let p = match r {
            Ok(p) if !p.is_empty() => p,
            Ok(_) => return g.done(conn),
            Err(e) => {
                trace!("{conn:?} {:?} discovery ended: {e}", g.typ);
                return g.done(conn);
            }
        };
        let last = match g.parse(conn, p) {
            Step::Next(last) => last,
            Step::Stop => {
                g.st = DiscoverState::Done;
                return;
            }
            Step::Done => return g.done(conn),
            Step::Include(hdl, range) => {
                drop(g);
                return self.include_read(conn, d, hdl, range);
            }
        };
        self.disc_next(conn, g, d, last);
    }

    /// Reads the 128-bit UUID of an included service.
    fn include_read(&self, conn: &Conn, d: &Arc<Mutex<Discovery>>, hdl: Handle, range: HandleRange) {
        let pdu = att::pdu(Opcode::ReadReq, |p| {
            p.u16(range.start());
        });
        let (this, d2) = (self.clone(), Arc::clone(d));
        let cb: att::RspCallback = Box::new(move |c: &Conn, r: att::Result<&[u8]>| {
            let mut g = d2.lock();
            let uuid = match r {
                Ok(p) if p.len() == Uuid::BYTES => Uuid::try_from(p).ok(),
                _ => None,
            };
            let Some(uuid) = uuid else {
                warn!("{c:?} unable to read included service UUID at {}", range.start());
                return g.done(c);
            };
            if g.deliver(c, Found::Include { hdl, range, uuid }) == Iter::Stop {
                g.st = DiscoverState::Done;
                return;
            }
            this.disc_next(c, g, &d2, hdl);
        });
        if let Err(e) = self.0.att.request(conn, pdu, cb) {
            warn!("{conn:?} include UUID request failed: {e}");
            d.lock().done(conn);
        }
    }

    /// Continues discovery after `last` or completes it.
    fn disc_next(
        &self,
        conn: &Conn,
        mut g: parking_lot::MutexGuard<Discovery>,
        d: &Arc<Mutex<Discovery>>,
        last: Handle,
    ) {
        if !g.next(last) {
            return g.done(conn);
        }
        g.st = DiscoverState::Continuing;
        drop(g);
        if let Err(e) = self.disc_send(conn, d) {
            warn!("{conn:?} discovery request failed: {e}");
            d.lock().done(conn);
        }
    }
}

/// Long read and write procedures.
impl Client {
    #[allow(clippy::cast_possible_truncation)]
    fn read_send(&self, conn: &Conn, r: &Arc<Mutex<LongRead>>) -> att::Result<()> {
        let pdu = {
            let r = r.lock();
            if r.buf.is_empty() {
                att::pdu(Opcode::ReadReq, |p| {
                    p.u16(r.hdl);
                })
            } else {
                att::pdu(Opcode::ReadBlobReq, |p| {
                    p.u16(r.hdl).u16(r.buf.len() as u16);
                })
            }
        };
        let (this, r2) = (self.clone(), Arc::clone(r));
        let cb: att::RspCallback = Box::new(move |c: &Conn, res: att::Result<&[u8]>| {
            let mut g = r2.lock();
            let full = usize::from(this.0.att.mtu(c)) - 1;
            let res = match res {
                Ok(p) => {
                    g.buf.extend_from_slice(p);
                    if p.len() == full && g.buf.len() < MAX_VAL_LEN {
                        drop(g);
                        if let Err(e) = this.read_send(c, &r2) {
                            r2.lock().finish(c, Err(e));
                        }
                        return;
                    }
                    Ok(())
                }
                // Value length was a multiple of ATT_MTU-1
                Err(att::Error::Att(e))
                    if !g.buf.is_empty()
                        && matches!(e.err(), ErrorCode::AttributeNotLong | ErrorCode::InvalidOffset) =>
                {
                    Ok(())
                }
                Err(e) => Err(e),
            };
            g.finish(c, res);
        });
        self.0.att.request(conn, pdu, cb)
    }

    fn write_send(&self, conn: &Conn, w: &Arc<Mutex<LongWrite>>) -> att::Result<()> {
        let (pdu, n) = {
            let w = w.lock();
            if w.off < w.data.len() {
                let chunk = &w.data[w.off..(w.off + w.chunk).min(w.data.len())];
                #[allow(clippy::cast_possible_truncation)]
                let pdu = att::pdu(Opcode::PrepareWriteReq, |p| {
                    p.u16(w.hdl).u16(w.off as u16).put(chunk);
                });
                (pdu, chunk.len())
            } else {
                (att::pdu(Opcode::ExecuteWriteReq, |p| {
                    p.u8(0x01);
                }), 0)
            }
        };
        let (this, w2) = (self.clone(), Arc::clone(w));
        let cb: att::RspCallback = Box::new(move |c: &Conn, r: att::Result<&[u8]>| {
            if let Err(e) = r {
                return w2.lock().finish(c, Err(e));
            }
            if n == 0 {
                return w2.lock().finish(c, Ok(()));
            }
            w2.lock().off += n;
            if let Err(e) = this.write_send(c, &w2) {
                w2.lock().finish(c, Err(e));
            }
        });
        self.0.att.request(conn, pdu, cb)
    }
}

/// Discovery procedure state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DiscoverState {
    NotStarted,
    AwaitingResponse,
    Continuing,
    Done,
}

/// Result of parsing one discovery response.
enum Step {
    /// Continue after the handle.
    Next(Handle),
    /// Callback requested stop.
    Stop,
    /// Discovery is complete or the response was invalid.
    Done,
    /// Included service UUID must be read before delivery.
    Include(Handle, HandleRange),
}

struct Discovery {
    typ: Discover,
    uuid: Option<Uuid>,
    start: Handle,
    end: Handle,
    st: DiscoverState,
    cb: DiscoverCallback,
}

impl Discovery {
    /// Returns the request PDU for the current start handle.
    fn pdu(&self) -> Vec<u8> {
        let (s, e) = (self.start, self.end);
        let by_type = |typ: Uuid16| {
            att::pdu(Opcode::ReadByTypeReq, |p| {
                p.u16(s).u16(e).u16(typ);
            })
        };
        match self.typ {
            Discover::Primary | Discover::Secondary => {
                let typ = if self.typ == Discover::Primary {
                    gap::PRIMARY_SERVICE
                } else {
                    gap::SECONDARY_SERVICE
                };
                match self.uuid {
                    Some(u) => att::pdu(Opcode::FindByTypeValueReq, |p| {
                        p.u16(s).u16(e).u16(typ).put(u.to_wire());
                    }),
                    None => att::pdu(Opcode::ReadByGroupTypeReq, |p| {
                        p.u16(s).u16(e).u16(typ);
                    }),
                }
            }
            Discover::Include => by_type(gap::INCLUDE),
            Discover::Characteristic => by_type(gap::CHARACTERISTIC),
            Discover::Descriptor => att::pdu(Opcode::FindInformationReq, |p| {
                p.u16(s).u16(e);
            }),
        }
    }

    /// Parses a response and delivers its entries.
    fn parse(&mut self, conn: &Conn, p: &[u8]) -> Step {
        let (n, p) = match self.typ {
            Discover::Primary | Discover::Secondary if self.uuid.is_some() => (4, p),
            _ => (usize::from(p[0]), &p[1..]),
        };
        let valid = match self.typ {
            Discover::Primary | Discover::Secondary if self.uuid.is_some() => true,
            Discover::Primary | Discover::Secondary => matches!(n, 6 | 20),
            Discover::Include => matches!(n, 6 | 8),
            Discover::Characteristic => matches!(n, 7 | 21),
            // Find Information format
            Discover::Descriptor => matches!(n, 1 | 2),
        };
        if !valid {
            warn!("{conn:?} invalid {:?} discovery response", self.typ);
            return Step::Done;
        }
        let n = match self.typ {
            Discover::Descriptor if n == 1 => 2 + 2,
            Discover::Descriptor => 2 + 16,
            _ => n,
        };
        if p.is_empty() || p.len() % n != 0 {
            warn!("{conn:?} invalid {:?} discovery response length", self.typ);
            return Step::Done;
        }
        let mut last = None;
        for e in p.chunks_exact(n) {
            let mut u = e.unpack();
            let Some(hdl) = Handle::new(u.u16()) else {
                return Step::Done;
            };
            let f = match self.typ {
                Discover::Primary | Discover::Secondary => {
                    let Some(end) = Handle::new(u.u16()) else {
                        return Step::Done;
                    };
                    let uuid = match self.uuid {
                        Some(u) => Some(u),
                        None => Uuid::try_from(&e[4..]).ok(),
                    };
                    uuid.map(|uuid| (Found::Service { hdl, end, uuid }, end))
                }
                Discover::Include => {
                    let Some(range) = HandleRange::from_raw(u.u16(), u.u16()) else {
                        return Step::Done;
                    };
                    if n == 6 {
                        return Step::Include(hdl, range);
                    }
                    let uuid = Uuid16::new(u.u16()).map(Uuid16::as_uuid);
                    uuid.map(|uuid| (Found::Include { hdl, range, uuid }, hdl))
                }
                Discover::Characteristic => {
                    let props = CharProps::from_bits_retain(u.u8());
                    let Some(value) = Handle::new(u.u16()) else {
                        return Step::Done;
                    };
                    let uuid = Uuid::try_from(&e[5..]).ok();
                    uuid.map(|uuid| (Found::Characteristic { hdl, props, value, uuid }, hdl))
                }
                Discover::Descriptor => {
                    let uuid = Uuid::try_from(&e[2..]).ok();
                    uuid.map(|uuid| (Found::Descriptor { hdl, uuid }, hdl))
                }
            };
            let Some((f, end)) = f else {
                return Step::Done;
            };
            if self.deliver(conn, f) == Iter::Stop {
                return Step::Stop;
            }
            last = Some(end);
        }
        last.map_or(Step::Done, Step::Next)
    }

    /// Delivers a found attribute unless it is filtered out by UUID.
    fn deliver(&mut self, conn: &Conn, f: Found) -> Iter {
        if self.uuid.map_or(false, |u| u != f.uuid()) {
            return Iter::Continue;
        }
        (self.cb)(conn, Some(&f))
    }

    /// Advances the start handle past `last`. Returns `false` if the range is
    /// exhausted.
    fn next(&mut self, last: Handle) -> bool {
        match last.next() {
            Some(start) if start <= self.end => {
                self.start = start;
                true
            }
            _ => false,
        }
    }

    /// Completes discovery.
    fn done(&mut self, conn: &Conn) {
        self.st = DiscoverState::Done;
        (self.cb)(conn, None);
    }
}

struct LongRead {
    hdl: Handle,
    buf: Vec<u8>,
    cb: Option<ReadCallback>,
}

impl LongRead {
    fn finish(&mut self, conn: &Conn, r: att::Result<()>) {
        if let Some(cb) = self.cb.take() {
            cb(conn, r.map(|()| std::mem::take(&mut self.buf)));
        }
    }
}

struct LongWrite {
    hdl: Handle,
    data: Vec<u8>,
    off: usize,
    chunk: usize,
    cb: Option<WriteCallback>,
}

impl LongWrite {
    fn finish(&mut self, conn: &Conn, r: att::Result<()>) {
        if let Some(cb) = self.cb.take() {
            cb(conn, r);
        }
    }
}
