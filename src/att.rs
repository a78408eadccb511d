//! Attribute Protocol ([Vol 3] Part F).
//!
//! Each LE connection has one ATT bearer on the fixed channel [`ATT_CID`]. A
//! bearer allows one outstanding request and one outstanding indication
//! ([Vol 3] Part F, Section 3.3.2). Further transactions wait in FIFO order
//! until the previous one completes.

use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use structbuf::{Pack, Packer, StructBuf, Unpack};
use tracing::{debug, error, trace, warn};

pub use {consts::*, handle::*, perm::*};

use crate::conn::{self, Conn, TxCallback};
use crate::util::{DelayedWork, WorkQueue};

mod consts;
mod handle;
mod perm;

#[cfg(test)]
mod tests;

/// ATT fixed channel ID ([Vol 3] Part A, Section 2.1).
pub const ATT_CID: u16 = 0x0004;

/// Default LE ATT_MTU ([Vol 3] Part F, Section 3.2.8).
pub const DEFAULT_MTU: u16 = 23;

/// Largest ATT_MTU supported by this host.
pub const MAX_MTU: u16 = 517;

/// Maximum attribute value length ([Vol 3] Part F, Section 3.2.9).
pub const MAX_VAL_LEN: usize = 512;

/// Transaction timeout ([Vol 3] Part F, Section 3.3.3).
pub const TIMEOUT: Duration = Duration::from_secs(30);

/// Error type returned by the ATT layer.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Conn(#[from] conn::Error),
    #[error(transparent)]
    Att(#[from] ErrorRsp),
    #[error("invalid ATT PDU")]
    InvalidPdu,
    #[error("PDU exceeds ATT_MTU ({0})")]
    MtuExceeded(u16),
    #[error("timeout while waiting for {0} response")]
    Timeout(Opcode),
}

/// Common ATT result type.
pub type Result<T> = std::result::Result<T, Error>;

/// PDU response result.
pub type RspResult<T> = std::result::Result<T, ErrorRsp>;

/// Response callback. Receives the response parameters without the opcode.
pub type RspCallback = Box<dyn FnOnce(&Conn, Result<&[u8]>) + Send>;

/// Indication confirmation callback.
pub type CfmCallback = Box<dyn FnOnce(&Conn, Result<()>) + Send>;

/// `ATT_ERROR_RSP` PDU ([Vol 3] Part F, Section 3.4.1.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("ATT {req:#04X}{} failed with {err}", .hdl.map_or(String::new(), |h| format!(" for handle {:#06X}", u16::from(h))))]
pub struct ErrorRsp {
    req: u8,
    hdl: Option<Handle>,
    err: ErrorCode,
}

impl ErrorRsp {
    /// Creates a new error response.
    #[inline(always)]
    #[must_use]
    pub const fn new(req: u8, hdl: Option<Handle>, err: ErrorCode) -> Self {
        Self { req, hdl, err }
    }

    /// Returns the raw request opcode.
    #[inline(always)]
    #[must_use]
    pub const fn req(&self) -> u8 {
        self.req
    }

    /// Returns the handle that caused the error.
    #[inline(always)]
    #[must_use]
    pub const fn hdl(&self) -> Option<Handle> {
        self.hdl
    }

    /// Returns the error code.
    #[inline(always)]
    #[must_use]
    pub const fn err(&self) -> ErrorCode {
        self.err
    }

    /// Decodes `ATT_ERROR_RSP` parameters.
    fn unpack(params: &[u8]) -> Option<Self> {
        if params.len() != 4 {
            return None;
        }
        let mut p = params.unpack();
        Some(Self {
            req: p.u8(),
            hdl: Handle::new(p.u16()),
            err: ErrorCode::try_from(p.u8()).unwrap_or(ErrorCode::UnlikelyError),
        })
    }
}

/// Returns an outbound PDU, calling `f` to encode it after writing the
/// opcode.
#[must_use]
pub fn pdu(op: Opcode, f: impl FnOnce(&mut Packer)) -> Vec<u8> {
    let mut b = StructBuf::new(usize::from(MAX_MTU));
    f(b.append().u8(op));
    b.as_ref().to_vec()
}

struct Req {
    op: Opcode,
    pdu: Vec<u8>,
    cb: RspCallback,
}

struct Ind {
    pdu: Vec<u8>,
    cb: CfmCallback,
}

/// Completion to invoke after the bearer lock is released.
type Deferred = Box<dyn FnOnce(&Conn)>;

/// ATT bearer ([Vol 3] Part F, Section 3.2.11).
struct Bearer {
    conn: Conn,
    mtu: u16,
    /// Transaction timed out and the bearer may not be used
    /// ([Vol 3] Part F, Section 3.3.3).
    closed: bool,
    req: Option<Req>,
    reqs: VecDeque<Req>,
    ind: Option<Ind>,
    inds: VecDeque<Ind>,
    req_timer: DelayedWork,
    ind_timer: DelayedWork,
}

impl Bearer {
    /// Removes all outstanding and queued transactions.
    fn drain(&mut self, e: Error) -> Vec<Deferred> {
        self.req_timer.cancel();
        self.ind_timer.cancel();
        let mut v: Vec<Deferred> = Vec::new();
        for r in self.req.take().into_iter().chain(self.reqs.drain(..)) {
            v.push(Box::new(move |c: &Conn| (r.cb)(c, Err(e))));
        }
        for i in self.ind.take().into_iter().chain(self.inds.drain(..)) {
            v.push(Box::new(move |c: &Conn| (i.cb)(c, Err(e))));
        }
        v
    }
}

struct Inner {
    bearers: Mutex<HashMap<usize, Bearer>>,
    wq: WorkQueue,
    timeout: Duration,
}

/// ATT bearers of all connections.
#[derive(Clone)]
pub struct Att(Arc<Inner>);

impl Att {
    /// Creates an empty bearer table.
    pub(crate) fn new(wq: WorkQueue, timeout: Duration) -> Self {
        Self(Arc::new(Inner {
            bearers: Mutex::default(),
            wq,
            timeout,
        }))
    }

    /// Creates the bearer for a new connection.
    pub(crate) fn connected(&self, conn: &Conn) {
        debug!("{conn:?} ATT bearer created");
        let br = Bearer {
            conn: conn.clone(),
            mtu: DEFAULT_MTU,
            closed: false,
            req: None,
            reqs: VecDeque::new(),
            ind: None,
            inds: VecDeque::new(),
            req_timer: DelayedWork::default(),
            ind_timer: DelayedWork::default(),
        };
        self.0.bearers.lock().insert(conn.index(), br);
    }

    /// Removes the bearer of a terminated connection, failing all of its
    /// transactions.
    pub(crate) fn disconnected(&self, conn: &Conn) {
        let Some(mut br) = self.0.bearers.lock().remove(&conn.index()) else {
            return;
        };
        debug!("{conn:?} ATT bearer removed");
        for f in br.drain(Error::Conn(conn::Error::NotConnected)) {
            f(conn);
        }
    }

    /// Returns the current ATT_MTU of the connection.
    #[must_use]
    pub fn mtu(&self, conn: &Conn) -> u16 {
        (self.0.bearers.lock().get(&conn.index())).map_or(DEFAULT_MTU, |b| b.mtu)
    }

    /// Sets the ATT_MTU after an exchange.
    pub(crate) fn set_mtu(&self, conn: &Conn, mtu: u16) {
        if let Some(b) = self.0.bearers.lock().get_mut(&conn.index()) {
            b.mtu = mtu.clamp(DEFAULT_MTU, MAX_MTU);
            debug!("{conn:?} ATT_MTU={}", b.mtu);
        }
    }

    /// Sends a request PDU. The callback receives the response or the error
    /// that ended the transaction. The callback is not called if this method
    /// returns an error.
    pub fn request(&self, conn: &Conn, pdu: Vec<u8>, cb: RspCallback) -> Result<()> {
        let op = (pdu.first().and_then(|&op| Opcode::try_from(op).ok()))
            .filter(|op| op.typ() == PduType::Req)
            .ok_or(Error::InvalidPdu)?;
        let mut bs = self.0.bearers.lock();
        let b = Self::usable(&mut bs, conn, op, pdu.len())?;
        let r = Req { op, pdu, cb };
        if b.req.is_some() {
            trace!("{conn:?} queued {op}");
            b.reqs.push_back(r);
            return Ok(());
        }
        self.start_req(b, r).map_err(|(_, e)| e)
    }

    /// Sends an indication PDU. The callback receives the result of the
    /// confirmation. The callback is not called if this method returns an
    /// error.
    pub fn indicate(&self, conn: &Conn, pdu: Vec<u8>, cb: CfmCallback) -> Result<()> {
        if pdu.first() != Some(&u8::from(Opcode::HandleValueInd)) {
            return Err(Error::InvalidPdu);
        }
        let mut bs = self.0.bearers.lock();
        let b = Self::usable(&mut bs, conn, Opcode::HandleValueInd, pdu.len())?;
        let i = Ind { pdu, cb };
        if b.ind.is_some() {
            b.inds.push_back(i);
            return Ok(());
        }
        self.start_ind(b, i).map_err(|(_, e)| e)
    }

    /// Sends a PDU that does not start a transaction: a command,
    /// notification, response, or confirmation.
    pub fn send(&self, conn: &Conn, pdu: &[u8], cb: Option<TxCallback>) -> Result<()> {
        let mtu = {
            let bs = self.0.bearers.lock();
            let b = (bs.get(&conn.index())).ok_or(Error::Conn(conn::Error::NotConnected))?;
            b.mtu
        };
        if pdu.len() > usize::from(mtu) {
            return Err(Error::MtuExceeded(mtu));
        }
        Ok(conn.send_l2cap(ATT_CID, pdu, cb)?)
    }

    /// Sends an `ATT_ERROR_RSP` PDU in response to a request that cannot be
    /// performed ([Vol 3] Part F, Section 3.4.1.1). Command-related errors are
    /// ignored.
    pub(crate) fn error_rsp(&self, conn: &Conn, e: ErrorRsp) {
        warn!("{conn:?} ATT request {:#04X} for {:?} failed with {}", e.req, e.hdl, e.err);
        if Opcode::is_cmd(e.req) {
            return;
        }
        let rsp = pdu(Opcode::ErrorRsp, |p| {
            p.u8(e.req).u16(e.hdl.map_or(0, u16::from)).u8(e.err);
        });
        if let Err(e) = self.send(conn, &rsp, None) {
            warn!("{conn:?} failed to send ATT_ERROR_RSP: {e}");
        }
    }

    /// Processes a received ATT PDU. Responses and confirmations complete
    /// the matching transaction. Other valid PDUs are returned to the caller
    /// for dispatch.
    pub(crate) fn recv(&self, conn: &Conn, pdu: &[u8]) -> Option<Opcode> {
        // [Vol 3] Part F, Section 3.3
        let Some(&raw) = pdu.first() else {
            warn!("{conn:?} empty ATT PDU");
            self.error_rsp(conn, ErrorRsp::new(0, None, ErrorCode::InvalidPdu));
            return None;
        };
        let Ok(op) = Opcode::try_from(raw) else {
            warn!("{conn:?} unknown ATT opcode: {raw:#04X}");
            self.error_rsp(conn, ErrorRsp::new(raw, None, ErrorCode::RequestNotSupported));
            return None;
        };
        match op.typ() {
            PduType::Rsp => {
                self.handle_rsp(conn, op, pdu);
                None
            }
            PduType::Cfm => {
                self.handle_cfm(conn);
                None
            }
            PduType::Req | PduType::Cmd | PduType::Ntf | PduType::Ind => Some(op),
        }
    }

    /// Returns the bearer if it can accept a new transaction.
    fn usable<'a>(
        bs: &'a mut HashMap<usize, Bearer>,
        conn: &Conn,
        op: Opcode,
        n: usize,
    ) -> Result<&'a mut Bearer> {
        let b = (bs.get_mut(&conn.index())).ok_or(Error::Conn(conn::Error::NotConnected))?;
        if b.closed {
            return Err(Error::Timeout(op));
        }
        if n > usize::from(b.mtu) {
            return Err(Error::MtuExceeded(b.mtu));
        }
        Ok(b)
    }

    /// Sends a request and arms the transaction timer.
    fn start_req(&self, b: &mut Bearer, r: Req) -> std::result::Result<(), (Req, Error)> {
        if let Err(e) = b.conn.send_l2cap(ATT_CID, &r.pdu, None) {
            return Err((r, e.into()));
        }
        trace!("{:?} sent {}", b.conn, r.op);
        self.arm(b, false);
        b.req = Some(r);
        Ok(())
    }

    /// Sends an indication and arms the transaction timer.
    fn start_ind(&self, b: &mut Bearer, i: Ind) -> std::result::Result<(), (Ind, Error)> {
        if let Err(e) = b.conn.send_l2cap(ATT_CID, &i.pdu, None) {
            return Err((i, e.into()));
        }
        self.arm(b, true);
        b.ind = Some(i);
        Ok(())
    }

    /// Starts the next queued request, failing any that cannot be sent.
    fn next_req(&self, b: &mut Bearer) -> Vec<Deferred> {
        let mut failed: Vec<Deferred> = Vec::new();
        while let Some(r) = b.reqs.pop_front() {
            match self.start_req(b, r) {
                Ok(()) => break,
                Err((r, e)) => failed.push(Box::new(move |c: &Conn| (r.cb)(c, Err(e)))),
            }
        }
        failed
    }

    /// Starts the next queued indication, failing any that cannot be sent.
    fn next_ind(&self, b: &mut Bearer) -> Vec<Deferred> {
        let mut failed: Vec<Deferred> = Vec::new();
        while let Some(i) = b.inds.pop_front() {
            match self.start_ind(b, i) {
                Ok(()) => break,
                Err((i, e)) => failed.push(Box::new(move |c: &Conn| (i.cb)(c, Err(e)))),
            }
        }
        failed
    }

    fn arm(&self, b: &Bearer, ind: bool) {
        let (w, idx) = (Arc::downgrade(&self.0), b.conn.index());
        let t = if ind { &b.ind_timer } else { &b.req_timer };
        t.schedule(&self.0.wq, self.0.timeout, move || {
            if let Some(inner) = Weak::upgrade(&w) {
                Self(inner).timeout(idx, ind);
            }
        });
    }

    /// Handles an expired transaction timer.
    fn timeout(&self, idx: usize, ind: bool) {
        let (conn, failed) = {
            let mut bs = self.0.bearers.lock();
            let Some(b) = bs.get_mut(&idx) else {
                return;
            };
            let op = if ind {
                b.ind.as_ref().map(|_| Opcode::HandleValueInd)
            } else {
                b.req.as_ref().map(|r| r.op)
            };
            let Some(op) = op else {
                return;
            };
            error!("{:?} ATT transaction timeout for {op}", b.conn);
            b.closed = true;
            (b.conn.clone(), b.drain(Error::Timeout(op)))
        };
        for f in failed {
            f(&conn);
        }
    }

    fn handle_rsp(&self, conn: &Conn, op: Opcode, pdu: &[u8]) {
        let (req, failed) = {
            let mut bs = self.0.bearers.lock();
            let Some(b) = bs.get_mut(&conn.index()) else {
                return;
            };
            let Some(want) = b.req.as_ref().map(|r| r.op) else {
                warn!("{conn:?} unexpected ATT response: {op}");
                return;
            };
            let matched = if op == Opcode::ErrorRsp {
                pdu.get(1) == Some(&u8::from(want))
            } else {
                want.rsp() == Some(op)
            };
            if !matched {
                warn!("{conn:?} ATT response {op} does not match {want}");
                return;
            }
            b.req_timer.cancel();
            let Some(req) = b.req.take() else {
                return;
            };
            // Next request goes out before the callback can queue another
            (req, self.next_req(b))
        };
        let params = &pdu[1..];
        let r = if op == Opcode::ErrorRsp {
            Err(ErrorRsp::unpack(params).map_or(Error::InvalidPdu, Error::Att))
        } else {
            Ok(params)
        };
        trace!("{conn:?} {} complete: {}", req.op, if r.is_ok() { "ok" } else { "error" });
        (req.cb)(conn, r);
        for f in failed {
            f(conn);
        }
    }

    fn handle_cfm(&self, conn: &Conn) {
        let (ind, failed) = {
            let mut bs = self.0.bearers.lock();
            let Some(b) = bs.get_mut(&conn.index()) else {
                return;
            };
            b.ind_timer.cancel();
            let Some(ind) = b.ind.take() else {
                warn!("{conn:?} unexpected ATT_HANDLE_VALUE_CFM");
                return;
            };
            (ind, self.next_ind(b))
        };
        (ind.cb)(conn, Ok(()));
        for f in failed {
            f(conn);
        }
    }
}

impl Debug for Att {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Att")
            .field("bearers", &self.0.bearers.lock().len())
            .finish_non_exhaustive()
    }
}
