//! Server request handlers ([Vol 3] Part F, Section 3.4 and
//! [Vol 3] Part G, Section 4).

use structbuf::{Pack, Packer, StructBuf, Unpack};
use tracing::{trace, warn};

use crate::att::{ErrorCode, ErrorRsp, RspResult, DEFAULT_MTU};
use crate::gap::{self, Uuid16};

use super::*;

impl Gatt {
    /// Handles a request or command received from a client. Requests always
    /// get either a response or `ATT_ERROR_RSP`.
    pub(super) fn handle_req(&self, conn: &Conn, op: Opcode, p: &[u8]) {
        let mtu = self.0.att.mtu(conn);
        trace!("{conn:?} {op} {p:02X?}");
        let r = match op {
            Opcode::ExchangeMtuReq => self.exchange_mtu(conn, p),
            Opcode::FindInformationReq => self.find_information(p, mtu),
            Opcode::FindByTypeValueReq => self.find_by_type_value(conn, p, mtu),
            Opcode::ReadByTypeReq => self.read_by_type(conn, p, mtu),
            Opcode::ReadReq => self.read(conn, op, p, mtu),
            Opcode::ReadBlobReq => self.read(conn, op, p, mtu),
            Opcode::ReadMultipleReq => self.read_multiple(conn, p, mtu),
            Opcode::ReadByGroupTypeReq => self.read_by_group_type(conn, p, mtu),
            Opcode::WriteReq => (self.write(conn, op, p)).map(|()| vec![u8::from(Opcode::WriteRsp)]),
            Opcode::PrepareWriteReq => self.prepare_write(conn, p),
            Opcode::ExecuteWriteReq => self.execute_write(conn, p),
            Opcode::WriteCmd => {
                if let Err(e) = self.write(conn, op, p) {
                    trace!("{conn:?} ignored {op}: {e}");
                }
                return;
            }
            _ => op.err(ErrorCode::RequestNotSupported),
        };
        match r {
            Ok(rsp) => {
                if let Err(e) = self.0.att.send(conn, &rsp, None) {
                    warn!("{conn:?} failed to send {op} response: {e}");
                }
            }
            Err(e) => self.0.att.error_rsp(conn, e),
        }
    }

    /// Handles `ATT_EXCHANGE_MTU_REQ` ([Vol 3] Part F, Section 3.4.2.1).
    fn exchange_mtu(&self, conn: &Conn, p: &[u8]) -> RspResult<Vec<u8>> {
        let op = Opcode::ExchangeMtuReq;
        if p.len() != 2 {
            return op.err(ErrorCode::InvalidPdu);
        }
        let client = p.unpack().u16().max(DEFAULT_MTU);
        let server = self.0.cfg.att_mtu;
        let rsp = rsp(Opcode::ExchangeMtuRsp, DEFAULT_MTU, |p| {
            p.u16(server);
        });
        self.0.att.set_mtu(conn, client.min(server));
        Ok(rsp)
    }

    /// Handles `ATT_FIND_INFORMATION_REQ` ([Vol 3] Part F, Section 3.4.3.1).
    fn find_information(&self, p: &[u8], mtu: u16) -> RspResult<Vec<u8>> {
        let op = Opcode::FindInformationReq;
        if p.len() != 4 {
            return op.err(ErrorCode::InvalidPdu);
        }
        let r = handle_range(op, p)?;
        let view = self.0.db.read().view();
        let mut it = (view.attrs(r)).map(|(at, _)| (at.handle(), at.typ)).peekable();
        let Some(&(_, first)) = it.peek() else {
            return op.hdl_err(ErrorCode::AttributeNotFound, r.start());
        };
        let short = first.as_uuid16().is_some();
        let n = if short { 2 + 2 } else { 2 + 16 };
        Ok(rsp(Opcode::FindInformationRsp, mtu, |p| {
            p.u8(if short { 0x01 } else { 0x02 });
            for (h, u) in it.take_while(|(_, u)| u.as_uuid16().is_some() == short) {
                if p.remaining() < n {
                    break;
                }
                u.pack(p.u16(h));
            }
        }))
    }

    /// Handles `ATT_FIND_BY_TYPE_VALUE_REQ` ([Vol 3] Part F, Section 3.4.3.3).
    fn find_by_type_value(&self, conn: &Conn, p: &[u8], mtu: u16) -> RspResult<Vec<u8>> {
        let op = Opcode::FindByTypeValueReq;
        if p.len() < 6 {
            return op.err(ErrorCode::InvalidPdu);
        }
        let r = handle_range(op, p)?;
        let Some(typ) = Uuid16::new(u16::from_le_bytes([p[4], p[5]])) else {
            return op.hdl_err(ErrorCode::AttributeNotFound, r.start());
        };
        let val = &p[6..];
        let view = self.0.db.read().view();
        let found: Vec<(Handle, Handle)> = (view.attrs(r))
            .filter(|(at, _)| at.typ == typ)
            .filter(|(at, _)| at.read(conn).map_or(false, |v| v == val))
            .map(|(at, end)| (at.handle(), if at.is_service() { end } else { at.handle() }))
            .collect();
        if found.is_empty() {
            return op.hdl_err(ErrorCode::AttributeNotFound, r.start());
        }
        Ok(rsp(Opcode::FindByTypeValueRsp, mtu, |p| {
            for (h, end) in found.into_iter().take(p.remaining() / (2 + 2)) {
                p.u16(h).u16(end);
            }
        }))
    }

    /// Handles `ATT_READ_BY_TYPE_REQ` ([Vol 3] Part F, Section 3.4.4.1).
    fn read_by_type(&self, conn: &Conn, p: &[u8], mtu: u16) -> RspResult<Vec<u8>> {
        let op = Opcode::ReadByTypeReq;
        if p.len() != 4 + 2 && p.len() != 4 + 16 {
            return op.err(ErrorCode::InvalidPdu);
        }
        let r = handle_range(op, p)?;
        let Ok(typ) = Uuid::try_from(&p[4..]) else {
            return op.hdl_err(ErrorCode::AttributeNotFound, r.start());
        };
        let view = self.0.db.read().view();
        let vals = self.read_all(conn, op, (view.attrs(r)).filter(|(at, _)| at.typ == typ))?;
        if vals.is_empty() {
            return op.hdl_err(ErrorCode::AttributeNotFound, r.start());
        }
        let n = (vals[0].2.len())
            .min(usize::from(mtu).saturating_sub(4))
            .min(usize::from(u8::MAX) - 2);
        Ok(rsp(Opcode::ReadByTypeRsp, mtu, |p| {
            #[allow(clippy::cast_possible_truncation)]
            p.u8((2 + n) as u8);
            for (h, _, v) in vals.into_iter().take(p.remaining() / (2 + n)) {
                p.u16(h).put(&v[..n]);
            }
        }))
    }

    /// Handles `ATT_READ_REQ` and `ATT_READ_BLOB_REQ`
    /// ([Vol 3] Part F, Sections 3.4.4.3 and 3.4.4.5).
    fn read(&self, conn: &Conn, op: Opcode, p: &[u8], mtu: u16) -> RspResult<Vec<u8>> {
        let blob = op == Opcode::ReadBlobReq;
        if p.len() != if blob { 4 } else { 2 } {
            return op.err(ErrorCode::InvalidPdu);
        }
        let mut u = p.unpack();
        let Some(h) = Handle::new(u.u16()) else {
            return op.err(ErrorCode::InvalidHandle);
        };
        let off = if blob { usize::from(u.u16()) } else { 0 };
        let view = self.0.db.read().view();
        let Some(at) = view.find(h).and_then(<[Attr]>::first) else {
            return op.hdl_err(ErrorCode::InvalidHandle, h);
        };
        let v = match at.perms.test_read(conn.security()).and_then(|()| at.read(conn)) {
            Ok(v) => v,
            Err(e) => return op.hdl_err(e, h),
        };
        if off > v.len() {
            return op.hdl_err(ErrorCode::InvalidOffset, h);
        }
        let v = &v[off..];
        let n = v.len().min(usize::from(mtu).saturating_sub(1));
        let rsp_op = if blob { Opcode::ReadBlobRsp } else { Opcode::ReadRsp };
        Ok(rsp(rsp_op, mtu, |p| {
            p.put(&v[..n]);
        }))
    }

    /// Handles `ATT_READ_MULTIPLE_REQ` ([Vol 3] Part F, Section 3.4.4.7). The
    /// first handle that cannot be read fails the whole request.
    fn read_multiple(&self, conn: &Conn, p: &[u8], mtu: u16) -> RspResult<Vec<u8>> {
        let op = Opcode::ReadMultipleReq;
        if p.len() < 4 || p.len() % 2 != 0 {
            return op.err(ErrorCode::InvalidPdu);
        }
        let sec = conn.security();
        let view = self.0.db.read().view();
        let mut vals = Vec::with_capacity(usize::from(mtu));
        for raw in p.chunks_exact(2).map(|b| u16::from_le_bytes([b[0], b[1]])) {
            let Some(h) = Handle::new(raw) else {
                return op.err(ErrorCode::InvalidHandle);
            };
            let Some(at) = view.find(h).and_then(<[Attr]>::first) else {
                return op.hdl_err(ErrorCode::InvalidHandle, h);
            };
            match at.perms.test_read(sec).and_then(|()| at.read(conn)) {
                Ok(v) => vals.extend_from_slice(&v),
                Err(e) => return op.hdl_err(e, h),
            }
        }
        vals.truncate(usize::from(mtu).saturating_sub(1));
        Ok(rsp(Opcode::ReadMultipleRsp, mtu, |p| {
            p.put(&vals);
        }))
    }

    /// Handles `ATT_READ_BY_GROUP_TYPE_REQ` ([Vol 3] Part F, Section 3.4.4.9).
    fn read_by_group_type(&self, conn: &Conn, p: &[u8], mtu: u16) -> RspResult<Vec<u8>> {
        let op = Opcode::ReadByGroupTypeReq;
        if p.len() != 4 + 2 && p.len() != 4 + 16 {
            return op.err(ErrorCode::InvalidPdu);
        }
        let r = handle_range(op, p)?;
        let typ = Uuid::try_from(&p[4..]).ok();
        let Some(typ) = typ.filter(|&t| t == gap::PRIMARY_SERVICE || t == gap::SECONDARY_SERVICE) else {
            return op.hdl_err(ErrorCode::UnsupportedGroupType, r.start());
        };
        let view = self.0.db.read().view();
        let vals = self.read_all(conn, op, (view.attrs(r)).filter(|(at, _)| at.typ == typ))?;
        if vals.is_empty() {
            return op.hdl_err(ErrorCode::AttributeNotFound, r.start());
        }
        let n = (vals[0].2.len())
            .min(usize::from(mtu).saturating_sub(6))
            .min(usize::from(u8::MAX) - 4);
        Ok(rsp(Opcode::ReadByGroupTypeRsp, mtu, |p| {
            #[allow(clippy::cast_possible_truncation)]
            p.u8((4 + n) as u8);
            for (h, end, v) in vals.into_iter().take(p.remaining() / (4 + n)) {
                p.u16(h).u16(end).put(&v[..n]);
            }
        }))
    }

    /// Reads attribute values for a response containing a list of values
    /// with equal lengths. A permission error is returned only if it occurs
    /// for the first attribute. Otherwise, the list ends before the failing
    /// attribute or the first value of a different length.
    fn read_all<'a>(
        &self,
        conn: &Conn,
        op: Opcode,
        it: impl Iterator<Item = (&'a Attr, Handle)>,
    ) -> RspResult<Vec<(Handle, Handle, Vec<u8>)>> {
        let sec = conn.security();
        let mut vals: Vec<(Handle, Handle, Vec<u8>)> = Vec::new();
        for (at, end) in it {
            let v = match at.perms.test_read(sec).and_then(|()| at.read(conn)) {
                Ok(v) => v,
                Err(e) if vals.is_empty() => return op.hdl_err(e, at.handle()),
                Err(_) => break,
            };
            if vals.first().map_or(false, |f| f.2.len() != v.len()) {
                break;
            }
            vals.push((at.handle(), end, v));
        }
        Ok(vals)
    }

    /// Handles `ATT_WRITE_REQ` and `ATT_WRITE_CMD`
    /// ([Vol 3] Part F, Sections 3.4.5.1 and 3.4.5.3).
    fn write(&self, conn: &Conn, op: Opcode, p: &[u8]) -> RspResult<()> {
        if p.len() < 2 {
            return op.err(ErrorCode::InvalidPdu);
        }
        let Some(h) = Handle::new(p.unpack().u16()) else {
            return op.err(ErrorCode::InvalidHandle);
        };
        self.write_at(conn, h, 0, &p[2..]).or_else(|e| op.hdl_err(e, h))
    }

    /// Handles `ATT_PREPARE_WRITE_REQ` ([Vol 3] Part F, Section 3.4.6.1).
    /// Permissions are checked when the value is queued. The response echoes
    /// the request.
    fn prepare_write(&self, conn: &Conn, p: &[u8]) -> RspResult<Vec<u8>> {
        let op = Opcode::PrepareWriteReq;
        let max = self.0.cfg.prepare_max;
        if max == 0 {
            return op.err(ErrorCode::RequestNotSupported);
        }
        if p.len() < 4 {
            return op.err(ErrorCode::InvalidPdu);
        }
        let mut u = p.unpack();
        let Some(h) = Handle::new(u.u16()) else {
            return op.err(ErrorCode::InvalidHandle);
        };
        let off = usize::from(u.u16());
        let v = &p[4..];
        {
            let view = self.0.db.read().view();
            let Some(at) = view.find(h).and_then(<[Attr]>::first) else {
                return op.hdl_err(ErrorCode::InvalidHandle, h);
            };
            if let Err(e) = at.perms.test_write(conn.security()) {
                return op.hdl_err(e, h);
            }
            if !matches!(at.kind, Kind::Value(_) | Kind::Ccc(_)) {
                return op.hdl_err(ErrorCode::WriteNotPermitted, h);
            }
        }
        if off > att::MAX_VAL_LEN {
            return op.hdl_err(ErrorCode::InvalidOffset, h);
        }
        {
            let mut all = self.0.prepared.lock();
            let q = all.entry(conn.index()).or_default();
            if q.len() >= max {
                return op.hdl_err(ErrorCode::PrepareQueueFull, h);
            }
            q.push(Prepared {
                hdl: h,
                off,
                val: v.to_vec(),
            });
        }
        trace!("{conn:?} queued {} byte(s) for {h} at {off}", v.len());
        let mut rsp = Vec::with_capacity(1 + p.len());
        rsp.push(u8::from(Opcode::PrepareWriteRsp));
        rsp.extend_from_slice(p);
        Ok(rsp)
    }

    /// Handles `ATT_EXECUTE_WRITE_REQ` ([Vol 3] Part F, Section 3.4.6.3).
    /// Queued values are written in order until one fails. The queue is
    /// always emptied.
    fn execute_write(&self, conn: &Conn, p: &[u8]) -> RspResult<Vec<u8>> {
        let op = Opcode::ExecuteWriteReq;
        if self.0.cfg.prepare_max == 0 {
            return op.err(ErrorCode::RequestNotSupported);
        }
        let commit = match *p {
            [0x00] => false,
            [0x01] => true,
            _ => return op.err(ErrorCode::InvalidPdu),
        };
        let q = (self.0.prepared.lock().remove(&conn.index())).unwrap_or_default();
        if commit {
            for w in q {
                if let Err(e) = self.write_at(conn, w.hdl, w.off, &w.val) {
                    return op.hdl_err(e, w.hdl);
                }
            }
        } else if !q.is_empty() {
            trace!("{conn:?} cancelled {} queued write(s)", q.len());
        }
        Ok(vec![u8::from(Opcode::ExecuteWriteRsp)])
    }

    /// Writes an attribute value after checking permissions.
    fn write_at(
        &self,
        conn: &Conn,
        h: Handle,
        off: usize,
        v: &[u8],
    ) -> std::result::Result<(), ErrorCode> {
        let view = self.0.db.read().view();
        let at = view.find(h).and_then(<[Attr]>::first).ok_or(ErrorCode::InvalidHandle)?;
        at.perms.test_write(conn.security())?;
        match at.kind {
            Kind::Ccc(ref c) => c.write(conn.id(), conn.dst(), off, v).map(|changed| {
                if changed {
                    self.queue_ccc_store(conn);
                }
            }),
            Kind::Value(ref val) => val.write(conn, off, v),
            _ => Err(ErrorCode::WriteNotPermitted),
        }
    }
}

/// Value queued by `ATT_PREPARE_WRITE_REQ`.
#[derive(Debug)]
pub(super) struct Prepared {
    hdl: Handle,
    off: usize,
    val: Vec<u8>,
}

/// Decodes a start/end handle range ([Vol 3] Part F, Section 3.4.3.1).
fn handle_range(op: Opcode, p: &[u8]) -> RspResult<HandleRange> {
    let mut u = p.unpack();
    match (Handle::new(u.u16()), Handle::new(u.u16())) {
        (Some(start), Some(end)) if start <= end => Ok(HandleRange::new(start, end)),
        (start, _) => Err(ErrorRsp::new(u8::from(op), start, ErrorCode::InvalidHandle)),
    }
}

/// Returns a response PDU limited to `mtu` bytes.
fn rsp(op: Opcode, mtu: u16, f: impl FnOnce(&mut Packer)) -> Vec<u8> {
    let mut b = StructBuf::new(usize::from(mtu));
    f(b.append().u8(op));
    b.as_ref().to_vec()
}
