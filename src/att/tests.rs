use std::thread;

use matches::assert_matches;

use crate::hci::Role;
use crate::test_util::Fixture;

use super::*;

type Log = Arc<Mutex<Vec<std::result::Result<Vec<u8>, Error>>>>;

fn rsp_cb(log: &Log) -> RspCallback {
    let log = Arc::clone(log);
    Box::new(move |_: &Conn, r: Result<&[u8]>| log.lock().push(r.map(<[u8]>::to_vec)))
}

fn cfm_cb(log: &Log) -> CfmCallback {
    let log = Arc::clone(log);
    Box::new(move |_: &Conn, r: Result<()>| log.lock().push(r.map(|_| Vec::new())))
}

fn setup(timeout: Duration) -> (Fixture, Conn, Att) {
    let f = Fixture::unlimited();
    let conn = f.connect(0x40, Role::Central);
    let att = Att::new(f.wq.clone(), timeout);
    att.connected(&conn);
    (f, conn, att)
}

#[test]
fn request_queue() {
    let (f, conn, att) = setup(TIMEOUT);
    let log = Log::default();
    let read = pdu(Opcode::ReadReq, |p| {
        p.u16(0x0003_u16);
    });
    att.request(&conn, read.clone(), rsp_cb(&log)).unwrap();
    att.request(&conn, read.clone(), rsp_cb(&log)).unwrap();
    assert_eq!(f.ctl.take_l2cap(1), [read.clone()]);
    assert!(f.ctl.quiet());

    // Response for a different request is ignored
    assert_eq!(att.recv(&conn, &[0x13]), None);
    assert!(log.lock().is_empty());

    assert_eq!(att.recv(&conn, &[0x0B, 1, 2]), None);
    assert_eq!(f.ctl.take_l2cap(1), [read]);
    assert_eq!(att.recv(&conn, &[0x01, 0x0A, 0x03, 0x00, 0x0A]), None);

    let log = log.lock();
    assert_matches!(&log[0], Ok(v) if v == &[1, 2]);
    assert_matches!(&log[1], Err(Error::Att(e)) if e.err() == ErrorCode::AttributeNotFound
        && e.hdl() == Handle::new(3));
}

#[test]
fn invalid_request() {
    let (_f, conn, att) = setup(TIMEOUT);
    let log = Log::default();
    assert_matches!(
        att.request(&conn, vec![0x1B, 0, 0], rsp_cb(&log)),
        Err(Error::InvalidPdu)
    );
    assert_matches!(
        att.request(&conn, vec![0x0A; 30], rsp_cb(&log)),
        Err(Error::MtuExceeded(DEFAULT_MTU))
    );
    att.set_mtu(&conn, 100);
    assert_eq!(att.mtu(&conn), 100);
    assert!(att.request(&conn, vec![0x0A; 30], rsp_cb(&log)).is_ok());
}

#[test]
fn indications() {
    let (f, conn, att) = setup(TIMEOUT);
    let log = Log::default();
    let ind = pdu(Opcode::HandleValueInd, |p| {
        p.u16(0x0008_u16).put([1, 2, 3, 4]);
    });
    att.indicate(&conn, ind.clone(), cfm_cb(&log)).unwrap();
    att.indicate(&conn, ind.clone(), cfm_cb(&log)).unwrap();
    assert_eq!(f.ctl.take_l2cap(1), [ind.clone()]);
    assert!(f.ctl.quiet());
    assert_eq!(att.recv(&conn, &[0x1E]), None);
    assert_eq!(log.lock().len(), 1);
    assert_eq!(f.ctl.take_l2cap(1), [ind]);
    assert_eq!(att.recv(&conn, &[0x1E]), None);
    assert_eq!(log.lock().len(), 2);

    // Unexpected confirmation
    assert_eq!(att.recv(&conn, &[0x1E]), None);
    assert_eq!(log.lock().len(), 2);
}

#[test]
fn disconnect() {
    let (f, conn, att) = setup(TIMEOUT);
    let log = Log::default();
    let read = pdu(Opcode::ReadReq, |p| {
        p.u16(0x0003_u16);
    });
    att.request(&conn, read.clone(), rsp_cb(&log)).unwrap();
    att.request(&conn, read, rsp_cb(&log)).unwrap();
    att.indicate(&conn, vec![0x1D, 8, 0], cfm_cb(&log)).unwrap();
    f.ctl.take_l2cap(2);
    att.disconnected(&conn);
    let v = log.lock();
    assert_eq!(v.len(), 3);
    assert!(v
        .iter()
        .all(|r| matches!(r, Err(Error::Conn(conn::Error::NotConnected)))));
    assert_matches!(
        att.request(&conn, vec![0x0A, 3, 0], rsp_cb(&log)),
        Err(Error::Conn(conn::Error::NotConnected))
    );
}

#[test]
fn timeout() {
    let (f, conn, att) = setup(Duration::from_millis(10));
    let log = Log::default();
    att.request(&conn, vec![0x0A, 3, 0], rsp_cb(&log)).unwrap();
    thread::sleep(Duration::from_millis(50));
    f.wq.flush();
    assert_matches!(log.lock()[..], [Err(Error::Timeout(Opcode::ReadReq))]);
    assert_matches!(
        att.request(&conn, vec![0x0A, 3, 0], rsp_cb(&log)),
        Err(Error::Timeout(Opcode::ReadReq))
    );
}

#[test]
fn recv() {
    let (f, conn, att) = setup(TIMEOUT);
    assert_eq!(att.recv(&conn, &[0x0A, 1, 0]), Some(Opcode::ReadReq));
    assert_eq!(att.recv(&conn, &[0x52, 1, 0]), Some(Opcode::WriteCmd));
    assert_eq!(att.recv(&conn, &[0x1B, 1, 0]), Some(Opcode::HandleValueNtf));
    assert!(f.ctl.quiet());

    // Unknown request and command
    assert_eq!(att.recv(&conn, &[0x3F]), None);
    assert_eq!(f.ctl.take_l2cap(1), [vec![0x01, 0x3F, 0, 0, 0x06]]);
    assert_eq!(att.recv(&conn, &[0x7F]), None);
    assert!(f.ctl.quiet());

    assert_eq!(att.recv(&conn, &[]), None);
    assert_eq!(f.ctl.take_l2cap(1), [vec![0x01, 0x00, 0, 0, 0x04]]);
}
