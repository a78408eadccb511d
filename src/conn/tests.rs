use std::time::Instant;

use matches::assert_matches;

use crate::hci::Boundary;
use crate::test_util::{peer, Cmd, Ev, Fixture, WAIT};

use super::*;

fn recorder() -> (Arc<Mutex<Vec<(u32, bool)>>>, impl Fn(u32) -> Option<TxCallback>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&log);
    let f = move |id: u32| -> Option<TxCallback> {
        let l = Arc::clone(&l);
        Some(Box::new(move |_: &Conn, r: Result<()>| l.lock().push((id, r.is_ok()))))
    };
    (log, f)
}

fn l2cap(n: usize) -> Vec<u8> {
    let mut v = vec![0; L2CAP_HDR + n];
    #[allow(clippy::cast_possible_truncation)]
    v[..2].copy_from_slice(&(n as u16).to_le_bytes());
    v[2] = 0x04;
    v
}

#[test]
fn states() {
    assert_eq!(enum_iterator::all::<State>().count(), 9);
    let with_handle: Vec<State> = enum_iterator::all::<State>().filter(|s| s.has_handle()).collect();
    assert_eq!(
        with_handle,
        [
            State::DisconnectComplete,
            State::Connect,
            State::Connected,
            State::Disconnect
        ]
    );
}

#[test]
fn ref_counting() {
    let f = Fixture::new(Config::default());
    let conn = f.t.add_le(0, peer(1)).unwrap();
    assert_eq!(conn.refs(), 1);
    let c2 = conn.clone();
    assert_eq!(conn.refs(), 2);
    drop(c2);
    assert_eq!(conn.refs(), 1);

    // State machine reference
    conn.set_state(State::ConnectAdv);
    assert_eq!(conn.refs(), 2);
    conn.set_state(State::ConnectAdv);
    assert_eq!(conn.refs(), 2);
    conn.set_state(State::Disconnected);
    assert_eq!(conn.refs(), 1);
    assert!(f.ev.all().is_empty());

    let idx = conn.index();
    drop(conn);
    assert!(f.t.lookup_addr_le(0, peer(1)).is_none());
    assert_eq!(f.t.add_le(0, peer(2)).unwrap().index(), idx);
}

#[test]
fn slots_exhausted() {
    let f = Fixture::new(Config {
        max_conn: 2,
        ..Config::default()
    });
    let a = f.t.add_le(0, peer(1)).unwrap();
    let _b = f.t.add_le(0, peer(2)).unwrap();
    assert_matches!(f.t.add_le(0, peer(3)), Err(Error::NoResources));
    drop(a);
    assert!(f.t.add_le(0, peer(3)).is_ok());
}

#[test]
fn create_le() {
    let f = Fixture::new(Config::default());
    let p = ConnParams::default();
    let conn = f.t.create_le(0, peer(1), &p).unwrap();
    assert_eq!(conn.state(), State::Connect);
    assert_eq!(f.ctl.cmds(), [Cmd::CreateConn(Some(peer(1)))]);
    assert_matches!(f.t.create_le(0, peer(1), &p), Err(Error::Already));
    assert_matches!(
        f.t.create_le(0, peer(2), &ConnParams { timeout: 0, ..p }),
        Err(Error::InvalidArgument)
    );

    // Controller reports failure
    conn.set_err(Status::UnknownConnectionIdentifier);
    conn.set_state(State::Disconnected);
    assert_eq!(
        f.ev.all(),
        [Ev::Connected(conn.index(), Some(Status::UnknownConnectionIdentifier))]
    );
    assert_eq!(conn.refs(), 1);
}

#[test]
fn create_timeout() {
    let f = Fixture::new(Config {
        create_conn_timeout: Duration::from_millis(10),
        ..Config::default()
    });
    let _conn = f.t.create_le(0, peer(1), &ConnParams::default()).unwrap();
    thread::sleep(Duration::from_millis(50));
    f.wq.flush();
    assert_eq!(
        f.ctl.cmds(),
        [Cmd::CreateConn(Some(peer(1))), Cmd::CreateConnCancel]
    );
}

#[test]
fn create_scan() {
    let f = Fixture::new(Config::default());
    let p = ConnParams::default();
    let conn = f.t.create_le_scan(0, peer(1), &p).unwrap();
    assert_eq!(conn.state(), State::ConnectScan);
    assert!(f.ctl.cmds().is_empty());
    conn.scan_matched().unwrap();
    assert_eq!(conn.state(), State::Connect);
    assert_matches!(conn.scan_matched(), Err(Error::InvalidArgument));

    let other = f.t.create_le_scan(0, peer(2), &p).unwrap();
    other.disconnect(Status::OperationCancelledByHost).unwrap();
    assert_eq!(other.state(), State::Disconnected);
    assert!(f.ev.wait(&Ev::Connected(
        other.index(),
        Some(Status::OperationCancelledByHost)
    )));
}

#[test]
fn create_auto() {
    let f = Fixture::new(Config::default());
    let p = ConnParams::default();
    f.t.create_auto(0, &p).unwrap();
    assert_matches!(f.t.create_auto(0, &p), Err(Error::Already));
    assert!(f.t.lookup_state_le(0, None, State::ConnectAuto).is_some());
    f.t.create_auto_stop().unwrap();
    assert!(f.t.lookup_state_le(0, None, State::ConnectAuto).is_none());
    assert_matches!(f.t.create_auto_stop(), Err(Error::InvalidArgument));
    assert_eq!(f.ctl.cmds(), [Cmd::CreateConn(None), Cmd::CreateConnCancel]);
}

#[test]
fn adv() {
    let f = Fixture::new(Config::default());
    let undirected = f.t.adv_conn(0, None).unwrap();
    let directed = f.t.adv_conn(0, Some(peer(1))).unwrap();
    assert_eq!(undirected.state(), State::ConnectAdv);
    assert_eq!(directed.state(), State::ConnectDirAdv);
    assert_eq!(directed.role(), Role::Peripheral);
    f.t.adv_stop(0, true);
    assert_eq!(undirected.state(), State::Disconnected);
    assert_eq!(directed.state(), State::Disconnected);
    assert_eq!(
        f.ev.all(),
        [Ev::Connected(directed.index(), Some(Status::AdvertisingTimeout))]
    );
}

#[test]
fn lookup() {
    let f = Fixture::new(Config::default());
    let a = f.connect(0x40, Role::Central);
    let b = f.connect(0x41, Role::Peripheral);
    assert_eq!(f.t.lookup_handle(ConnHandle::new(0x41).unwrap()), Some(b.clone()));
    assert!(f.t.lookup_handle(ConnHandle::new(0x42).unwrap()).is_none());
    assert_eq!(f.t.lookup_addr_le(0, peer(0x40)), Some(a.clone()));
    assert!(f.t.lookup_addr_le(1, peer(0x40)).is_none());
    assert!(f.t.exists_le(0, peer(0x41)));
    assert_eq!(
        f.t.lookup_state_le(0, Some(peer(0x40)), State::Connected),
        Some(a.clone())
    );
    let mut n = 0;
    f.t.foreach(Some(Type::Le), |_| n += 1);
    assert_eq!(n, 2);
    f.t.foreach(Some(Type::Br), |_| unreachable!());

    let info = b.info();
    assert_eq!(info.role, Role::Peripheral);
    assert_eq!(info.handle, ConnHandle::new(0x41));
    assert_eq!((info.interval, info.latency, info.timeout), (24, 0, 400));
}

#[test]
fn lifecycle() {
    let f = Fixture::new(Config::default());
    let conn = f.connect(0x40, Role::Central);
    assert!(f.ev.wait(&Ev::Connected(conn.index(), None)));
    assert_eq!(conn.refs(), 2);

    conn.disconnect(Status::RemoteUserTerminatedConnection).unwrap();
    assert_eq!(conn.state(), State::Disconnect);
    conn.disconnect(Status::RemoteUserTerminatedConnection).unwrap();
    assert_eq!(
        f.ctl.cmds(),
        [Cmd::Disconnect(
            ConnHandle::new(0x40).unwrap(),
            Status::RemoteUserTerminatedConnection
        )]
    );
    assert!(conn.handle().is_some());
    f.disconnect(&conn, Status::ConnectionTerminatedByLocalHost);
    assert_eq!(conn.state(), State::Disconnected);
    assert!(conn.handle().is_none());
    assert_eq!(conn.refs(), 1);
    assert_matches!(conn.disconnect(Status::Success), Err(Error::NotConnected));
}

#[test]
fn send_not_connected() {
    let f = Fixture::new(Config::default());
    let conn = f.t.add_le(0, peer(1)).unwrap();
    let (log, cb) = recorder();
    assert_matches!(conn.send(l2cap(1), cb(1)), Err(Error::NotConnected));
    assert!(log.lock().is_empty());
    assert_eq!(f.t.free_txs(), f.t.config().tx_max);
}

#[test]
fn credits() {
    let f = Fixture::new(Config {
        acl_pkts: 2,
        ..Config::default()
    });
    let conn = f.connect(0x40, Role::Central);
    let (log, cb) = recorder();
    conn.send(l2cap(1), cb(1)).unwrap();
    conn.send(l2cap(2), None).unwrap();
    conn.send(l2cap(3), None).unwrap();
    conn.send(l2cap(4), cb(4)).unwrap();

    assert_eq!(f.ctl.wait_acl(2).len(), 2);
    assert_eq!(f.t.credits(), 0);
    conn.num_completed(1);
    assert_eq!(f.ctl.wait_acl(3).len(), 3);
    conn.num_completed(1);
    assert_eq!(f.ctl.wait_acl(4).len(), 4);
    conn.num_completed(2);
    f.wq.flush();

    assert_eq!(*log.lock(), [(1, true), (4, true)]);
    assert_eq!(f.t.credits(), 2);
    assert_eq!(f.t.free_txs(), f.t.config().tx_max);

    // Acknowledgment without anything pending
    conn.num_completed(1);
    assert_eq!(f.t.credits(), 2);
}

#[test]
fn fragmentation() {
    let f = Fixture::new(Config::default());
    let conn = f.connect(0x40, Role::Central);
    let (log, cb) = recorder();
    let frame = l2cap(56);
    conn.send(frame.clone(), cb(1)).unwrap();

    let pkts = f.ctl.wait_acl(3);
    assert_eq!(pkts.len(), 3);
    let mut joined = Vec::new();
    for (i, pkt) in pkts.iter().enumerate() {
        let (cn, pb, data) = hci::acl_split(pkt).unwrap();
        assert_eq!(cn, ConnHandle::new(0x40).unwrap());
        let want = if i == 0 {
            Boundary::FirstNonFlushable
        } else {
            Boundary::Continuing
        };
        assert_eq!(pb, want);
        assert!(data.len() <= f.t.config().acl_mtu);
        joined.extend_from_slice(data);
    }
    assert_eq!(joined, frame);

    conn.num_completed(2);
    f.wq.flush();
    assert!(log.lock().is_empty());
    conn.num_completed(1);
    f.wq.flush();
    assert_eq!(*log.lock(), [(1, true)]);
}

#[test]
fn disconnect_fails_pending() {
    let f = Fixture::new(Config {
        acl_pkts: 1,
        ..Config::default()
    });
    let conn = f.connect(0x40, Role::Central);
    let (log, cb) = recorder();
    conn.send(l2cap(1), None).unwrap();
    conn.send(l2cap(1), cb(1)).unwrap();
    conn.send(l2cap(1), cb(2)).unwrap();
    assert_eq!(f.ctl.wait_acl(1).len(), 1);

    f.disconnect(&conn, Status::ConnectionTimeout);
    assert_eq!(*log.lock(), [(1, false), (2, false)]);
    assert_eq!(f.t.credits(), 1);
    assert_eq!(f.t.free_txs(), f.t.config().tx_max);
    assert_eq!(conn.refs(), 1);
}

#[test]
fn driver_error() {
    let f = Fixture::new(Config::default());
    let conn = f.connect(0x40, Role::Central);
    f.ctl.fail_acl.store(true, Ordering::Release);
    let (log, cb) = recorder();
    conn.send(l2cap(40), cb(1)).unwrap();
    let deadline = Instant::now() + WAIT;
    while log.lock().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    f.wq.flush();
    assert_eq!(*log.lock(), [(1, false)]);
    assert_eq!(f.t.credits(), f.t.config().acl_pkts);
}

#[test]
fn driver_error_during_disconnect() {
    let f = Fixture::new(Config {
        acl_pkts: 2,
        ..Config::default()
    });
    let conn = f.connect(0x40, Role::Central);
    f.ctl.hold_acl(0);
    conn.send(l2cap(1), None).unwrap();
    assert!(f.ctl.wait_held());
    assert_eq!(f.t.credits(), 1);

    // Disconnection reclaims the in-flight packet before the driver fails
    conn.set_err(Status::ConnectionTimeout);
    conn.set_state(State::DisconnectComplete);
    assert_eq!(f.t.credits(), 2);
    f.ctl.release_acl(true);
    conn.set_state(State::Disconnected);
    assert!(f.ev.wait(&Ev::Disconnected(conn.index(), Status::ConnectionTimeout)));
    f.wq.flush();
    assert_eq!(f.t.credits(), 2);
    assert_eq!(f.t.free_txs(), f.t.config().tx_max);
    assert_eq!(conn.refs(), 1);

    // TX thread is still running
    let conn = f.connect(0x41, Role::Central);
    let (log, cb) = recorder();
    conn.send(l2cap(1), cb(1)).unwrap();
    assert_eq!(f.ctl.wait_acl(1).len(), 1);
    conn.num_completed(1);
    f.wq.flush();
    assert_eq!(*log.lock(), [(1, true)]);
    assert_eq!(f.t.credits(), 2);
}

#[test]
fn fragment_driver_error() {
    let f = Fixture::new(Config::default());
    let conn = f.connect(0x40, Role::Central);
    let (log, cb) = recorder();
    conn.send(l2cap(1), cb(1)).unwrap();
    assert_eq!(f.ctl.wait_acl(1).len(), 1);

    // Second fragment is rejected after the first one was counted against
    // the pending context.
    f.ctl.hold_acl(1);
    conn.send(l2cap(56), None).unwrap();
    assert!(f.ctl.wait_held());
    assert_eq!(f.t.credits(), 1);
    f.ctl.release_acl(true);

    conn.send(l2cap(1), cb(2)).unwrap();
    assert_eq!(f.ctl.wait_acl(3).len(), 3);
    assert_eq!(f.t.credits(), 1);
    assert_eq!(f.t.free_txs(), f.t.config().tx_max - 2);

    conn.num_completed(3);
    f.wq.flush();
    assert_eq!(*log.lock(), [(1, true), (2, true)]);
    assert_eq!(f.t.credits(), f.t.config().acl_pkts);
    assert_eq!(f.t.free_txs(), f.t.config().tx_max);
}

#[test]
fn no_buffers_on_work_queue() {
    let f = Fixture::new(Config {
        tx_max: 1,
        ..Config::default()
    });
    let conn = f.connect(0x40, Role::Central);
    let (_log, cb) = recorder();
    let res = Arc::new(Mutex::new(Vec::new()));
    {
        let (conn, res) = (conn.clone(), Arc::clone(&res));
        f.wq.submit(move || {
            let mut r = res.lock();
            r.push(conn.send(l2cap(1), cb(1)).is_ok());
            r.push(matches!(conn.send(l2cap(1), cb(2)), Err(Error::NoBuffers)));
        });
    }
    f.wq.flush();
    assert_eq!(*res.lock(), [true, true]);
}

#[test]
fn reassembly() {
    let f = Fixture::new(Config {
        rx_mtu: 32,
        ..Config::default()
    });
    let conn = f.connect(0x40, Role::Central);
    let frame = l2cap(10);

    // Split delivery
    assert_eq!(conn.recv(&frame[..1], Boundary::First), None);
    assert_eq!(conn.recv(&frame[1..6], Boundary::Continuing), None);
    assert_eq!(conn.recv(&[], Boundary::Continuing), None);
    assert_eq!(conn.recv(&frame[6..], Boundary::Continuing), Some(frame.clone()));

    // Continuation without start
    assert_eq!(conn.recv(&frame[6..], Boundary::Continuing), None);

    // New start discards the partial frame
    assert_eq!(conn.recv(&frame[..6], Boundary::FirstNonFlushable), None);
    assert_eq!(conn.recv(&frame, Boundary::First), Some(frame.clone()));

    // Overflow
    let big = l2cap(40);
    assert_eq!(conn.recv(&big[..20], Boundary::First), None);
    assert_eq!(conn.recv(&big[20..], Boundary::Continuing), None);
    assert_eq!(conn.recv(&frame[6..], Boundary::Continuing), None);

    // Length mismatch
    let mut long = frame.clone();
    long.push(0);
    assert_eq!(conn.recv(&long, Boundary::First), None);
    assert_eq!(conn.recv(&frame, Boundary::Complete), None);
    assert_eq!(conn.recv(&frame, Boundary::First), Some(frame));
}

#[test]
fn param_update() {
    let f = Fixture::new(Config {
        conn_update_timeout: Duration::from_millis(30),
        ..Config::default()
    });
    let cn = ConnHandle::new(0x40).unwrap();
    let conn = f.connect(0x40, Role::Peripheral);
    let p = ConnParams {
        interval_min: 6,
        interval_max: 12,
        latency: 0,
        timeout: 100,
    };
    conn.le_param_update(&p).unwrap();
    assert!(f.ctl.cmds().is_empty());
    thread::sleep(Duration::from_millis(100));
    f.wq.flush();
    assert_eq!(f.ctl.cmds(), [Cmd::ConnUpdate(cn, p)]);

    conn.param_updated(12, 0, 100);
    assert!(f.ev.wait(&Ev::Params(conn.index(), 12)));
    assert_matches!(conn.le_param_update(&p), Err(Error::Already));

    // Update timer already expired
    let p2 = ConnParams { timeout: 200, ..p };
    conn.le_param_update(&p2).unwrap();
    assert_eq!(f.ctl.cmds(), [Cmd::ConnUpdate(cn, p), Cmd::ConnUpdate(cn, p2)]);

    let central = f.connect(0x41, Role::Central);
    central.le_param_update(&p).unwrap();
    assert_eq!(f.ctl.cmds().len(), 3);
}

#[test]
fn security() {
    let f = Fixture::new(Config::default());
    let conn = f.connect(0x40, Role::Central);
    let cn = ConnHandle::new(0x40).unwrap();
    assert_eq!(conn.security(), SecurityLevel::L1);
    conn.set_security(SecurityLevel::L2, false).unwrap();
    conn.set_security(SecurityLevel::L2, false).unwrap();
    assert_eq!(f.ctl.cmds(), [Cmd::Security(cn, SecurityLevel::L2)]);

    conn.security_changed(Status::Success, true);
    assert_eq!(conn.security(), SecurityLevel::L2);
    assert!(f.ev.wait(&Ev::Security(conn.index(), SecurityLevel::L2, None)));

    conn.set_security(SecurityLevel::L3, false).unwrap();
    conn.security_changed(Status::PinOrKeyMissing, false);
    assert_eq!(conn.security(), SecurityLevel::L2);
    assert!(f.ev.wait(&Ev::Security(
        conn.index(),
        SecurityLevel::L2,
        Some(Status::PinOrKeyMissing)
    )));

    conn.set_security(SecurityLevel::L2, true).unwrap();
    assert_eq!(f.ctl.cmds().len(), 3);
}

#[test]
fn send_l2cap() {
    let f = Fixture::new(Config::default());
    let conn = f.connect(0x40, Role::Central);
    conn.send_l2cap(0x0004, &[0x1B, 0x03, 0x00], None).unwrap();
    let pkts = f.ctl.wait_acl(1);
    let (_, _, data) = hci::acl_split(&pkts[0]).unwrap();
    assert_eq!(data, [0x03, 0x00, 0x04, 0x00, 0x1B, 0x03, 0x00]);
}
