use matches::assert_matches;

use super::*;

fn handle(v: u16) -> ConnHandle {
    ConnHandle::new(v).unwrap()
}

#[test]
fn conn_handle() {
    assert_eq!(u16::from(handle(0)), 0);
    assert_eq!(u16::from(handle(0x2EFF)), 0xEFF);
    assert!(ConnHandle::new(0xF00).is_none());
    assert_eq!(format!("{}", handle(0x40)), "ConnHandle(0x040)");
}

#[test]
fn acl() {
    let pkt = acl_packet(handle(0x123), Boundary::Continuing, &[1, 2, 3]);
    assert_eq!(pkt, [0x23, 0x11, 3, 0, 1, 2, 3]);
    let (cn, pb, data) = acl_split(&pkt).unwrap();
    assert_eq!((cn, pb, data), (handle(0x123), Boundary::Continuing, &[1, 2, 3][..]));
    assert_matches!(acl_split(&pkt[..6]), Err(Error::InvalidAcl));
    assert_matches!(acl_split(&[0x00, 0x0F, 0, 0]), Err(Error::InvalidAcl));
}

#[test]
fn disconnection_complete() {
    let e = Event::parse(&[0x05, 4, 0x00, 0x40, 0x00, 0x13]).unwrap();
    assert_eq!(
        e,
        Event::DisconnectionComplete(DisconnectionComplete {
            status: Status::Success,
            handle: handle(0x40),
            reason: Status::RemoteUserTerminatedConnection,
        })
    );
}

#[test]
fn number_of_completed_packets() {
    let e = Event::parse(&[0x13, 9, 2, 0x01, 0x00, 0x02, 0x00, 0x02, 0x00, 0x01, 0x00]).unwrap();
    let Event::NumberOfCompletedPackets(n) = e else {
        panic!("unexpected event");
    };
    assert_eq!(n.as_ref(), &[(handle(1), 2), (handle(2), 1)]);
}

#[test]
fn le_connection_complete() {
    let pkt = [
        0x3E, 19, 0x01, // LE meta, connection complete
        0x00, 0x40, 0x00, // Status, handle
        0x01, 0x01, // Peripheral, random peer
        0x55, 0x44, 0x33, 0x22, 0x11, 0xC0, // Peer address
        0x18, 0x00, 0x00, 0x00, 0x90, 0x01, // Interval, latency, timeout
        0x00,
    ];
    let Event::LeConnectionComplete(c) = Event::parse(&pkt).unwrap() else {
        panic!("unexpected event");
    };
    assert_eq!(c.handle, Some(handle(0x40)));
    assert_eq!(c.role, Role::Peripheral);
    assert_eq!(format!("{}", c.peer.raw()), "C0:11:22:33:44:55");
    assert_matches!(c.peer, crate::le::Addr::Random(_));
    assert_eq!((c.interval, c.latency, c.timeout), (0x18, 0, 400));
}

#[test]
fn event_error() {
    assert_matches!(Event::parse(&[]), Err(Error::InvalidEvent { code: 0 }));
    assert_matches!(Event::parse(&[0x05, 3, 0]), Err(Error::InvalidEvent { code: 0x05 }));
    assert_matches!(Event::parse(&[0x05, 2, 0, 0]), Err(Error::InvalidEvent { code: 0x05 }));
    assert_matches!(Event::parse(&[0x01, 0]), Err(Error::UnknownEvent { code: 0x01 }));
    assert_matches!(Event::parse(&[0x3E, 1, 0x02]), Err(Error::UnknownEvent { code: 0x3E }));
}

#[test]
fn conn_params() {
    let p = ConnParams::default();
    assert!(p.is_valid());
    assert!(p.is_met_by(0x20, 0, 400));
    assert!(!p.is_met_by(0x30, 0, 400));
    let bad = ConnParams {
        interval_min: 0x30,
        ..p
    };
    assert!(!bad.is_valid());
}
