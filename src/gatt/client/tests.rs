use matches::assert_matches;

use crate::att::Perms;
use crate::gap::uuid16;
use crate::gatt::tests::{chars_svc, h, notify_svc, Env};
use crate::gatt::{Bytes, Config, Service};

use super::*;

const CLI: u16 = 0x40;
const SRV: u16 = 0x41;

type Log = Arc<Mutex<Vec<Option<Vec<u8>>>>>;

/// Client and server sides of one database connected back to back. Frames
/// sent on the client connection are received by the server connection and
/// vice versa.
struct Loop {
    e: Env,
    cli: Conn,
    srv: Conn,
}

impl Loop {
    fn new() -> Self {
        let e = Env::new(Config::default());
        let (cli, srv) = (e.connect(CLI), e.connect(SRV));
        Self { e, cli, srv }
    }

    fn client(&self) -> &Client {
        self.e.gatt.client()
    }

    /// Delivers frames until both sides go quiet. Returns the PDUs sent by
    /// the client.
    fn pump(&self) -> Vec<Vec<u8>> {
        let mut sent = Vec::new();
        while !self.e.f.ctl.quiet() {
            for (cn, pdu) in self.e.f.ctl.take_frames(1) {
                if cn == CLI {
                    self.e.gatt.recv(&self.srv, &pdu);
                    sent.push(pdu);
                } else {
                    self.e.gatt.recv(&self.cli, &pdu);
                }
            }
        }
        sent
    }

    /// Runs a discovery procedure to completion. Returns the attributes
    /// found and the number of requests sent.
    fn discover(&self, typ: Discover, uuid: Option<Uuid>, range: HandleRange) -> (Vec<Found>, usize) {
        let v = Arc::new(Mutex::new((Vec::new(), false)));
        let v2 = Arc::clone(&v);
        let cb: DiscoverCallback = Box::new(move |_: &Conn, f: Option<&Found>| {
            let mut v = v2.lock();
            match f {
                Some(f) => v.0.push(*f),
                None => v.1 = true,
            }
            Iter::Continue
        });
        self.client().discover(&self.cli, typ, uuid, range, cb).unwrap();
        let n = self.pump().len();
        let (found, done) = std::mem::take(&mut *v.lock());
        assert!(done);
        (found, n)
    }
}

fn r(start: u16, end: u16) -> HandleRange {
    HandleRange::from_raw(start, end).unwrap()
}

fn sub(cccd: Cccd, ret: Iter) -> (Arc<Subscription>, Log) {
    let log = Log::default();
    let l = Arc::clone(&log);
    let f: NotifyCallback = Box::new(move |_: &Conn, v: Option<&[u8]>| {
        l.lock().push(v.map(<[u8]>::to_vec));
        ret
    });
    (Arc::new(Subscription::new(h(12), h(13), cccd, f)), log)
}

#[test]
fn discover_characteristics() {
    let t = Loop::new();
    t.e.gatt.register(chars_svc(0x1234, 4)).unwrap();
    let (found, n) = t.discover(Discover::Characteristic, None, r(1, 100));
    let hdls: Vec<u16> = found.iter().map(|f| u16::from(f.handle())).collect();
    assert_eq!(hdls, [2, 4, 7, 11, 13, 15, 17]);
    assert_eq!(n, 4);
    assert_eq!(
        found[2],
        Found::Characteristic {
            hdl: h(7),
            props: CharProps::INDICATE,
            value: h(8),
            uuid: gap::SERVICE_CHANGED.as_uuid(),
        }
    );

    // UUID filter is applied locally
    let (found, _) = t.discover(Discover::Characteristic, Some(uuid16(0x2B02).as_uuid()), r(1, 100));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].handle(), h(15));
}

#[test]
fn discover_services() {
    let t = Loop::new();
    t.e.gatt.register(chars_svc(0x1234, 4)).unwrap();
    let (found, n) = t.discover(Discover::Primary, None, HandleRange::ALL);
    assert_eq!(
        found,
        [
            Found::Service {
                hdl: h(1),
                end: h(5),
                uuid: gap::GENERIC_ACCESS.as_uuid()
            },
            Found::Service {
                hdl: h(6),
                end: h(9),
                uuid: gap::GENERIC_ATTRIBUTE.as_uuid()
            },
            Found::Service {
                hdl: h(10),
                end: h(18),
                uuid: uuid16(0x1234).as_uuid()
            },
        ]
    );
    assert_eq!(n, 2);

    let u = uuid16(0x1234).as_uuid();
    let (found, _) = t.discover(Discover::Primary, Some(u), HandleRange::ALL);
    assert_eq!(
        found,
        [Found::Service {
            hdl: h(10),
            end: h(18),
            uuid: u
        }]
    );
    let (found, _) = t.discover(Discover::Secondary, None, HandleRange::ALL);
    assert!(found.is_empty());
}

#[test]
fn discover_descriptors() {
    let t = Loop::new();
    t.e.gatt.register(notify_svc(&Bytes::new(vec![0]), None)).unwrap();
    let (found, n) = t.discover(Discover::Descriptor, None, r(13, 13));
    assert_eq!(
        found,
        [Found::Descriptor {
            hdl: h(13),
            uuid: gap::CLIENT_CHARACTERISTIC_CONFIGURATION.as_uuid()
        }]
    );
    assert_eq!(n, 1);
    let (found, n) = t.discover(Discover::Descriptor, None, r(10, 13));
    assert_eq!(found.len(), 4);
    assert_eq!(n, 1);
}

#[test]
fn discover_long_include() {
    let t = Loop::new();
    let u = Uuid::new(0x9A5B_3E55_0F1C_4B8E_9C0A_3D2B_7E4F_1A60).unwrap();
    let s1 = Service::primary(u, |s| {
        s.characteristic(uuid16(0x2B00), CharProps::READ, Perms::READ, Bytes::new(vec![1]), |_| {});
    });
    let s1 = t.e.gatt.register(s1).unwrap();
    t.e.gatt.register(Service::primary(uuid16(0x1235), |s| {
        s.include(s1);
    }))
    .unwrap();
    let (found, n) = t.discover(Discover::Include, None, r(13, 14));
    assert_eq!(
        found,
        [Found::Include {
            hdl: h(14),
            range: r(10, 12),
            uuid: u
        }]
    );
    assert_eq!(n, 2);
}

#[test]
fn discover_stop() {
    let t = Loop::new();
    let v = Arc::new(Mutex::new(Vec::new()));
    let v2 = Arc::clone(&v);
    let cb: DiscoverCallback = Box::new(move |_: &Conn, f: Option<&Found>| {
        v2.lock().push(f.copied());
        Iter::Stop
    });
    (t.client()).discover(&t.cli, Discover::Characteristic, None, HandleRange::ALL, cb).unwrap();
    assert_eq!(t.pump().len(), 1);
    let v = v.lock();
    assert_eq!(v.len(), 1);
    assert_eq!(v[0].map(|f| f.handle()), Some(h(2)));
}

#[test]
fn long_read() {
    let t = Loop::new();
    let v: Vec<u8> = (0..50).collect();
    t.e.gatt.register(notify_svc(&Bytes::new(v.clone()), None)).unwrap();
    let out = Arc::new(Mutex::new(None));
    let o = Arc::clone(&out);
    let cb: ReadCallback = Box::new(move |_: &Conn, r: att::Result<Vec<u8>>| *o.lock() = Some(r.ok()));
    t.client().read(&t.cli, h(12), cb).unwrap();
    assert_eq!(t.pump().len(), 3);
    assert_eq!(out.lock().take(), Some(Some(v)));

    // Offset read and errors
    let o = Arc::clone(&out);
    let cb: ReadCallback = Box::new(move |_: &Conn, r: att::Result<Vec<u8>>| *o.lock() = Some(r.ok()));
    t.client().read_at(&t.cli, h(12), 45, cb).unwrap();
    t.pump();
    assert_eq!(out.lock().take(), Some(Some(vec![45, 46, 47, 48, 49])));

    let o = Arc::clone(&out);
    let cb: ReadCallback = Box::new(move |_: &Conn, r: att::Result<Vec<u8>>| *o.lock() = Some(r.ok()));
    t.client().read(&t.cli, h(8), cb).unwrap();
    t.pump();
    assert_eq!(out.lock().take(), Some(None));

    let cb: ReadCallback = Box::new(|_: &Conn, _: att::Result<Vec<u8>>| {});
    assert_matches!(t.client().read_multiple(&t.cli, &[h(3)], cb), Err(Error::InvalidArgument));
}

#[test]
fn writes() {
    let t = Loop::new();
    let v = Bytes::new(vec![0]);
    t.e.gatt.register(notify_svc(&v, None)).unwrap();
    let out = Arc::new(Mutex::new(Vec::new()));

    let o = Arc::clone(&out);
    let cb: WriteCallback = Box::new(move |_: &Conn, r: att::Result<()>| o.lock().push(r));
    t.client().write(&t.cli, h(12), b"abc", cb).unwrap();
    t.pump();
    assert_matches!(out.lock().pop(), Some(Ok(())));
    assert_eq!(v.get(), b"abc");

    // Prepared writes are not supported by the server
    let o = Arc::clone(&out);
    let cb: WriteCallback = Box::new(move |_: &Conn, r: att::Result<()>| o.lock().push(r));
    t.client().write(&t.cli, h(12), &[1; 30], cb).unwrap();
    let sent = t.pump();
    assert_eq!(sent.len(), 1);
    assert_eq!(&sent[0][..5], [0x16, 12, 0x00, 0x00, 0x00]);
    assert_eq!(sent[0].len(), 23);
    assert_matches!(
        out.lock().pop(),
        Some(Err(att::Error::Att(e))) if e.err() == ErrorCode::RequestNotSupported
    );

    let cb: WriteCallback = Box::new(|_: &Conn, _: att::Result<()>| {});
    assert_matches!(t.client().write(&t.cli, h(12), &[0; 513], cb), Err(Error::InvalidArgument));

    // Commands
    t.client().write_without_response(&t.cli, h(12), b"x", false).unwrap();
    t.pump();
    assert_eq!(v.get(), b"x");
    t.client().write_without_response(&t.cli, h(12), b"y", true).unwrap();
    let mut want = vec![0xD2, 12, 0x00, b'y'];
    want.extend_from_slice(&[0; SIGNATURE_LEN]);
    assert_eq!(t.e.f.ctl.take_frames(1), [(CLI, want)]);
}

#[test]
fn exchange_mtu() {
    let t = Loop::new();
    let out = Arc::new(Mutex::new(None));
    let o = Arc::clone(&out);
    let cb: MtuCallback = Box::new(move |_: &Conn, r: att::Result<u16>| *o.lock() = r.ok());
    t.client().exchange_mtu(&t.cli, cb).unwrap();
    assert_eq!(t.pump(), [vec![0x02, 65, 0x00]]);
    assert_eq!(*out.lock(), Some(65));
    assert_eq!(t.e.att.mtu(&t.cli), 65);
    assert_eq!(t.e.att.mtu(&t.srv), 65);
}

#[test]
fn subscriptions() {
    let t = Loop::new();
    t.e.gatt.register(notify_svc(&Bytes::new(vec![0]), None)).unwrap();
    let (s1, l1) = sub(Cccd::NOTIFY, Iter::Continue);
    let (s2, l2) = sub(Cccd::NOTIFY, Iter::Continue);

    t.client().subscribe(&t.cli, &s1).unwrap();
    assert_eq!(t.pump(), [vec![0x12, 13, 0x00, 0x01, 0x00]]);
    assert_eq!(t.e.gatt.ccc_value(h(13)), Some(Cccd::NOTIFY));
    assert_matches!(t.client().subscribe(&t.cli, &s1), Err(Error::Already));

    // Existing configuration covers the second subscription
    t.client().subscribe(&t.cli, &s2).unwrap();
    assert!(t.pump().is_empty());
    assert_eq!(t.client().subscriptions(&t.cli), 2);

    t.e.gatt.notify(None, h(12), b"hi").unwrap();
    t.pump();
    assert_eq!(*l1.lock(), [Some(b"hi".to_vec())]);
    assert_eq!(*l2.lock(), [Some(b"hi".to_vec())]);

    t.client().unsubscribe(&t.cli, &s1).unwrap();
    assert!(t.pump().is_empty());
    assert_eq!(l1.lock().last(), Some(&None));
    assert_matches!(t.client().unsubscribe(&t.cli, &s1), Err(Error::InvalidArgument));

    t.client().unsubscribe(&t.cli, &s2).unwrap();
    assert_eq!(t.pump(), [vec![0x12, 13, 0x00, 0x00, 0x00]]);
    assert_eq!(l2.lock().last(), Some(&None));
    assert_eq!(t.e.gatt.ccc_value(h(13)), Some(Cccd::empty()));
    assert_eq!(t.client().subscriptions(&t.cli), 0);
}

#[test]
fn subscription_stop() {
    let t = Loop::new();
    t.e.gatt.register(notify_svc(&Bytes::new(vec![0]), None)).unwrap();
    let (s, log) = sub(Cccd::INDICATE, Iter::Stop);
    t.client().subscribe(&t.cli, &s).unwrap();
    t.pump();

    t.e.gatt.indicate(None, h(12), b"x", None).unwrap();
    let sent = t.pump();
    assert_eq!(sent, [vec![0x12, 13, 0x00, 0x00, 0x00], vec![0x1E]]);
    assert_eq!(*log.lock(), [Some(b"x".to_vec()), None]);
    assert_eq!(t.client().subscriptions(&t.cli), 0);
}

#[test]
fn subscription_write_failure() {
    let t = Loop::new();
    let (s, log) = sub(Cccd::NOTIFY, Iter::Continue);
    t.client().subscribe(&t.cli, &s).unwrap();
    t.pump();
    assert_eq!(*log.lock(), [None]);
    assert_eq!(t.client().subscriptions(&t.cli), 0);
}

#[test]
fn disconnect_removes_subscriptions() {
    let e = Env::new(Config::default());
    let c = e.connect(CLI);
    let (s1, l1) = sub(Cccd::NOTIFY, Iter::Continue);
    e.gatt.client().subscribe(&c, &s1).unwrap();
    assert_eq!(e.f.ctl.take_frames(1), [(CLI, vec![0x12, 13, 0x00, 0x01, 0x00])]);
    e.gatt.recv(&c, &[0x13]);
    e.disconnect(&c);
    assert_eq!(*l1.lock(), [None]);

    // Bonded peers keep non-volatile subscriptions
    e.bonds.add(0, c.dst());
    let c = e.connect(CLI);
    let (s2, l2) = sub(Cccd::NOTIFY, Iter::Continue);
    let (s3, l3) = sub(Cccd::INDICATE, Iter::Continue);
    let s3 = Arc::new(Arc::try_unwrap(s3).unwrap().volatile());
    e.gatt.client().subscribe(&c, &s2).unwrap();
    e.gatt.client().subscribe(&c, &s3).unwrap();
    for v in [0x01, 0x02] {
        assert_eq!(e.f.ctl.take_frames(1), [(CLI, vec![0x12, 13, 0x00, v, 0x00])]);
        e.gatt.recv(&c, &[0x13]);
    }
    e.disconnect(&c);
    assert!(l2.lock().is_empty());
    assert_eq!(*l3.lock(), [None]);
    assert_eq!(e.gatt.client().subscriptions(&c), 1);

    // Reconnection restores the CCC value
    let c = e.connect(CLI);
    assert_eq!(e.f.ctl.take_frames(1), [(CLI, vec![0x12, 13, 0x00, 0x01, 0x00])]);
    e.gatt.recv(&c, &[0x13]);
    assert!(e.f.ctl.quiet());
}
