//! Controller mock and connection fixtures shared by unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::conn::{self, Conn, Listener, SecurityLevel, State, Table};
use crate::hci::{self, ConnHandle, ConnParams, Controller, Role, Status};
use crate::le::{Addr, RawAddr};
use crate::util::WorkQueue;

pub(crate) const WAIT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Cmd {
    Disconnect(ConnHandle, Status),
    CreateConn(Option<Addr>),
    CreateConnCancel,
    ConnUpdate(ConnHandle, ConnParams),
    Security(ConnHandle, SecurityLevel),
}

/// Controlled blocking of [`Mock::acl_data`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum Hold {
    #[default]
    Off,
    /// Block after letting this many more packets through.
    Armed(usize),
    Blocked,
    Released { fail: bool },
}

/// Controller that records commands and ACL data packets.
#[derive(Debug, Default)]
pub(crate) struct Mock {
    acl: Mutex<Vec<Vec<u8>>>,
    sent: Condvar,
    cmds: Mutex<Vec<Cmd>>,
    hold: Mutex<Hold>,
    held: Condvar,
    pub fail_acl: AtomicBool,
}

impl Mock {
    /// Makes the `skip + 1`th subsequent ACL packet block in the driver until
    /// [`Self::release_acl`].
    pub fn hold_acl(&self, skip: usize) {
        *self.hold.lock() = Hold::Armed(skip);
    }

    /// Waits until an ACL packet is blocked in the driver.
    pub fn wait_held(&self) -> bool {
        let deadline = Instant::now() + WAIT;
        let mut h = self.hold.lock();
        while *h != Hold::Blocked {
            if self.held.wait_until(&mut h, deadline).timed_out() {
                return *h == Hold::Blocked;
            }
        }
        true
    }

    /// Unblocks the held packet, which is either accepted or rejected.
    pub fn release_acl(&self, fail: bool) {
        *self.hold.lock() = Hold::Released { fail };
        self.held.notify_all();
    }

    /// Applies the hold state to one packet. Returns whether it is rejected.
    fn hold(&self) -> bool {
        let mut h = self.hold.lock();
        match *h {
            Hold::Armed(0) => {}
            Hold::Armed(n) => {
                *h = Hold::Armed(n - 1);
                return false;
            }
            Hold::Off | Hold::Blocked | Hold::Released { .. } => return false,
        }
        *h = Hold::Blocked;
        self.held.notify_all();
        let deadline = Instant::now() + WAIT;
        while *h == Hold::Blocked {
            if self.held.wait_until(&mut h, deadline).timed_out() {
                break;
            }
        }
        let fail = matches!(*h, Hold::Released { fail: true });
        *h = Hold::Off;
        fail
    }

    /// Waits until at least `n` ACL packets were sent and returns all of them.
    pub fn wait_acl(&self, n: usize) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + WAIT;
        let mut v = self.acl.lock();
        while v.len() < n {
            if self.sent.wait_until(&mut v, deadline).timed_out() {
                break;
            }
        }
        v.clone()
    }

    /// Waits for `n` unfragmented packets and returns their L2CAP payloads,
    /// clearing the packet log.
    pub fn take_l2cap(&self, n: usize) -> Vec<Vec<u8>> {
        let v = self.wait_acl(n);
        self.acl.lock().clear();
        (v.iter())
            .map(|pkt| {
                let (_, _, data) = hci::acl_split(pkt).unwrap();
                data[conn::L2CAP_HDR..].to_vec()
            })
            .collect()
    }

    /// Like [`Self::take_l2cap`], but also returns the connection handle of
    /// each packet.
    pub fn take_frames(&self, n: usize) -> Vec<(u16, Vec<u8>)> {
        let deadline = Instant::now() + WAIT;
        let mut v = self.acl.lock();
        while v.len() < n {
            if self.sent.wait_until(&mut v, deadline).timed_out() {
                break;
            }
        }
        let v = std::mem::take(&mut *v);
        (v.iter())
            .map(|pkt| {
                let (cn, _, data) = hci::acl_split(pkt).unwrap();
                (u16::from(cn), data[conn::L2CAP_HDR..].to_vec())
            })
            .collect()
    }

    /// Returns whether nothing was sent within a short period.
    pub fn quiet(&self) -> bool {
        std::thread::sleep(Duration::from_millis(20));
        self.acl.lock().is_empty()
    }

    pub fn cmds(&self) -> Vec<Cmd> {
        self.cmds.lock().clone()
    }
}

impl Controller for Mock {
    fn acl_data(&self, pkt: &[u8]) -> hci::Result<()> {
        if self.hold() || self.fail_acl.load(Ordering::Acquire) {
            return Err(hci::Error::Transport);
        }
        self.acl.lock().push(pkt.to_vec());
        self.sent.notify_all();
        Ok(())
    }

    fn disconnect(&self, cn: ConnHandle, reason: Status) -> hci::Result<()> {
        self.cmds.lock().push(Cmd::Disconnect(cn, reason));
        Ok(())
    }

    fn le_create_conn(&self, peer: Option<Addr>, _: &ConnParams) -> hci::Result<()> {
        self.cmds.lock().push(Cmd::CreateConn(peer));
        Ok(())
    }

    fn le_create_conn_cancel(&self) -> hci::Result<()> {
        self.cmds.lock().push(Cmd::CreateConnCancel);
        Ok(())
    }

    fn le_conn_update(&self, cn: ConnHandle, p: &ConnParams) -> hci::Result<()> {
        self.cmds.lock().push(Cmd::ConnUpdate(cn, *p));
        Ok(())
    }

    fn start_security(&self, cn: ConnHandle, level: SecurityLevel) -> hci::Result<()> {
        self.cmds.lock().push(Cmd::Security(cn, level));
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Ev {
    Connected(usize, Option<Status>),
    Disconnected(usize, Status),
    Params(usize, u16),
    Security(usize, SecurityLevel, Option<Status>),
}

/// Listener that records connection events.
#[derive(Debug, Default)]
pub(crate) struct Events {
    v: Mutex<Vec<Ev>>,
    cv: Condvar,
}

impl Events {
    fn push(&self, e: Ev) {
        self.v.lock().push(e);
        self.cv.notify_all();
    }

    pub fn wait(&self, e: &Ev) -> bool {
        let deadline = Instant::now() + WAIT;
        let mut v = self.v.lock();
        while !v.contains(e) {
            if self.cv.wait_until(&mut v, deadline).timed_out() {
                return v.contains(e);
            }
        }
        true
    }

    pub fn all(&self) -> Vec<Ev> {
        self.v.lock().clone()
    }
}

impl Listener for Events {
    fn connected(&self, conn: &Conn, err: Option<Status>) {
        self.push(Ev::Connected(conn.index(), err));
    }

    fn disconnected(&self, conn: &Conn, reason: Status) {
        self.push(Ev::Disconnected(conn.index(), reason));
    }

    fn param_updated(&self, conn: &Conn, interval: u16, _: u16, _: u16) {
        self.push(Ev::Params(conn.index(), interval));
    }

    fn security_changed(&self, conn: &Conn, level: SecurityLevel, err: Option<Status>) {
        self.push(Ev::Security(conn.index(), level, err));
    }
}

/// Connection table with a mock controller.
pub(crate) struct Fixture {
    pub t: Table,
    pub ctl: Arc<Mock>,
    pub wq: WorkQueue,
    pub ev: Arc<Events>,
}

impl Fixture {
    pub fn new(cfg: conn::Config) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let ctl = Arc::new(Mock::default());
        let wq = WorkQueue::new("test-wq").unwrap();
        let t = Table::new(cfg, Arc::clone(&ctl) as _, wq.clone()).unwrap();
        let ev = Arc::new(Events::default());
        t.register(Arc::clone(&ev) as _);
        Self { t, ctl, wq, ev }
    }

    /// Returns a fixture for protocol tests where frames are never
    /// fragmented and credits never run out.
    pub fn unlimited() -> Self {
        Self::new(conn::Config {
            acl_mtu: 1024,
            acl_pkts: 1024,
            rx_mtu: 1024,
            ..conn::Config::default()
        })
    }

    /// Creates a connection in the Connected state.
    pub fn connect(&self, cn: u16, role: Role) -> Conn {
        let peer = peer(cn);
        let conn = self.t.add_le(0, peer).unwrap();
        conn.set_state(match role {
            Role::Central => State::Connect,
            Role::Peripheral => State::ConnectAdv,
        });
        conn.set_link(ConnHandle::new(cn).unwrap(), role, peer, 24, 0, 400);
        conn.set_state(State::Connected);
        conn.notify_connected();
        conn
    }

    /// Runs the disconnection sequence and waits for it to complete.
    pub fn disconnect(&self, conn: &Conn, reason: Status) {
        conn.set_err(reason);
        conn.set_state(State::DisconnectComplete);
        conn.set_state(State::Disconnected);
        assert!(self.ev.wait(&Ev::Disconnected(conn.index(), reason)));
        self.wq.flush();
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.t.shutdown();
        self.wq.stop();
    }
}

/// Returns a test peer address.
pub(crate) fn peer(v: u16) -> Addr {
    let [a, b] = v.to_le_bytes();
    Addr::Public(RawAddr::from_le_bytes([a, b, 0, 0, 0, 0xC0]))
}
