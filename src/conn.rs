//! Connection management.
//!
//! A [`Table`] owns a fixed number of connection slots. Each slot is
//! reference counted: the state machine holds one reference from the moment
//! the connection leaves [`State::Disconnected`] until it returns there and
//! cleanup completes, and every [`Conn`] handle holds another. A slot is free
//! for reuse when its count reaches zero.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use structbuf::{Pack, StructBuf};
use tracing::{debug, error, trace, warn};

pub use tx::TxCallback;

use crate::hci::{self, ConnHandle, ConnParams, Controller, Role, Status};
use crate::le::Addr;
use crate::util::{DelayedWork, Semaphore, WorkQueue};

use self::tx::TxState;

mod rx;
mod tx;

#[cfg(test)]
mod tests;

/// L2CAP basic header length ([Vol 3] Part A, Section 3.1).
pub(crate) const L2CAP_HDR: usize = 4;

/// Error type returned by the connection layer.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Hci(#[from] hci::Error),
    #[error("not connected")]
    NotConnected,
    #[error("no free TX contexts")]
    NoBuffers,
    #[error("no free connection slots")]
    NoResources,
    #[error("operation already in progress or completed")]
    Already,
    #[error("invalid argument")]
    InvalidArgument,
}

/// Common connection layer result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Connection table configuration.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    /// Number of connection slots.
    pub max_conn: usize,
    /// Number of TX contexts shared by all connections.
    pub tx_max: usize,
    /// Controller ACL data packet length.
    pub acl_mtu: usize,
    /// Number of controller ACL data packet buffers.
    pub acl_pkts: usize,
    /// Maximum reassembled L2CAP frame length, including the basic header.
    pub rx_mtu: usize,
    /// Time allowed for an LE connection attempt before it is cancelled.
    pub create_conn_timeout: Duration,
    /// Delay before a peripheral may request new connection parameters.
    pub conn_update_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_conn: 4,
            tx_max: 8,
            acl_mtu: 27,
            acl_pkts: 4,
            rx_mtu: 256,
            create_conn_timeout: Duration::from_secs(3),
            conn_update_timeout: Duration::from_secs(5),
        }
    }
}

/// Connection state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, enum_iterator::Sequence)]
pub enum State {
    #[default]
    Disconnected,
    DisconnectComplete,
    ConnectScan,
    ConnectDirAdv,
    ConnectAdv,
    ConnectAuto,
    Connect,
    Connected,
    Disconnect,
}

impl State {
    /// Returns whether the connection handle is meaningful in this state.
    #[inline]
    #[must_use]
    pub const fn has_handle(self) -> bool {
        matches!(
            self,
            Self::Connect | Self::Connected | Self::Disconnect | Self::DisconnectComplete
        )
    }
}

/// Link type.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Type {
    #[default]
    Le,
    Br,
    Sco,
    Iso,
}

/// Link security level ([Vol 3] Part C, Section 10.2).
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum SecurityLevel {
    /// No encryption and no authentication.
    #[default]
    L1 = 1,
    /// Encryption without authentication.
    L2 = 2,
    /// Encryption with authentication.
    L3 = 3,
    /// LE Secure Connections pairing with encryption.
    L4 = 4,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    struct Flags: u8 {
        /// Disconnected connection is waiting for TX cleanup.
        const CLEANUP = 1 << 0;
        /// Peripheral has parameters waiting for the update timer.
        const PERIPHERAL_PARAM_SET = 1 << 1;
        /// Peripheral is allowed to request parameter updates.
        const PERIPHERAL_PARAM_UPDATE = 1 << 2;
        /// Security upgrade must re-pair even if keys exist.
        const FORCE_PAIR = 1 << 3;
    }
}

crate::impl_display_via_debug! { State, Type, SecurityLevel }

/// Connection event listener. All methods are called without any connection
/// locks held.
#[allow(unused_variables)]
pub trait Listener: Send + Sync {
    /// Connection was established (`err == None`) or failed.
    fn connected(&self, conn: &Conn, err: Option<Status>) {}

    /// Connection was terminated and all of its TX contexts were released.
    fn disconnected(&self, conn: &Conn, reason: Status) {}

    /// Connection parameters changed.
    fn param_updated(&self, conn: &Conn, interval: u16, latency: u16, timeout: u16) {}

    /// Link security level changed or the change failed.
    fn security_changed(&self, conn: &Conn, level: SecurityLevel, err: Option<Status>) {}
}

/// Snapshot of connection properties.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct Info {
    pub typ: Type,
    pub role: Role,
    pub id: u8,
    pub dst: Addr,
    pub handle: Option<ConnHandle>,
    pub interval: u16,
    pub latency: u16,
    pub timeout: u16,
    pub security: SecurityLevel,
}

/// Link state protected by the slot mutex.
#[derive(Debug, Default)]
struct Link {
    state: State,
    typ: Type,
    role: Role,
    id: u8,
    dst: Addr,
    handle: Option<ConnHandle>,
    err: Option<Status>,
    interval: u16,
    latency: u16,
    timeout: u16,
    /// Requested parameters for connection creation or a pending peripheral
    /// update.
    params: ConnParams,
    sec_level: SecurityLevel,
    required_sec_level: SecurityLevel,
    flags: Flags,
    rx: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Slot {
    refs: AtomicUsize,
    link: Mutex<Link>,
    tx: Mutex<TxState>,
    /// Serializes TX callback delivery.
    notify: Mutex<()>,
    deferred: DelayedWork,
}

/// Wakes the TX thread.
#[derive(Debug, Default)]
struct Signal {
    raised: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    fn raise(&self) {
        *self.raised.lock() = true;
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut r = self.raised.lock();
        while !*r {
            self.cv.wait(&mut r);
        }
        *r = false;
    }
}

struct Shared {
    cfg: Config,
    slots: Box<[Slot]>,
    ctl: Arc<dyn Controller>,
    wq: WorkQueue,
    credits: Semaphore,
    txs: Semaphore,
    listeners: RwLock<Vec<Arc<dyn Listener>>>,
    signal: Signal,
    stop: AtomicBool,
    tx_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for Shared {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("slots", &self.slots.len())
            .field("credits", &self.credits.count())
            .field("txs", &self.txs.count())
            .finish_non_exhaustive()
    }
}

impl Shared {
    /// Takes an extra slot reference. The caller must already hold one.
    #[inline]
    fn ref_slot(&self, idx: usize) {
        let old = self.slots[idx].refs.fetch_add(1, Ordering::AcqRel);
        trace!("Conn({idx}) ref {}", old + 1);
    }

    /// Releases one slot reference.
    fn unref_slot(&self, idx: usize) {
        let r = self.slots[idx]
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        debug_assert!(r.is_ok(), "Conn({idx}) reference count underflow");
        match r {
            Ok(1) => trace!("Conn({idx}) released"),
            Ok(n) => trace!("Conn({idx}) ref {}", n - 1),
            Err(_) => error!("Conn({idx}) reference count underflow"),
        }
    }

    #[inline]
    fn listeners(&self) -> Vec<Arc<dyn Listener>> {
        self.listeners.read().clone()
    }
}

/// Connection table.
#[derive(Clone, Debug)]
pub struct Table(Arc<Shared>);

impl Table {
    /// Creates a connection table and starts its TX thread.
    pub(crate) fn new(
        cfg: Config,
        ctl: Arc<dyn Controller>,
        wq: WorkQueue,
    ) -> std::io::Result<Self> {
        let slots = (0..cfg.max_conn.max(1)).map(|_| Slot::default()).collect();
        let shared = Arc::new(Shared {
            credits: Semaphore::new(cfg.acl_pkts, cfg.acl_pkts),
            txs: Semaphore::new(cfg.tx_max, cfg.tx_max),
            cfg,
            slots,
            ctl,
            wq,
            listeners: RwLock::default(),
            signal: Signal::default(),
            stop: AtomicBool::new(false),
            tx_thread: Mutex::default(),
        });
        let h = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("warble-tx".to_owned())
                .spawn(move || tx::run(&shared))?
        };
        *shared.tx_thread.lock() = Some(h);
        Ok(Self(shared))
    }

    /// Stops the TX thread.
    pub(crate) fn shutdown(&self) {
        self.0.stop.store(true, Ordering::Release);
        self.0.signal.raise();
        self.0.credits.give();
        if let Some(h) = self.0.tx_thread.lock().take() {
            if h.thread().id() != thread::current().id() {
                let _ = h.join();
            }
        }
    }

    /// Returns the table configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.0.cfg
    }

    /// Registers a connection event listener.
    pub fn register(&self, l: Arc<dyn Listener>) {
        self.0.listeners.write().push(l);
    }

    /// Returns the number of available controller ACL buffer credits.
    #[inline]
    #[must_use]
    pub fn credits(&self) -> usize {
        self.0.credits.count()
    }

    /// Returns the number of free TX contexts.
    #[inline]
    #[must_use]
    pub fn free_txs(&self) -> usize {
        self.0.txs.count()
    }

    /// Claims a free slot for an LE connection to `peer`. The returned handle
    /// is the only reference and the connection is in the `Disconnected`
    /// state.
    pub fn add_le(&self, id: u8, peer: Addr) -> Result<Conn> {
        for (idx, s) in self.0.slots.iter().enumerate() {
            if (s.refs.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)).is_err() {
                continue;
            }
            *s.link.lock() = Link {
                id,
                dst: peer,
                ..Link::default()
            };
            s.deferred.cancel();
            debug_assert!(s.tx.lock().is_idle());
            trace!("Conn({idx}) claimed for {peer}");
            return Ok(Conn {
                shared: Arc::clone(&self.0),
                idx,
            });
        }
        warn!("No free connection slots");
        Err(Error::NoResources)
    }

    /// Initiates an LE connection to `peer` as a central.
    pub fn create_le(&self, id: u8, peer: Addr, p: &ConnParams) -> Result<Conn> {
        if !p.is_valid() {
            return Err(Error::InvalidArgument);
        }
        if self.exists_le(id, peer) || self.lookup_state_le(id, None, State::Connect).is_some() {
            return Err(Error::Already);
        }
        let conn = self.add_le(id, peer)?;
        conn.slot().link.lock().params = *p;
        conn.set_state(State::Connect);
        if let Err(e) = self.0.ctl.le_create_conn(Some(peer), p) {
            conn.slot().link.lock().err = None;
            conn.set_state(State::Disconnected);
            return Err(e.into());
        }
        Ok(conn)
    }

    /// Creates a connection object that waits for `peer` to be found by
    /// scanning. Call [`Conn::scan_matched`] to start the actual connection
    /// attempt.
    pub fn create_le_scan(&self, id: u8, peer: Addr, p: &ConnParams) -> Result<Conn> {
        if !p.is_valid() {
            return Err(Error::InvalidArgument);
        }
        if self.exists_le(id, peer) {
            return Err(Error::Already);
        }
        let conn = self.add_le(id, peer)?;
        conn.slot().link.lock().params = *p;
        conn.set_state(State::ConnectScan);
        Ok(conn)
    }

    /// Starts connecting to any device on the controller's filter accept
    /// list.
    pub fn create_auto(&self, id: u8, p: &ConnParams) -> Result<()> {
        if !p.is_valid() {
            return Err(Error::InvalidArgument);
        }
        if self.lookup_state_le(id, None, State::ConnectAuto).is_some() {
            return Err(Error::Already);
        }
        let conn = self.add_le(id, Addr::default())?;
        conn.slot().link.lock().params = *p;
        conn.set_state(State::ConnectAuto);
        if let Err(e) = self.0.ctl.le_create_conn(None, p) {
            conn.set_state(State::Disconnected);
            return Err(e.into());
        }
        Ok(())
    }

    /// Stops automatic connection establishment.
    pub fn create_auto_stop(&self) -> Result<()> {
        let conn = (self.find(|_, l| l.typ == Type::Le && l.state == State::ConnectAuto))
            .ok_or(Error::InvalidArgument)?;
        conn.set_state(State::Disconnected);
        self.0.ctl.le_create_conn_cancel()?;
        Ok(())
    }

    /// Creates a connection object for connectable advertising. A directed
    /// advertisement only accepts `directed` as the peer.
    pub fn adv_conn(&self, id: u8, directed: Option<Addr>) -> Result<Conn> {
        let conn = self.add_le(id, directed.unwrap_or_default())?;
        {
            let mut l = conn.slot().link.lock();
            l.role = Role::Peripheral;
        }
        conn.set_state(if directed.is_some() {
            State::ConnectDirAdv
        } else {
            State::ConnectAdv
        });
        Ok(conn)
    }

    /// Releases connection objects of stopped advertisements. `timeout`
    /// indicates that a directed advertisement expired without a connection.
    pub fn adv_stop(&self, id: u8, timeout: bool) {
        while let Some(conn) = self.find(|_, l| {
            l.id == id && matches!(l.state, State::ConnectAdv | State::ConnectDirAdv)
        }) {
            if timeout && conn.state() == State::ConnectDirAdv {
                conn.set_err(Status::AdvertisingTimeout);
            }
            conn.set_state(State::Disconnected);
        }
    }

    /// Returns the connection that the controller knows by handle `cn`.
    #[must_use]
    pub fn lookup_handle(&self, cn: ConnHandle) -> Option<Conn> {
        self.find(|_, l| {
            matches!(
                l.state,
                State::Connected | State::Disconnect | State::DisconnectComplete
            ) && l.handle == Some(cn)
        })
    }

    /// Returns an LE connection object for the specified peer in any state.
    #[must_use]
    pub fn lookup_addr_le(&self, id: u8, peer: Addr) -> Option<Conn> {
        self.find(|_, l| l.typ == Type::Le && l.id == id && l.dst == peer)
    }

    /// Returns an LE connection object in state `st`, optionally matching the
    /// peer address.
    #[must_use]
    pub fn lookup_state_le(&self, id: u8, peer: Option<Addr>, st: State) -> Option<Conn> {
        self.find(|_, l| {
            l.typ == Type::Le && l.id == id && l.state == st && peer.map_or(true, |p| l.dst == p)
        })
    }

    /// Returns whether a non-disconnected LE connection to `peer` exists.
    #[must_use]
    pub fn exists_le(&self, id: u8, peer: Addr) -> bool {
        (self.find(|_, l| {
            l.typ == Type::Le && l.id == id && l.dst == peer && l.state != State::Disconnected
        }))
        .is_some()
    }

    /// Calls `f` for every referenced connection object, optionally
    /// filtering by link type.
    pub fn foreach(&self, typ: Option<Type>, mut f: impl FnMut(&Conn)) {
        for idx in 0..self.0.slots.len() {
            let Some(conn) = Conn::try_ref(&self.0, idx) else {
                continue;
            };
            if typ.map_or(true, |t| conn.typ() == t) {
                f(&conn);
            }
        }
    }

    /// Returns the first referenced connection matching the predicate.
    fn find(&self, mut f: impl FnMut(usize, &Link) -> bool) -> Option<Conn> {
        (0..self.0.slots.len()).find_map(|idx| {
            let conn = Conn::try_ref(&self.0, idx)?;
            let ok = f(idx, &conn.slot().link.lock());
            ok.then_some(conn)
        })
    }
}

/// Reference to a connection slot. Cloning takes a new reference and
/// dropping releases it.
pub struct Conn {
    shared: Arc<Shared>,
    idx: usize,
}

impl Conn {
    /// Takes a reference to slot `idx` unless the slot is free.
    fn try_ref(shared: &Arc<Shared>, idx: usize) -> Option<Self> {
        let r = shared.slots[idx]
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            });
        r.ok().map(|_| Self {
            shared: Arc::clone(shared),
            idx,
        })
    }

    #[inline(always)]
    fn slot(&self) -> &Slot {
        &self.shared.slots[self.idx]
    }

    /// Returns the slot index, which is unique among live connections.
    #[inline(always)]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.idx
    }

    /// Returns the current reference count.
    #[inline]
    #[must_use]
    pub fn refs(&self) -> usize {
        self.slot().refs.load(Ordering::Acquire)
    }

    /// Returns the connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> State {
        self.slot().link.lock().state
    }

    /// Returns the controller connection handle if it is valid in the current
    /// state.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> Option<ConnHandle> {
        let l = self.slot().link.lock();
        l.handle.filter(|_| l.state.has_handle())
    }

    /// Returns the peer address.
    #[inline]
    #[must_use]
    pub fn dst(&self) -> Addr {
        self.slot().link.lock().dst
    }

    /// Returns the local identity.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u8 {
        self.slot().link.lock().id
    }

    /// Returns the local role.
    #[inline]
    #[must_use]
    pub fn role(&self) -> Role {
        self.slot().link.lock().role
    }

    /// Returns the link type.
    #[inline]
    #[must_use]
    pub fn typ(&self) -> Type {
        self.slot().link.lock().typ
    }

    /// Returns the current security level.
    #[inline]
    #[must_use]
    pub fn security(&self) -> SecurityLevel {
        self.slot().link.lock().sec_level
    }

    /// Returns a snapshot of connection properties.
    #[must_use]
    pub fn info(&self) -> Info {
        let l = self.slot().link.lock();
        Info {
            typ: l.typ,
            role: l.role,
            id: l.id,
            dst: l.dst,
            handle: l.handle.filter(|_| l.state.has_handle()),
            interval: l.interval,
            latency: l.latency,
            timeout: l.timeout,
            security: l.sec_level,
        }
    }

    /// Sends an L2CAP basic frame on channel `cid`.
    pub fn send_l2cap(&self, cid: u16, payload: &[u8], cb: Option<TxCallback>) -> Result<()> {
        let Ok(n) = u16::try_from(payload.len()) else {
            return Err(Error::InvalidArgument);
        };
        let mut b = StructBuf::new(L2CAP_HDR + payload.len());
        b.append().u16(n).u16(cid).put(payload);
        self.send(b.as_ref().to_vec(), cb)
    }

    /// Terminates the connection or cancels its establishment.
    pub fn disconnect(&self, reason: Status) -> Result<()> {
        match self.state() {
            State::ConnectScan => {
                self.set_err(reason);
                self.set_state(State::Disconnected);
                Ok(())
            }
            State::ConnectDirAdv => {
                self.set_err(reason);
                self.set_state(State::Disconnected);
                Ok(())
            }
            State::Connect => Ok(self.shared.ctl.le_create_conn_cancel()?),
            State::Connected => {
                let cn = self.handle().ok_or(Error::NotConnected)?;
                self.shared.ctl.disconnect(cn, reason)?;
                if self.state() == State::Connected {
                    self.set_state(State::Disconnect);
                }
                Ok(())
            }
            State::Disconnect => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }

    /// Starts the connection attempt for a connection object created with
    /// [`Table::create_le_scan`] once the peer was seen.
    pub fn scan_matched(&self) -> Result<()> {
        let (st, dst, p) = {
            let l = self.slot().link.lock();
            (l.state, l.dst, l.params)
        };
        if st != State::ConnectScan {
            return Err(Error::InvalidArgument);
        }
        if let Err(e) = self.shared.ctl.le_create_conn(Some(dst), &p) {
            self.set_err(Status::UnspecifiedError);
            self.set_state(State::Disconnected);
            return Err(e.into());
        }
        self.set_state(State::Connect);
        Ok(())
    }

    /// Requests new LE connection parameters. A peripheral defers the
    /// request until the connection update timer expires.
    pub fn le_param_update(&self, p: &ConnParams) -> Result<()> {
        if !p.is_valid() {
            return Err(Error::InvalidArgument);
        }
        let (role, cn) = {
            let mut l = self.slot().link.lock();
            if l.state != State::Connected {
                return Err(Error::NotConnected);
            }
            if p.is_met_by(l.interval, l.latency, l.timeout) {
                l.flags.remove(Flags::PERIPHERAL_PARAM_SET);
                return Err(Error::Already);
            }
            if l.role == Role::Peripheral && !l.flags.contains(Flags::PERIPHERAL_PARAM_UPDATE) {
                l.params = *p;
                l.flags.insert(Flags::PERIPHERAL_PARAM_SET);
                debug!("{self:?} deferring parameter update");
                return Ok(());
            }
            (l.role, l.handle)
        };
        debug!("{self:?} {role} parameter update: {p:?}");
        let cn = cn.ok_or(Error::NotConnected)?;
        Ok(self.shared.ctl.le_conn_update(cn, p)?)
    }

    /// Requests an upgrade to security level `level`. With `force_pair`, the
    /// request is issued even if the current level is sufficient.
    pub fn set_security(&self, level: SecurityLevel, force_pair: bool) -> Result<()> {
        let cn = {
            let mut l = self.slot().link.lock();
            if l.state != State::Connected {
                return Err(Error::NotConnected);
            }
            if !force_pair && (l.sec_level >= level || l.required_sec_level >= level) {
                return Ok(());
            }
            l.flags.set(Flags::FORCE_PAIR, force_pair);
            l.required_sec_level = level;
            l.handle.ok_or(Error::NotConnected)?
        };
        self.shared.ctl.start_security(cn, level).map_err(|e| {
            let mut l = self.slot().link.lock();
            l.required_sec_level = l.sec_level;
            l.flags.remove(Flags::FORCE_PAIR);
            Error::from(e)
        })
    }

    /// Records the status that caused the current or next transition.
    pub(crate) fn set_err(&self, err: Status) {
        self.slot().link.lock().err = Some(err);
    }

    /// Records link properties reported by the controller when the connection
    /// is established.
    pub(crate) fn set_link(
        &self,
        cn: ConnHandle,
        role: Role,
        peer: Addr,
        interval: u16,
        latency: u16,
        timeout: u16,
    ) {
        let mut l = self.slot().link.lock();
        l.handle = Some(cn);
        l.role = role;
        l.dst = peer;
        l.err = None;
        (l.interval, l.latency, l.timeout) = (interval, latency, timeout);
    }

    /// Changes connection state and performs the associated side effects.
    pub(crate) fn set_state(&self, new: State) {
        let (old, role, err) = {
            let mut l = self.slot().link.lock();
            if l.state == new {
                warn!("{self:?} no transition {new}");
                return;
            }
            let old = l.state;
            l.state = new;
            (old, l.role, l.err)
        };
        debug!("{self:?} {old} -> {new}");

        if old == State::Disconnected {
            // State machine reference, released when Disconnected is reached
            // again.
            self.shared.ref_slot(self.idx);
        } else if old == State::Connect {
            self.slot().deferred.cancel();
        }

        match new {
            State::Connected => {
                self.slot().tx.lock().reset();
                if role == Role::Peripheral {
                    self.schedule_deferred(self.shared.cfg.conn_update_timeout);
                }
            }
            State::Disconnected => match old {
                State::DisconnectComplete => {
                    self.tx_notify();
                    self.slot().deferred.cancel();
                    self.slot().link.lock().flags.insert(Flags::CLEANUP);
                    self.shared.signal.raise();
                }
                State::Connect | State::ConnectScan | State::ConnectDirAdv => {
                    if err.is_some() {
                        self.notify_connected();
                    }
                    self.shared.unref_slot(self.idx);
                }
                State::ConnectAuto | State::ConnectAdv => self.shared.unref_slot(self.idx),
                State::Connected | State::Disconnect | State::Disconnected => {
                    warn!("{self:?} invalid {old} -> {new} transition");
                }
            },
            State::Connect => self.schedule_deferred(self.shared.cfg.create_conn_timeout),
            State::DisconnectComplete => self.process_unack_tx(),
            State::ConnectAuto
            | State::ConnectAdv
            | State::ConnectScan
            | State::ConnectDirAdv
            | State::Disconnect => {}
        }
    }

    /// Notifies listeners about connection establishment or failure.
    pub(crate) fn notify_connected(&self) {
        let err = self.slot().link.lock().err;
        for l in self.shared.listeners() {
            l.connected(self, err);
        }
    }

    /// Updates connection parameters reported by the controller.
    pub(crate) fn param_updated(&self, interval: u16, latency: u16, timeout: u16) {
        {
            let mut l = self.slot().link.lock();
            (l.interval, l.latency, l.timeout) = (interval, latency, timeout);
            if l.flags.contains(Flags::PERIPHERAL_PARAM_SET)
                && l.params.is_met_by(interval, latency, timeout)
            {
                l.flags.remove(Flags::PERIPHERAL_PARAM_SET);
            }
        }
        for l in self.shared.listeners() {
            l.param_updated(self, interval, latency, timeout);
        }
    }

    /// Handles an encryption change reported by the controller.
    pub(crate) fn security_changed(&self, status: Status, enabled: bool) {
        let level = {
            let mut l = self.slot().link.lock();
            if status.is_ok() {
                l.sec_level = if enabled {
                    l.required_sec_level.max(SecurityLevel::L2)
                } else {
                    SecurityLevel::L1
                };
            }
            l.required_sec_level = l.sec_level;
            l.flags.remove(Flags::FORCE_PAIR);
            l.sec_level
        };
        let err = (!status.is_ok()).then_some(status);
        for l in self.shared.listeners() {
            l.security_changed(self, level, err);
        }
    }

    /// Schedules deferred connection work.
    fn schedule_deferred(&self, delay: Duration) {
        let (shared, idx) = (Arc::clone(&self.shared), self.idx);
        (self.slot().deferred).schedule(&self.shared.wq, delay, move || {
            if let Some(conn) = Self::try_ref(&shared, idx) {
                conn.deferred_work();
            }
        });
    }

    /// Finishes disconnection, cancels a timed-out connection attempt, or
    /// sends deferred peripheral connection parameters.
    fn deferred_work(&self) {
        let (st, typ, role, reason) = {
            let l = self.slot().link.lock();
            (l.state, l.typ, l.role, l.err.unwrap_or_default())
        };
        if st == State::Disconnected {
            self.tx_notify();
            for l in self.shared.listeners() {
                l.disconnected(self, reason);
            }
            // Release the state machine reference
            self.shared.unref_slot(self.idx);
            return;
        }
        if typ != Type::Le {
            return;
        }
        if role == Role::Central {
            if st == State::Connect {
                debug!("{self:?} connection attempt timed out");
                if let Err(e) = self.shared.ctl.le_create_conn_cancel() {
                    warn!("{self:?} failed to cancel connection attempt: {e}");
                }
            }
            return;
        }
        let update = {
            let mut l = self.slot().link.lock();
            let set = l.flags.contains(Flags::PERIPHERAL_PARAM_SET);
            l.flags.remove(Flags::PERIPHERAL_PARAM_SET);
            l.flags.insert(Flags::PERIPHERAL_PARAM_UPDATE);
            (set && l.state == State::Connected)
                .then_some((l.handle, l.params))
                .and_then(|(cn, p)| cn.map(|cn| (cn, p)))
        };
        if let Some((cn, p)) = update {
            debug!("{self:?} sending deferred parameter update: {p:?}");
            if let Err(e) = self.shared.ctl.le_conn_update(cn, &p) {
                warn!("{self:?} parameter update failed: {e}");
            }
        }
    }
}

impl Clone for Conn {
    #[inline]
    fn clone(&self) -> Self {
        self.shared.ref_slot(self.idx);
        Self {
            shared: Arc::clone(&self.shared),
            idx: self.idx,
        }
    }
}

impl Drop for Conn {
    #[inline]
    fn drop(&mut self) {
        self.shared.unref_slot(self.idx);
    }
}

impl PartialEq for Conn {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared) && self.idx == other.idx
    }
}

impl Eq for Conn {}

impl Debug for Conn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Conn({})", self.idx)
    }
}
