//! Generic Attribute Profile ([Vol 3] Part G).
//!
//! [`Gatt`] owns the local attribute database and the client role state of
//! all connections. Services are registered and unregistered at runtime;
//! every change is announced to subscribed peers through a single batched
//! Service Changed indication.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

pub use {ccc::*, client::*, db::*, store::*};

use crate::att::{self, Att, CfmCallback, Handle, HandleRange, Opcode, PduType};
use crate::conn::{self, Conn, State, Table, TxCallback};
use crate::gap::Uuid;
use crate::le::{Addr, Bonds};
use crate::util::{DelayedWork, WorkQueue};
use crate::PeerStore;

use self::sc::{Action, ServiceChanged};
use self::server::Prepared;

mod ccc;
mod client;
mod db;
mod sc;
mod server;
mod store;


/// Error type returned by the GATT layer.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Att(#[from] att::Error),
    #[error(transparent)]
    Conn(#[from] conn::Error),
    #[error("already registered or subscribed")]
    Already,
    #[error("not found")]
    NotFound,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("handle {0} conflicts with existing attributes")]
    InvalidHandle(Handle),
    #[error("no connected peer")]
    NotConnected,
    #[error("attribute handles exhausted")]
    NoHandles,
    #[error("peer store failure")]
    Store,
}

/// Common GATT result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Indication completion callback. Called once for every peer that was sent
/// the indication.
pub type IndicateCallback = Arc<dyn Fn(&Conn, att::Result<()>) + Send + Sync>;

/// Peer store holding CCC values of bonded peers.
pub type CccStore = Arc<dyn PeerStore<Value = CccRecord>>;

/// GATT configuration.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    /// Local ATT_MTU offered in an MTU exchange.
    pub att_mtu: u16,
    /// Number of peers that can configure each CCC descriptor.
    pub ccc_max: usize,
    /// Number of queued writes per connection. Prepare and Execute Write
    /// requests are not supported if zero.
    pub prepare_max: usize,
    /// Debounce delay for Service Changed indications.
    pub sc_delay: Duration,
    /// Delay before CCC changes of bonded peers are stored.
    pub ccc_store_delay: Duration,
    /// GAP Device Name characteristic value.
    pub device_name: String,
    /// GAP Appearance characteristic value.
    pub appearance: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            att_mtu: 65,
            ccc_max: 8,
            prepare_max: 8,
            sc_delay: Duration::from_millis(10),
            ccc_store_delay: Duration::from_secs(1),
            device_name: "warble".to_owned(),
            appearance: 0,
        }
    }
}

pub(crate) struct Inner {
    cfg: Config,
    db: RwLock<Db>,
    att: Att,
    conns: Table,
    wq: WorkQueue,
    bonds: Arc<Bonds>,
    store: RwLock<Option<CccStore>>,
    sc: ServiceChanged,
    ccc_queue: Mutex<Vec<Conn>>,
    ccc_work: DelayedWork,
    prepared: Mutex<HashMap<usize, Vec<Prepared>>>,
    client: Client,
}

/// GATT server database and client state.
#[derive(Clone)]
pub struct Gatt(Arc<Inner>);

impl Gatt {
    /// Creates a GATT instance with the mandatory GAP and GATT services
    /// registered.
    pub(crate) fn new(mut cfg: Config, att: Att, conns: Table, wq: WorkQueue, bonds: Arc<Bonds>) -> Self {
        if cfg.att_mtu < att::DEFAULT_MTU {
            warn!("ATT_MTU {} raised to {}", cfg.att_mtu, att::DEFAULT_MTU);
            cfg.att_mtu = att::DEFAULT_MTU;
        }
        let client = Client::new(att.clone(), cfg.att_mtu);
        Self(Arc::new(Inner {
            db: RwLock::new(Db::new(&cfg)),
            cfg,
            att,
            conns,
            wq,
            bonds,
            store: RwLock::default(),
            sc: ServiceChanged::default(),
            ccc_queue: Mutex::default(),
            ccc_work: DelayedWork::default(),
            prepared: Mutex::default(),
            client,
        }))
    }

    /// Returns a reference that does not keep the GATT instance alive.
    #[inline]
    pub(crate) fn downgrade(&self) -> WeakGatt {
        WeakGatt(Arc::downgrade(&self.0))
    }

    /// Returns the GATT configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.0.cfg
    }

    /// Returns the client role interface.
    #[inline]
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.0.client
    }

    /// Sets the store used to persist CCC values of bonded peers.
    pub fn set_store(&self, store: CccStore) {
        *self.0.store.write() = Some(store);
    }

    /// Registers a service and schedules a Service Changed indication for its
    /// handle range.
    pub fn register(&self, svc: Service) -> Result<ServiceId> {
        let (id, r) = self.0.db.write().register(svc)?;
        self.sc_changed(r);
        Ok(id)
    }

    /// Unregisters a service and schedules a Service Changed indication for
    /// its former handle range.
    pub fn unregister(&self, id: ServiceId) -> Result<()> {
        let r = self.0.db.write().unregister(id)?;
        self.sc_changed(r);
        Ok(())
    }

    /// Returns the handle range of a registered service.
    #[must_use]
    pub fn service_range(&self, id: ServiceId) -> Option<HandleRange> {
        self.0.db.read().range(id)
    }

    /// Returns the value handle of the first characteristic with UUID `uuid`
    /// in a registered service.
    #[must_use]
    pub fn value_handle(&self, id: ServiceId, uuid: impl Into<Uuid>) -> Option<Handle> {
        self.0.db.read().value_handle(id, uuid.into())
    }

    /// Returns the consolidated value of the CCC descriptor at `hdl`.
    #[must_use]
    pub fn ccc_value(&self, hdl: Handle) -> Option<Cccd> {
        let view = self.0.db.read().view();
        let at = view.find(hdl)?.first()?;
        match at.kind {
            Kind::Ccc(ref c) => Some(c.value()),
            _ => None,
        }
    }

    /// Sends a notification. `hdl` may refer to a characteristic declaration
    /// or value. Without `conn`, the notification is sent to every connected
    /// peer that enabled notifications.
    pub fn notify(&self, conn: Option<&Conn>, hdl: Handle, data: &[u8]) -> Result<()> {
        let (vh, ccc) = self.resolve(hdl, CharProps::NOTIFY, data)?;
        let pdu = att::pdu(Opcode::HandleValueNtf, |p| {
            p.u16(vh).put(data);
        });
        if let Some(c) = conn {
            return Ok(self.0.att.send(c, &pdu, None)?);
        }
        let mut reached = false;
        for cfg in ccc.ok_or(Error::NotFound)?.entries() {
            if cfg.value != Cccd::NOTIFY {
                continue;
            }
            let Some(c) = self.0.conns.lookup_state_le(cfg.id, Some(cfg.peer), State::Connected) else {
                continue;
            };
            self.0.att.send(&c, &pdu, None)?;
            reached = true;
        }
        reached.then_some(()).ok_or(Error::NotConnected)
    }

    /// Sends a notification to one peer, calling `cb` when the controller
    /// acknowledges it.
    pub fn notify_cb(&self, conn: &Conn, hdl: Handle, data: &[u8], cb: TxCallback) -> Result<()> {
        let (vh, _) = self.resolve(hdl, CharProps::NOTIFY, data)?;
        let pdu = att::pdu(Opcode::HandleValueNtf, |p| {
            p.u16(vh).put(data);
        });
        Ok(self.0.att.send(conn, &pdu, Some(cb))?)
    }

    /// Sends an indication. `hdl` may refer to a characteristic declaration
    /// or value. Without `conn`, the indication is sent to every connected
    /// peer that enabled indications. `cb` is called once for each peer.
    pub fn indicate(
        &self,
        conn: Option<&Conn>,
        hdl: Handle,
        data: &[u8],
        cb: Option<IndicateCallback>,
    ) -> Result<()> {
        let mk = || -> CfmCallback {
            let cb = cb.clone();
            Box::new(move |c: &Conn, r: att::Result<()>| {
                if let Some(f) = cb {
                    f(c, r);
                }
            })
        };
        self.send_ind(conn, hdl, data, mk, None).map(|_| ())
    }

    /// Stores the CCC values of a bonded peer.
    pub fn store_ccc(&self, id: u8, peer: Addr) -> Result<()> {
        let Some(store) = self.store() else {
            return Ok(());
        };
        let rec = self.ccc_record(id, peer);
        if store.save(id, peer, &rec) {
            debug!("Stored {} CCC value(s) for {peer}", rec.ccc.len());
            Ok(())
        } else {
            error!("Failed to store CCC values for {peer}");
            Err(Error::Store)
        }
    }

    /// Removes stored and in-memory CCC values of a peer.
    pub fn clear_ccc(&self, id: u8, peer: Addr) {
        if let Some(store) = self.store() {
            store.remove(id, peer);
        }
        for (_, c) in self.0.db.read().view().cccs() {
            c.clear(id, peer);
        }
    }

    /// Restores the stored CCC values of a peer. Values for handles that no
    /// longer exist are skipped. The peer's CCC values are cleared if
    /// nothing is stored.
    pub fn load_ccc(&self, id: u8, peer: Addr) {
        let rec = self.store().and_then(|s| s.load(id, peer));
        let view = self.0.db.read().view();
        let Some(rec) = rec else {
            for (_, c) in view.cccs() {
                c.clear(id, peer);
            }
            return;
        };
        for &(hdl, v) in rec.ccc.iter().take(CCC_STORE_MAX) {
            let Some((_, c)) = view.cccs().find(|&(h, _)| h == hdl) else {
                debug!("Unable to restore CCC: {hdl} not found");
                continue;
            };
            let sc = if c.is_sc() { rec.sc } else { None };
            if !c.restore(id, peer, v, sc) {
                debug!("Unable to restore CCC {hdl}: no free entries");
            }
        }
    }

    /// Processes an ATT PDU received from `conn`.
    pub(crate) fn recv(&self, conn: &Conn, pdu: &[u8]) {
        let Some(op) = self.0.att.recv(conn, pdu) else {
            return;
        };
        let params = &pdu[1..];
        match op.typ() {
            PduType::Req | PduType::Cmd => self.handle_req(conn, op, params),
            PduType::Ntf | PduType::Ind => {
                let hdl = (params.get(..2)).and_then(|v| Handle::new(u16::from_le_bytes([v[0], v[1]])));
                match hdl {
                    Some(hdl) => self.0.client.notification(conn, hdl, &params[2..]),
                    None => warn!("{conn:?} invalid {op}"),
                }
                if op == Opcode::HandleValueInd {
                    let cfm = [u8::from(Opcode::HandleValueCfm)];
                    if let Err(e) = self.0.att.send(conn, &cfm, None) {
                        warn!("{conn:?} failed to confirm indication: {e}");
                    }
                }
            }
            PduType::Rsp | PduType::Cfm => {}
        }
    }

    /// Updates CCC state and client subscriptions for a new connection.
    pub(crate) fn connected(&self, conn: &Conn) {
        let (id, peer) = (conn.id(), conn.dst());
        for (_, c) in self.0.db.read().view().cccs() {
            if let Some(r) = c.connected(id, peer) {
                debug!("{conn:?} replaying Service Changed {r}");
                self.sc_changed(r);
            }
        }
        self.0.client.connected(conn);
    }

    /// Updates CCC state and client subscriptions after a disconnection.
    pub(crate) fn disconnected(&self, conn: &Conn) {
        let (id, peer) = (conn.id(), conn.dst());
        let bonded = self.0.bonds.contains(id, peer);
        let conns = &self.0.conns;
        for (_, c) in self.0.db.read().view().cccs() {
            c.disconnected(id, peer, bonded, |cfg| {
                (conns.lookup_state_le(cfg.id, Some(cfg.peer), State::Connected)).is_some()
            });
        }
        {
            let mut q = self.0.ccc_queue.lock();
            q.retain(|c| c != conn);
            if q.is_empty() {
                self.0.ccc_work.cancel();
            }
        }
        self.0.prepared.lock().remove(&conn.index());
        if bonded {
            if let Err(e) = self.store_ccc(id, peer) {
                warn!("{conn:?} CCC store on disconnect failed: {e}");
            }
        }
        self.0.client.disconnected(conn, bonded);
    }

    /// Returns the value handle and CCC descriptor of the characteristic
    /// containing `hdl`.
    fn resolve(&self, hdl: Handle, prop: CharProps, data: &[u8]) -> Result<(Handle, Option<Arc<Ccc>>)> {
        if data.len() > att::MAX_VAL_LEN {
            return Err(Error::InvalidArgument);
        }
        let view = self.0.db.read().view();
        let attrs = view.find(hdl).ok_or(Error::NotFound)?;
        let attrs = match attrs[0].kind {
            Kind::Characteristic { props, .. } if !props.contains(prop) => {
                return Err(Error::InvalidArgument)
            }
            Kind::Characteristic { .. } => &attrs[1..],
            _ => attrs,
        };
        let value = attrs.first().ok_or(Error::NotFound)?.handle();
        let ccc = (attrs.iter().skip(1))
            .take_while(|at| !matches!(at.kind, Kind::Characteristic { .. }))
            .find_map(|at| match at.kind {
                Kind::Ccc(ref c) => Some(Arc::clone(c)),
                _ => None,
            });
        Ok((value, ccc))
    }

    /// Sends an indication to one or all subscribed peers, calling `mk` to
    /// create the completion callback for each one. For the Service Changed
    /// characteristic, `sc` is merged into the saved range of subscribed
    /// peers that are not connected. Returns the number of peers reached.
    fn send_ind(
        &self,
        conn: Option<&Conn>,
        hdl: Handle,
        data: &[u8],
        mut mk: impl FnMut() -> CfmCallback,
        sc: Option<HandleRange>,
    ) -> Result<usize> {
        let (vh, ccc) = self.resolve(hdl, CharProps::INDICATE, data)?;
        let pdu = att::pdu(Opcode::HandleValueInd, |p| {
            p.u16(vh).put(data);
        });
        if let Some(c) = conn {
            self.0.att.indicate(c, pdu, mk())?;
            return Ok(1);
        }
        let ccc = ccc.ok_or(Error::NotFound)?;
        let mut n = 0;
        for cfg in ccc.entries() {
            if cfg.value != Cccd::INDICATE {
                continue;
            }
            let Some(c) = self.0.conns.lookup_state_le(cfg.id, Some(cfg.peer), State::Connected) else {
                if let (true, Some(r)) = (ccc.is_sc(), sc) {
                    ccc.save_sc(cfg.id, cfg.peer, r);
                    if self.0.bonds.contains(cfg.id, cfg.peer) {
                        if let Err(e) = self.store_ccc(cfg.id, cfg.peer) {
                            warn!("Service Changed range not stored for {}: {e}", cfg.peer);
                        }
                    }
                }
                continue;
            };
            match self.0.att.indicate(&c, pdu.clone(), mk()) {
                Ok(()) => n += 1,
                Err(e) => warn!("{c:?} indication failed: {e}"),
            }
        }
        if n == 0 {
            return Err(Error::NotConnected);
        }
        Ok(n)
    }

    /// Adds a changed database range to the next Service Changed indication.
    fn sc_changed(&self, r: HandleRange) {
        match self.0.sc.changed(r) {
            Action::Schedule => self.schedule_sc(self.0.cfg.sc_delay),
            Action::Now => self.schedule_sc(Duration::ZERO),
            Action::None => {}
        }
    }

    fn schedule_sc(&self, delay: Duration) {
        let w = Arc::downgrade(&self.0);
        (self.0.sc.work).schedule(&self.0.wq, delay, move || {
            if let Some(inner) = Weak::upgrade(&w) {
                Self(inner).sc_process();
            }
        });
    }

    /// Sends the accumulated Service Changed range to all subscribers.
    fn sc_process(&self) {
        let Some(r) = self.0.sc.take() else {
            return;
        };
        debug!("Indicating Service Changed {r}");
        let data = {
            let (s, e) = (u16::from(r.start()), u16::from(r.end()));
            let (s, e) = (s.to_le_bytes(), e.to_le_bytes());
            [s[0], s[1], e[0], e[1]]
        };
        let done = Arc::new(ScDone(Arc::downgrade(&self.0)));
        let mk = || -> CfmCallback {
            let done = Arc::clone(&done);
            Box::new(move |c: &Conn, r: att::Result<()>| {
                if let Err(e) = r {
                    debug!("{c:?} Service Changed indication failed: {e}");
                }
                drop(done);
            })
        };
        let n = self.send_ind(None, Db::SC_VALUE, &data, mk, Some(r)).unwrap_or(0);
        self.0.sc.sent(n > 0);
        drop(done);
    }

    /// Queues a delayed CCC store after a bonded peer changed its
    /// configuration.
    fn queue_ccc_store(&self, conn: &Conn) {
        if !self.0.bonds.contains(conn.id(), conn.dst()) {
            return;
        }
        let mut q = self.0.ccc_queue.lock();
        if q.contains(conn) {
            return;
        }
        q.push(conn.clone());
        let w = Arc::downgrade(&self.0);
        (self.0.ccc_work).schedule(&self.0.wq, self.0.cfg.ccc_store_delay, move || {
            if let Some(inner) = Weak::upgrade(&w) {
                Self(inner).ccc_delayed_store();
            }
        });
    }

    fn ccc_delayed_store(&self) {
        let q = std::mem::take(&mut *self.0.ccc_queue.lock());
        for c in q {
            if self.0.bonds.contains(c.id(), c.dst()) {
                if let Err(e) = self.store_ccc(c.id(), c.dst()) {
                    warn!("{c:?} delayed CCC store failed: {e}");
                }
            }
        }
    }

    fn ccc_record(&self, id: u8, peer: Addr) -> CccRecord {
        let mut rec = CccRecord::default();
        for (hdl, c) in self.0.db.read().view().cccs() {
            let Some(cfg) = (c.entries().into_iter()).find(|e| e.id == id && e.peer == peer) else {
                continue;
            };
            if rec.ccc.len() < CCC_STORE_MAX {
                rec.ccc.push((hdl, cfg.value));
            }
            if c.is_sc() {
                rec.sc = cfg.sc;
            }
        }
        rec
    }

    fn store(&self) -> Option<CccStore> {
        self.0.store.read().clone()
    }
}

impl std::fmt::Debug for Gatt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gatt")
            .field("db", &*self.0.db.read())
            .finish_non_exhaustive()
    }
}

/// Non-owning [`Gatt`] reference held by connection listeners.
#[derive(Clone, Debug)]
pub(crate) struct WeakGatt(Weak<Inner>);

impl WeakGatt {
    #[inline]
    pub fn upgrade(&self) -> Option<Gatt> {
        self.0.upgrade().map(Gatt)
    }
}

/// Completes a Service Changed indication when the last peer callback is
/// dropped.
struct ScDone(Weak<Inner>);

impl Drop for ScDone {
    fn drop(&mut self) {
        let Some(inner) = Weak::upgrade(&self.0) else {
            return;
        };
        if inner.sc.confirmed() == Action::Now {
            Gatt(inner).schedule_sc(Duration::ZERO);
        }
    }
}
