//! Host glue ([Vol 1] Part A, Section 2).
//!
//! [`Host`] owns the system work queue, the connection table with its TX
//! thread, the ATT bearers, and the GATT instance. The transport delivers
//! HCI event and ACL data packets through [`Host::handle_event`] and
//! [`Host::handle_acl`].

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use structbuf::Unpack;
use tracing::{debug, trace, warn};

use crate::att::{self, Att, ATT_CID};
use crate::conn::{self, Conn, Listener, State, Table, Type};
use crate::gatt::{self, Gatt, WeakGatt};
use crate::hci::{self, Controller, Event, LeConnectionComplete, Role, Status};
use crate::le::{Addr, Bonds};
use crate::util::WorkQueue;


/// Error type returned by the host.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Hci(#[from] hci::Error),
    #[error(transparent)]
    Conn(#[from] conn::Error),
    #[error("failed to start host thread: {0}")]
    Io(#[from] std::io::Error),
}

/// Common host result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Host configuration.
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    #[serde(flatten)]
    pub conn: conn::Config,
    #[serde(flatten)]
    pub gatt: gatt::Config,
}

/// Bluetooth LE host.
pub struct Host {
    ctl: Arc<dyn Controller>,
    wq: WorkQueue,
    conns: Table,
    att: Att,
    gatt: Gatt,
    bonds: Arc<Bonds>,
}

impl Host {
    /// Creates a host that uses the specified controller.
    pub fn new(ctl: Arc<dyn Controller>, cfg: Config) -> Result<Self> {
        let wq = WorkQueue::new("warble-wq")?;
        let conns = Table::new(cfg.conn, Arc::clone(&ctl), wq.clone())?;
        let att = Att::new(wq.clone(), att::TIMEOUT);
        let bonds = Arc::new(Bonds::default());
        let gatt = Gatt::new(cfg.gatt, att.clone(), conns.clone(), wq.clone(), Arc::clone(&bonds));
        conns.register(Arc::new(Glue {
            att: att.clone(),
            gatt: gatt.downgrade(),
        }));
        Ok(Self {
            ctl,
            wq,
            conns,
            att,
            gatt,
            bonds,
        })
    }

    /// Returns the connection table.
    #[inline(always)]
    #[must_use]
    pub const fn conns(&self) -> &Table {
        &self.conns
    }

    /// Returns the ATT bearers.
    #[inline(always)]
    #[must_use]
    pub const fn att(&self) -> &Att {
        &self.att
    }

    /// Returns the GATT server database and client.
    #[inline(always)]
    #[must_use]
    pub const fn gatt(&self) -> &Gatt {
        &self.gatt
    }

    /// Returns the set of bonded peers.
    #[inline(always)]
    #[must_use]
    pub fn bonds(&self) -> &Bonds {
        &self.bonds
    }

    /// Adds a bonded peer known from a previous session and restores its
    /// stored CCC values.
    pub fn restore_bond(&self, id: u8, peer: Addr) {
        self.bonds.add(id, peer);
        self.gatt.load_ccc(id, peer);
    }

    /// Removes a bond along with its stored and in-memory CCC values.
    pub fn unpair(&self, id: u8, peer: Addr) {
        if self.bonds.remove(id, peer) {
            debug!("Removed bond with {peer}");
        }
        self.gatt.clear_ccc(id, peer);
    }

    /// Processes an HCI event packet.
    pub fn handle_event(&self, pkt: &[u8]) -> Result<()> {
        let evt = Event::parse(pkt)?;
        trace!("{evt:?}");
        match evt {
            Event::DisconnectionComplete(e) => {
                let Some(conn) = self.conns.lookup_handle(e.handle) else {
                    warn!("Disconnection Complete for unknown {}", e.handle);
                    return Ok(());
                };
                if !e.status.is_ok() {
                    warn!("{conn:?} disconnection failed: {}", e.status);
                    return Ok(());
                }
                conn.set_err(e.reason);
                conn.set_state(State::DisconnectComplete);
                conn.set_state(State::Disconnected);
            }
            Event::EncryptionChange(e) => match self.conns.lookup_handle(e.handle) {
                Some(conn) => conn.security_changed(e.status, e.enabled),
                None => warn!("Encryption Change for unknown {}", e.handle),
            },
            Event::NumberOfCompletedPackets(e) => {
                for &(cn, n) in e.as_ref() {
                    match self.conns.lookup_handle(cn) {
                        Some(conn) => conn.num_completed(n),
                        None => warn!("Completed packets for unknown {cn}"),
                    }
                }
            }
            Event::LeConnectionComplete(e) => self.le_conn_complete(&e),
            Event::LeConnectionUpdateComplete(e) => {
                let Some(conn) = self.conns.lookup_handle(e.handle) else {
                    warn!("Connection Update Complete for unknown {}", e.handle);
                    return Ok(());
                };
                if e.status.is_ok() {
                    conn.param_updated(e.interval, e.latency, e.timeout);
                } else {
                    warn!("{conn:?} parameter update failed: {}", e.status);
                }
            }
        }
        Ok(())
    }

    /// Processes an inbound ACL data packet.
    pub fn handle_acl(&self, pkt: &[u8]) -> Result<()> {
        let (cn, pb, data) = hci::acl_split(pkt)?;
        let Some(conn) = self.conns.lookup_handle(cn) else {
            warn!("ACL data for unknown {cn}");
            return Ok(());
        };
        let Some(frame) = conn.recv(data, pb) else {
            return Ok(());
        };
        let cid = (&frame[2..]).unpack().u16();
        let payload = &frame[conn::L2CAP_HDR..];
        match cid {
            ATT_CID => self.gatt.recv(&conn, payload),
            _ => trace!("{conn:?} dropped frame for CID {cid:#06X}"),
        }
        Ok(())
    }

    /// Handles LE connection establishment or failure.
    fn le_conn_complete(&self, e: &LeConnectionComplete) {
        let Some(cn) = e.handle else {
            // Cancelled attempts and expired directed advertising
            let st = match e.role {
                Role::Central => State::Connect,
                Role::Peripheral => State::ConnectDirAdv,
            };
            let Some(conn) = self.pending(|c| c.state() == st) else {
                warn!("Connection failure without a pending connection: {}", e.status);
                return;
            };
            let err = if e.status == Status::UnknownConnectionIdentifier {
                Status::ConnectionFailedToBeEstablished
            } else {
                e.status
            };
            conn.set_err(err);
            conn.set_state(State::Disconnected);
            return;
        };
        let conn = self.pending(|c| match (e.role, c.state()) {
            (Role::Central, State::Connect) | (Role::Peripheral, State::ConnectDirAdv) => {
                c.dst() == e.peer
            }
            (Role::Central, State::ConnectAuto) | (Role::Peripheral, State::ConnectAdv) => true,
            _ => false,
        });
        let Some(conn) = conn else {
            warn!("Unexpected connection {cn} from {}", e.peer);
            if let Err(err) = self.ctl.disconnect(cn, Status::RemoteUserTerminatedConnection) {
                warn!("Failed to disconnect {cn}: {err}");
            }
            return;
        };
        conn.set_link(cn, e.role, e.peer, e.interval, e.latency, e.timeout);
        conn.set_state(State::Connected);
        conn.notify_connected();
    }

    /// Returns the first pending LE connection matching the predicate.
    fn pending(&self, f: impl Fn(&Conn) -> bool) -> Option<Conn> {
        let mut found = None;
        self.conns.foreach(Some(Type::Le), |c| {
            if found.is_none() && f(c) {
                found = Some(c.clone());
            }
        });
        found
    }
}

impl Debug for Host {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("conns", &self.conns)
            .field("gatt", &self.gatt)
            .finish_non_exhaustive()
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.conns.shutdown();
        self.wq.stop();
    }
}

/// Connection listener that maintains ATT bearers and GATT state.
struct Glue {
    att: Att,
    gatt: WeakGatt,
}

impl Listener for Glue {
    fn connected(&self, conn: &Conn, err: Option<Status>) {
        if err.is_some() {
            return;
        }
        self.att.connected(conn);
        if let Some(g) = self.gatt.upgrade() {
            g.connected(conn);
        }
    }

    fn disconnected(&self, conn: &Conn, _: Status) {
        self.att.disconnected(conn);
        if let Some(g) = self.gatt.upgrade() {
            g.disconnected(conn);
        }
    }
}
