//! Client Characteristic Configuration state ([Vol 3] Part G, Section 3.3.3.3).

use std::fmt::{Debug, Formatter};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::att::{ErrorCode, Handle, HandleRange};
use crate::le::Addr;

/// Maximum number of CCC values stored for one peer.
pub const CCC_STORE_MAX: usize = 48;

bitflags::bitflags! {
    /// Client Characteristic Configuration descriptor value.
    #[derive(
        Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd,
        serde::Deserialize, serde::Serialize,
    )]
    #[repr(transparent)]
    #[serde(transparent)]
    pub struct Cccd: u16 {
        /// The Characteristic Value shall be notified.
        const NOTIFY = 0x0001;
        /// The Characteristic Value shall be indicated.
        const INDICATE = 0x0002;
    }
}

impl Cccd {
    /// Decodes a written CCC value. Only one of the two bits may be set.
    #[inline]
    #[must_use]
    pub const fn from_wire(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::empty()),
            0x0001 => Some(Self::NOTIFY),
            0x0002 => Some(Self::INDICATE),
            _ => None,
        }
    }
}

/// Callback receiving the consolidated CCC value whenever it changes.
pub type CfgChanged = Box<dyn Fn(Cccd) + Send + Sync>;

/// CCC values of one peer as saved in a [`PeerStore`](crate::PeerStore).
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CccRecord {
    /// Descriptor handles and values in ascending handle order.
    pub ccc: Vec<(Handle, Cccd)>,
    /// Database range that changed while the peer was away.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sc: Option<HandleRange>,
}

/// Per-peer configuration entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Cfg {
    pub id: u8,
    pub peer: Addr,
    pub value: Cccd,
    /// Service Changed range to indicate on reconnection.
    pub sc: Option<HandleRange>,
}

#[derive(Debug, Default)]
struct State {
    cfg: Vec<Option<Cfg>>,
    value: Cccd,
}

impl State {
    fn pos(&self, id: u8, peer: Addr) -> Option<usize> {
        (self.cfg.iter()).position(|c| matches!(c, Some(c) if c.id == id && c.peer == peer))
    }

    fn find(&mut self, id: u8, peer: Addr) -> Option<&mut Cfg> {
        (self.cfg.iter_mut().flatten()).find(|c| c.id == id && c.peer == peer)
    }

    fn max(&self) -> Cccd {
        (self.cfg.iter().flatten()).fold(Cccd::empty(), |v, c| v.max(c.value))
    }
}

/// Client Characteristic Configuration descriptor with per-peer values.
pub struct Ccc {
    st: Mutex<State>,
    changed: Option<CfgChanged>,
    sc: bool,
}

impl Ccc {
    /// Creates a descriptor with an optional consolidated value callback.
    #[must_use]
    pub(crate) fn new(changed: Option<CfgChanged>) -> Self {
        Self {
            st: Mutex::default(),
            changed,
            sc: false,
        }
    }

    /// Creates the Service Changed descriptor.
    #[must_use]
    pub(crate) fn service_changed() -> Self {
        Self {
            sc: true,
            ..Self::new(None)
        }
    }

    /// Allocates `n` configuration slots.
    pub(crate) fn init(&self, n: usize) {
        self.st.lock().cfg = vec![None; n];
    }

    /// Returns whether this is the Service Changed descriptor.
    #[inline(always)]
    #[must_use]
    pub(crate) const fn is_sc(&self) -> bool {
        self.sc
    }

    /// Returns the maximum value configured by all peers.
    #[inline]
    #[must_use]
    pub fn value(&self) -> Cccd {
        self.st.lock().value
    }

    /// Returns the value configured by the specified peer.
    #[must_use]
    pub(crate) fn peer_value(&self, id: u8, peer: Addr) -> Cccd {
        (self.st.lock().find(id, peer)).map_or(Cccd::empty(), |c| c.value)
    }

    /// Returns all configured entries.
    #[must_use]
    pub(crate) fn entries(&self) -> Vec<Cfg> {
        self.st.lock().cfg.iter().flatten().copied().collect()
    }

    /// Handles a descriptor write by a peer. Returns whether the peer's value
    /// changed.
    pub(crate) fn write(
        &self,
        id: u8,
        peer: Addr,
        off: usize,
        v: &[u8],
    ) -> Result<bool, ErrorCode> {
        if off > 2 {
            return Err(ErrorCode::InvalidOffset);
        }
        if off + v.len() != 2 {
            return Err(ErrorCode::InvalidAttributeValueLength);
        }
        // Bytes before the offset keep the peer's current value
        let mut raw = self.peer_value(id, peer).bits().to_le_bytes();
        raw[off..].copy_from_slice(v);
        let raw = u16::from_le_bytes(raw);
        let value = Cccd::from_wire(raw).ok_or(ErrorCode::ValueNotAllowed)?;
        let mut st = self.st.lock();
        let i = match st.pos(id, peer) {
            Some(i) => i,
            None if value.is_empty() => return Ok(false),
            None => {
                let Some(i) = st.cfg.iter().position(Option::is_none) else {
                    warn!("No space to store CCC for {peer}");
                    return Err(ErrorCode::InsufficientResources);
                };
                i
            }
        };
        let cfg = st.cfg[i].get_or_insert(Cfg {
            id,
            peer,
            value: Cccd::empty(),
            sc: None,
        });
        let changed = cfg.value != value;
        cfg.value = value;
        trace!("CCC {peer} value {value:?}");
        let notify = changed.then(|| Self::consolidate(&mut st)).flatten();
        if value.is_empty() {
            Self::remove(&mut st, id, peer);
        }
        drop(st);
        self.fire(notify);
        Ok(changed)
    }

    /// Recomputes the consolidated value after a configured peer connects.
    /// Returns the Service Changed range that was saved for the peer.
    pub(crate) fn connected(&self, id: u8, peer: Addr) -> Option<HandleRange> {
        let mut st = self.st.lock();
        let cfg = st.find(id, peer).filter(|c| !c.value.is_empty())?;
        let sc = cfg.sc.take();
        let notify = Self::consolidate(&mut st);
        drop(st);
        self.fire(notify);
        sc
    }

    /// Updates the state after a peer disconnects. `connected` reports
    /// whether another configured peer still has a connection.
    pub(crate) fn disconnected(
        &self,
        id: u8,
        peer: Addr,
        bonded: bool,
        connected: impl Fn(&Cfg) -> bool,
    ) {
        let mut st = self.st.lock();
        if st.value.is_empty() {
            return;
        }
        if !bonded && st.find(id, peer).is_some() {
            Self::remove(&mut st, id, peer);
        }
        let others = (st.cfg.iter().flatten())
            .any(|c| !c.value.is_empty() && (c.id, c.peer) != (id, peer) && connected(c));
        let notify = if others {
            Self::consolidate(&mut st)
        } else {
            st.value = Cccd::empty();
            debug!("CCC reset");
            Some(Cccd::empty())
        };
        drop(st);
        self.fire(notify);
    }

    /// Merges a Service Changed range for a peer that is not connected.
    pub(crate) fn save_sc(&self, id: u8, peer: Addr, r: HandleRange) {
        if let Some(c) = self.st.lock().find(id, peer) {
            c.sc = Some(c.sc.map_or(r, |sc| sc.merge(r)));
            debug!("Saved Service Changed {} for {peer}", c.sc.unwrap_or(r));
        }
    }

    /// Restores a stored value into a free slot. Returns `false` if no slot
    /// is available.
    pub(crate) fn restore(&self, id: u8, peer: Addr, value: Cccd, sc: Option<HandleRange>) -> bool {
        let mut st = self.st.lock();
        let Some(i) = (st.pos(id, peer)).or_else(|| st.cfg.iter().position(Option::is_none)) else {
            return false;
        };
        st.cfg[i] = Some(Cfg { id, peer, value, sc });
        true
    }

    /// Removes the peer's entry.
    pub(crate) fn clear(&self, id: u8, peer: Addr) {
        Self::remove(&mut self.st.lock(), id, peer);
    }

    fn remove(st: &mut State, id: u8, peer: Addr) {
        for c in &mut st.cfg {
            if matches!(c, Some(v) if v.id == id && v.peer == peer) {
                *c = None;
            }
        }
    }

    /// Updates the consolidated value, returning the new value if it changed.
    fn consolidate(st: &mut State) -> Option<Cccd> {
        let v = st.max();
        (v != st.value).then(|| {
            st.value = v;
            v
        })
    }

    fn fire(&self, v: Option<Cccd>) {
        if let (Some(v), Some(f)) = (v, self.changed.as_ref()) {
            debug!("CCC consolidated value {v:?}");
            f(v);
        }
    }
}

impl Debug for Ccc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let st = self.st.lock();
        f.debug_struct("Ccc")
            .field("value", &st.value)
            .field("cfg", &st.cfg.iter().flatten().count())
            .field("sc", &self.sc)
            .finish()
    }
}
