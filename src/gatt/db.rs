//! Attribute database ([Vol 3] Part G, Section 3).

use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use structbuf::{Pack, StructBuf};
use tracing::debug;

use crate::att::{ErrorCode, Handle, HandleRange, Perms, MAX_VAL_LEN};
use crate::conn::Conn;
use crate::gap::{self, Uuid, Uuid16};

use super::*;

bitflags::bitflags! {
    /// Characteristic properties ([Vol 3] Part G, Section 3.3.1.1).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct CharProps: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

/// Attribute value accessor.
pub trait Value: Send + Sync {
    /// Returns the complete attribute value as seen by `conn`.
    fn read(&self, conn: &Conn) -> std::result::Result<Vec<u8>, ErrorCode>;

    /// Writes `v` at offset `off`.
    #[allow(unused_variables)]
    fn write(&self, conn: &Conn, off: usize, v: &[u8]) -> std::result::Result<(), ErrorCode> {
        Err(ErrorCode::WriteNotPermitted)
    }
}

/// Attribute value stored in memory.
#[derive(Debug, Default)]
pub struct Bytes(RwLock<Vec<u8>>);

impl Bytes {
    /// Creates a shared value.
    #[inline]
    #[must_use]
    pub fn new(v: impl Into<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self(RwLock::new(v.into())))
    }

    /// Returns a copy of the current value.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Vec<u8> {
        self.0.read().clone()
    }

    /// Replaces the value.
    #[inline]
    pub fn set(&self, v: impl Into<Vec<u8>>) {
        *self.0.write() = v.into();
    }
}

impl Value for Bytes {
    #[inline]
    fn read(&self, _: &Conn) -> std::result::Result<Vec<u8>, ErrorCode> {
        Ok(self.get())
    }

    fn write(&self, _: &Conn, off: usize, v: &[u8]) -> std::result::Result<(), ErrorCode> {
        let mut cur = self.0.write();
        if off > cur.len() {
            return Err(ErrorCode::InvalidOffset);
        }
        if off + v.len() > MAX_VAL_LEN {
            return Err(ErrorCode::InvalidAttributeValueLength);
        }
        cur.truncate(off);
        cur.extend_from_slice(v);
        Ok(())
    }
}

/// Registered service identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ServiceId(u32);

/// Attribute kind.
#[derive(Clone)]
pub(crate) enum Kind {
    Service(Uuid),
    Include {
        svc: ServiceId,
        range: HandleRange,
        uuid: Option<Uuid16>,
    },
    Characteristic {
        props: CharProps,
        value: Option<Handle>,
        uuid: Uuid,
    },
    Ccc(Arc<Ccc>),
    Value(Arc<dyn Value>),
}

/// Attribute definition. The handle is assigned during registration unless
/// it was specified explicitly.
#[derive(Clone)]
pub(crate) struct Attr {
    pub hdl: Option<Handle>,
    pub typ: Uuid,
    pub perms: Perms,
    pub kind: Kind,
}

impl Attr {
    /// Returns the assigned handle.
    #[inline]
    pub fn handle(&self) -> Handle {
        self.hdl.unwrap_or(Handle::MAX)
    }

    /// Returns whether the attribute is a service declaration.
    #[inline]
    pub fn is_service(&self) -> bool {
        matches!(self.kind, Kind::Service(_))
    }

    /// Returns the attribute value as seen by `conn` without checking
    /// permissions.
    pub fn read(&self, conn: &Conn) -> std::result::Result<Vec<u8>, ErrorCode> {
        match self.kind {
            Kind::Service(u) => Ok(u.to_wire()),
            Kind::Include { range, uuid, .. } => {
                let mut b = StructBuf::new(6);
                let mut p = b.append();
                p.u16(range.start()).u16(range.end());
                if let Some(u) = uuid {
                    p.u16(u);
                }
                Ok(b.as_ref().to_vec())
            }
            Kind::Characteristic { props, value, uuid } => {
                let mut b = StructBuf::new(19);
                b.append()
                    .u8(props.bits())
                    .u16(value.map_or(0, u16::from))
                    .put(uuid.to_wire());
                Ok(b.as_ref().to_vec())
            }
            Kind::Ccc(ref c) => Ok(c.peer_value(conn.id(), conn.dst()).bits().to_le_bytes().to_vec()),
            Kind::Value(ref v) => v.read(conn),
        }
    }
}

impl Debug for Attr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            Kind::Service(_) => "Service",
            Kind::Include { .. } => "Include",
            Kind::Characteristic { .. } => "Characteristic",
            Kind::Ccc(_) => "Ccc",
            Kind::Value(_) => "Value",
        };
        f.debug_struct("Attr")
            .field("hdl", &self.hdl)
            .field("typ", &self.typ)
            .field("kind", &kind)
            .finish_non_exhaustive()
    }
}

/// Service definition marker type.
#[derive(Debug)]
pub struct ServiceDef;

/// Characteristic definition marker type.
#[derive(Debug)]
pub struct CharacteristicDef;

/// Service definition builder.
#[derive(Debug)]
#[repr(transparent)]
pub struct Builder<T>(Vec<Attr>, PhantomData<T>);

impl<T> Builder<T> {
    /// Assigns an explicit handle to the most recently defined attribute. The
    /// handle must be greater than all handles assigned before it.
    pub fn at(&mut self, hdl: Handle) -> &mut Self {
        if let Some(at) = self.0.last_mut() {
            at.hdl = Some(hdl);
        }
        self
    }

    fn push(&mut self, typ: impl Into<Uuid>, perms: Perms, kind: Kind) {
        self.0.push(Attr {
            hdl: None,
            typ: typ.into(),
            perms,
            kind,
        });
    }

    #[inline(always)]
    fn builder<U>(&mut self) -> &mut Builder<U> {
        // SAFETY: Builder is a `repr(transparent)` newtype
        unsafe { &mut *(self as *mut Self).cast() }
    }
}

impl Builder<ServiceDef> {
    /// Declares an included service ([Vol 3] Part G, Section 3.2). The
    /// included service must be registered first.
    pub fn include(&mut self, svc: ServiceId) -> &mut Self {
        let kind = Kind::Include {
            svc,
            range: HandleRange::ALL,
            uuid: None,
        };
        self.push(gap::INCLUDE, Perms::READ, kind);
        self
    }

    /// Defines a characteristic ([Vol 3] Part G, Section 3.3) and calls `f`
    /// to define its descriptors.
    pub fn characteristic<T>(
        &mut self,
        uuid: impl Into<Uuid>,
        props: CharProps,
        perms: Perms,
        v: Arc<dyn Value>,
        f: impl FnOnce(&mut Builder<CharacteristicDef>) -> T,
    ) -> T {
        let uuid = uuid.into();
        let decl = Kind::Characteristic {
            props,
            value: None,
            uuid,
        };
        self.push(gap::CHARACTERISTIC, Perms::READ, decl);
        self.push(uuid, perms, Kind::Value(v));
        f(self.builder())
    }
}

impl Builder<CharacteristicDef> {
    /// Declares a characteristic descriptor ([Vol 3] Part G, Section 3.3.3).
    pub fn descriptor(&mut self, uuid: impl Into<Uuid>, perms: Perms, v: Arc<dyn Value>) -> &mut Self {
        self.push(uuid, perms, Kind::Value(v));
        self
    }

    /// Declares a Client Characteristic Configuration descriptor. `changed`
    /// receives the maximum value configured by all peers whenever it
    /// changes.
    pub fn ccc(&mut self, perms: Perms, changed: Option<CfgChanged>) -> &mut Self {
        let c = Arc::new(Ccc::new(changed));
        self.push(gap::CLIENT_CHARACTERISTIC_CONFIGURATION, perms, Kind::Ccc(c));
        self
    }
}

/// Service definition.
#[derive(Debug)]
pub struct Service {
    attrs: Vec<Attr>,
}

impl Service {
    /// Defines a primary service ([Vol 3] Part G, Section 3.1).
    pub fn primary(uuid: impl Into<Uuid>, f: impl FnOnce(&mut Builder<ServiceDef>)) -> Self {
        Self::new(gap::PRIMARY_SERVICE, uuid.into(), f)
    }

    /// Defines a secondary service ([Vol 3] Part G, Section 3.1).
    pub fn secondary(uuid: impl Into<Uuid>, f: impl FnOnce(&mut Builder<ServiceDef>)) -> Self {
        Self::new(gap::SECONDARY_SERVICE, uuid.into(), f)
    }

    fn new(typ: Uuid16, uuid: Uuid, f: impl FnOnce(&mut Builder<ServiceDef>)) -> Self {
        let mut b = Builder(Vec::with_capacity(8), PhantomData);
        b.push(typ, Perms::READ, Kind::Service(uuid));
        f(&mut b);
        Self { attrs: b.0 }
    }

    /// Returns the service UUID.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        match self.attrs.first().map(|at| &at.kind) {
            Some(Kind::Service(u)) => *u,
            _ => unreachable!("service without declaration"),
        }
    }

    /// Returns the number of attributes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// Returns whether the service has no attributes.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

/// Registered service with assigned handles.
#[derive(Debug)]
pub(crate) struct Entry {
    pub id: ServiceId,
    pub attrs: Box<[Attr]>,
}

impl Entry {
    /// Returns the service handle range.
    pub fn range(&self) -> HandleRange {
        let (Some(first), Some(last)) = (self.attrs.first(), self.attrs.last()) else {
            unreachable!("empty service");
        };
        HandleRange::new(first.handle(), last.handle())
    }

    /// Returns the service UUID.
    pub fn uuid(&self) -> Option<Uuid> {
        match self.attrs.first()?.kind {
            Kind::Service(u) => Some(u),
            _ => None,
        }
    }
}

/// Snapshot of registered services in ascending handle order.
#[derive(Debug)]
pub(crate) struct View(Vec<Arc<Entry>>);

impl View {
    /// Returns all attributes within the range, along with the end handle of
    /// their service.
    pub fn attrs(&self, r: HandleRange) -> impl Iterator<Item = (&Attr, Handle)> {
        (self.0.iter())
            .filter(move |e| e.range().start() <= r.end() && r.start() <= e.range().end())
            .flat_map(move |e| {
                let end = e.range().end();
                (e.attrs.iter())
                    .filter(move |at| r.contains(at.handle()))
                    .map(move |at| (at, end))
            })
    }

    /// Returns the attribute with the specified handle and the attributes
    /// that follow it in the same service.
    pub fn find(&self, hdl: Handle) -> Option<&[Attr]> {
        let e = (self.0.iter()).find(|e| e.range().contains(hdl))?;
        let i = e.attrs.iter().position(|at| at.handle() == hdl)?;
        Some(&e.attrs[i..])
    }

    /// Returns all CCC descriptors.
    pub fn cccs(&self) -> impl Iterator<Item = (Handle, &Arc<Ccc>)> {
        (self.0.iter().flat_map(|e| e.attrs.iter())).filter_map(|at| match at.kind {
            Kind::Ccc(ref c) => Some((at.handle(), c)),
            _ => None,
        })
    }
}

/// Ordered list of registered services.
#[derive(Debug)]
pub(crate) struct Db {
    svcs: Vec<Arc<Entry>>,
    next_id: u32,
    ccc_max: usize,
}

impl Db {
    /// Handle of the Service Changed characteristic value.
    pub const SC_VALUE: Handle = match Handle::new(8) {
        Some(h) => h,
        None => unreachable!(),
    };

    /// Creates a database containing the mandatory GAP and GATT services.
    pub fn new(cfg: &Config) -> Self {
        let mut db = Self {
            svcs: Vec::new(),
            next_id: 0,
            ccc_max: cfg.ccc_max,
        };
        let name = Bytes::new(cfg.device_name.as_bytes());
        let appearance = Bytes::new(cfg.appearance.to_le_bytes());
        let gap = Service::primary(gap::GENERIC_ACCESS, |s| {
            s.characteristic(gap::DEVICE_NAME, CharProps::READ, Perms::READ, name, |_| {});
            s.characteristic(gap::APPEARANCE, CharProps::READ, Perms::READ, appearance, |_| {});
        });
        let gatt = Service::primary(gap::GENERIC_ATTRIBUTE, |s| {
            let sc = Bytes::new([0; 4]);
            s.characteristic(gap::SERVICE_CHANGED, CharProps::INDICATE, Perms::empty(), sc, |c| {
                let ccc = Arc::new(Ccc::service_changed());
                c.push(gap::CLIENT_CHARACTERISTIC_CONFIGURATION, Perms::READ_WRITE, Kind::Ccc(ccc));
            });
        });
        for s in [gap, gatt] {
            // Cannot fail on an empty database
            let _ = db.insert(s);
        }
        debug_assert!(matches!(
            db.view().find(Self::SC_VALUE).map(|v| v[0].typ),
            Some(t) if t == gap::SERVICE_CHANGED
        ));
        db
    }

    /// Registers a service, assigning attribute handles. Returns the service
    /// handle range.
    pub fn register(&mut self, svc: Service) -> Result<(ServiceId, HandleRange)> {
        let uuid = svc.uuid();
        if uuid == gap::GENERIC_ACCESS || uuid == gap::GENERIC_ATTRIBUTE {
            return Err(Error::Already);
        }
        self.insert(svc)
    }

    /// Removes a service and returns its former handle range.
    pub fn unregister(&mut self, id: ServiceId) -> Result<HandleRange> {
        let i = (self.svcs.iter().position(|e| e.id == id)).ok_or(Error::NotFound)?;
        let e = self.svcs.remove(i);
        debug!("Unregistered service {:?} at {}", e.uuid(), e.range());
        Ok(e.range())
    }

    /// Returns the handle range of a registered service.
    pub fn range(&self, id: ServiceId) -> Option<HandleRange> {
        (self.svcs.iter().find(|e| e.id == id)).map(|e| e.range())
    }

    /// Returns the value handle of the first characteristic with the
    /// specified UUID in a registered service.
    pub fn value_handle(&self, id: ServiceId, uuid: Uuid) -> Option<Handle> {
        let e = self.svcs.iter().find(|e| e.id == id)?;
        e.attrs.iter().find_map(|at| match at.kind {
            Kind::Characteristic { uuid: u, value, .. } if u == uuid => value,
            _ => None,
        })
    }

    /// Returns a snapshot of all services.
    pub fn view(&self) -> View {
        View(self.svcs.clone())
    }

    fn insert(&mut self, svc: Service) -> Result<(ServiceId, HandleRange)> {
        let mut attrs = svc.attrs;
        let mut last = self.svcs.last().map(|e| e.range().end());
        for at in &mut attrs {
            let hdl = match (at.hdl, last) {
                (Some(h), Some(l)) if h <= l => {
                    debug!("Unable to register handle {h}");
                    return Err(Error::InvalidHandle(h));
                }
                (Some(h), _) => h,
                (None, None) => Handle::MIN,
                (None, Some(l)) => l.next().ok_or(Error::NoHandles)?,
            };
            at.hdl = Some(hdl);
            last = Some(hdl);
        }
        for i in 0..attrs.len() {
            let next = attrs.get(i + 1).and_then(|at| at.hdl);
            match attrs[i].kind {
                Kind::Characteristic { ref mut value, .. } => *value = next,
                Kind::Include {
                    svc,
                    ref mut range,
                    ref mut uuid,
                } => {
                    let e = (self.svcs.iter().find(|e| e.id == svc)).ok_or(Error::InvalidArgument)?;
                    *range = e.range();
                    *uuid = e.uuid().and_then(Uuid::as_uuid16);
                }
                Kind::Ccc(ref c) => c.init(self.ccc_max),
                Kind::Service(_) | Kind::Value(_) => {}
            }
        }
        let id = ServiceId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        let e = Arc::new(Entry {
            id,
            attrs: attrs.into_boxed_slice(),
        });
        let r = e.range();
        debug!("Registered service {:?} at {r}", e.uuid());
        self.svcs.push(e);
        Ok((id, r))
    }
}
