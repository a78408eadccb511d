//! Bluetooth LE file system storage backend.

use std::path::{Path, PathBuf};
use std::{fs, io};

use tracing::{debug, error, warn};

use warble::gatt::CccRecord;
use warble::le::Addr;

/// CCC values of bonded peers stored in a file system directory. Each local
/// identity has its own subdirectory with one JSON file per peer.
#[derive(Clone, Debug)]
pub struct CccStore(Dir);

impl CccStore {
    const NAME: &'static str = "ccc";

    /// Creates or opens a CCC store in the specified root directory.
    #[inline(always)]
    #[must_use]
    pub fn open(root: impl AsRef<Path>) -> Self {
        Self(Dir::open(root, Self::NAME))
    }

    /// Creates or opens a CCC store in the current user's local data
    /// directory. Returns `None` if the user directory cannot be determined.
    #[inline(always)]
    #[must_use]
    pub fn per_user(app: impl AsRef<Path>) -> Option<Self> {
        Dir::per_user(app, Self::NAME).map(Self)
    }

    /// Returns the store directory.
    #[inline(always)]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0 .0
    }
}

impl warble::PeerStore for CccStore {
    type Value = CccRecord;

    #[inline(always)]
    fn save(&self, id: u8, peer: Addr, v: &Self::Value) -> bool {
        self.0.save(id, peer, v)
    }

    #[inline(always)]
    fn load(&self, id: u8, peer: Addr) -> Option<Self::Value> {
        self.0.load(id, peer)
    }

    #[inline(always)]
    fn remove(&self, id: u8, peer: Addr) {
        self.0.remove(id, peer);
    }

    #[inline(always)]
    fn clear(&self) {
        self.0.clear();
    }
}

/// Database in a file system directory.
#[derive(Clone, Debug)]
#[repr(transparent)]
struct Dir(PathBuf);

impl Dir {
    /// Creates or opens a database store in the specified root directory.
    #[inline(always)]
    #[must_use]
    fn open(root: impl AsRef<Path>, name: impl AsRef<Path>) -> Self {
        Self(root.as_ref().join(name))
    }

    /// Creates or opens a database store in the current user's local data
    /// directory.
    #[must_use]
    fn per_user(app: impl AsRef<Path>, name: impl AsRef<Path>) -> Option<Self> {
        let Some(dir) = dirs::data_local_dir() else {
            error!("User data directory not available");
            return None;
        };
        Some(Self(dir.join(app.as_ref()).join(name)))
    }

    /// Saves peer data to the file system. The data is written to a
    /// temporary file first, which then replaces the old one.
    fn save(&self, id: u8, peer: Addr, v: &impl serde::Serialize) -> bool {
        let s = match serde_json::to_string_pretty(v) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to serialize data for {peer} ({e})");
                return false;
            }
        };
        let dir = self.id_dir(id);
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!("Failed to create database directory: {} ({e})", dir.display());
        }
        let path = self.path(id, peer);
        let tmp = path.with_extension("tmp");
        match fs::write(&tmp, s.as_bytes()).and_then(|_| fs::rename(&tmp, &path)) {
            Ok(_) => {
                debug!("Wrote: {}", path.display());
                true
            }
            Err(e) => {
                error!("Failed to write: {} ({e})", path.display());
                let _ = fs::remove_file(&tmp);
                false
            }
        }
    }

    /// Loads peer data from the file system.
    fn load<T: serde::de::DeserializeOwned>(&self, id: u8, peer: Addr) -> Option<T> {
        let path = self.path(id, peer);
        let s = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => return None,
            Err(e) => {
                error!("Failed to read: {} ({e})", path.display());
                return None;
            }
        };
        match serde_json::from_str(&s) {
            Ok(v) => Some(v),
            Err(e) => {
                error!("Invalid file contents: {} ({e})", path.display());
                None
            }
        }
    }

    /// Removes peer data from the file system.
    fn remove(&self, id: u8, peer: Addr) {
        let path = self.path(id, peer);
        match fs::remove_file(&path) {
            Ok(_) => debug!("Removed: {}", path.display()),
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => {}
            Err(e) => error!("Failed to remove: {} ({e})", path.display()),
        }
    }

    /// Removes all peer data from the file system.
    fn clear(&self) {
        match fs::remove_dir_all(&self.0) {
            Ok(_) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => {}
            Err(e) => error!("Failed to remove: {} ({e})", self.0.display()),
        }
    }

    /// Returns the directory of a local identity.
    #[inline]
    fn id_dir(&self, id: u8) -> PathBuf {
        self.0.join(id.to_string())
    }

    /// Returns the file path for the specified identity and peer address.
    fn path(&self, id: u8, peer: Addr) -> PathBuf {
        let (raw, typ) = match peer {
            Addr::Public(ref raw) => (raw.as_le_bytes(), 'P'),
            Addr::Random(ref raw) => (raw.as_le_bytes(), 'R'),
        };
        let name = format!(
            "{typ}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}.json",
            raw[5], raw[4], raw[3], raw[2], raw[1], raw[0]
        );
        self.id_dir(id).join(name)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::Builder;

    use warble::att::{Handle, HandleRange};
    use warble::gatt::Cccd;
    use warble::le::RawAddr;
    use warble::PeerStore;

    use super::*;

    const PEER: Addr = Addr::Public(RawAddr::from_le_bytes([0x55, 0x44, 0x33, 0x22, 0x11, 0x00]));
    const OTHER: Addr = Addr::Random(RawAddr::from_le_bytes([0x01, 0x02, 0x03, 0x04, 0x05, 0xC6]));

    fn h(v: u16) -> Handle {
        Handle::new(v).unwrap()
    }

    fn record() -> CccRecord {
        CccRecord {
            ccc: vec![(h(9), Cccd::INDICATE), (h(13), Cccd::NOTIFY)],
            sc: Some(HandleRange::new(h(10), h(16))),
        }
    }

    fn store() -> (tempfile::TempDir, CccStore) {
        let tmp = (Builder::new().prefix("warble-test-")).tempdir().unwrap();
        let db = CccStore::open(tmp.path());
        (tmp, db)
    }

    #[test]
    fn save_load() {
        let (tmp, db) = store();
        let rec = record();
        assert!(db.save(0, PEER, &rec));
        assert!(tmp.path().join("ccc/0/P-001122334455.json").exists());
        assert_eq!(db.load(0, PEER), Some(rec));
        assert_eq!(db.load(1, PEER), None);
        assert_eq!(db.load(0, OTHER), None);

        // Overwrite
        let rec = CccRecord {
            ccc: vec![(h(13), Cccd::NOTIFY | Cccd::INDICATE)],
            sc: None,
        };
        assert!(db.save(0, PEER, &rec));
        assert_eq!(db.load(0, PEER), Some(rec));
        assert!(!tmp.path().join("ccc/0/P-001122334455.tmp").exists());
    }

    #[test]
    fn identities() {
        let (tmp, db) = store();
        assert!(db.save(0, PEER, &record()));
        assert!(db.save(1, PEER, &CccRecord::default()));
        assert!(db.save(1, OTHER, &record()));
        assert!(tmp.path().join("ccc/1/R-C60504030201.json").exists());

        db.remove(1, PEER);
        assert_eq!(db.load(1, PEER), None);
        assert_eq!(db.load(0, PEER), Some(record()));
        db.remove(1, PEER);

        db.clear();
        assert!(!db.path().exists());
        assert_eq!(db.load(1, OTHER), None);
        db.clear();
    }

    #[test]
    fn invalid_contents() {
        let (_tmp, db) = store();
        assert!(db.save(0, PEER, &record()));
        fs::write(db.0.path(0, PEER), b"{\"ccc\": 42}").unwrap();
        assert_eq!(db.load(0, PEER), None);
    }
}
