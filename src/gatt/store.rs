use std::collections::HashMap;

use parking_lot::Mutex;

use crate::le::Addr;
use crate::PeerStore;

/// Peer store that keeps records in memory. Records are lost when the store
/// is dropped.
#[derive(Debug)]
pub struct MemStore<T>(Mutex<HashMap<(u8, Addr), T>>);

impl<T> MemStore<T> {
    /// Creates an empty store.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Mutex::default())
    }

    /// Returns the number of stored records.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Returns whether the store is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

impl<T> Default for MemStore<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> PeerStore for MemStore<T> {
    type Value = T;

    fn save(&self, id: u8, peer: Addr, v: &Self::Value) -> bool {
        self.0.lock().insert((id, peer), v.clone());
        true
    }

    fn load(&self, id: u8, peer: Addr) -> Option<Self::Value> {
        self.0.lock().get(&(id, peer)).cloned()
    }

    fn remove(&self, id: u8, peer: Addr) {
        self.0.lock().remove(&(id, peer));
    }

    fn clear(&self) {
        self.0.lock().clear();
    }
}
