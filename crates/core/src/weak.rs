//! Uid-keyed registry of weak handles to live objects.
//!
//! Sessions and stream-sides are minted a process-wide uid on creation and
//! registered here. Readers (the command processor, the TTL reaper) look
//! objects up by uid and get `None` once the last strong reference is gone,
//! without needing to synchronize directly with whoever is holding that
//! reference.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};

use ahash::AHashMap;
use parking_lot::RwLock;

pub struct WeakTable<T> {
    next_uid: AtomicU64,
    entries: RwLock<AHashMap<u64, Weak<T>>>,
}

impl<T> Default for WeakTable<T> {
    fn default() -> Self {
        Self {
            next_uid: AtomicU64::new(1),
            entries: RwLock::new(AHashMap::new()),
        }
    }
}

impl<T> WeakTable<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            next_uid: AtomicU64::new(1),
            entries: RwLock::new(AHashMap::with_capacity(capacity)),
        }
    }

    /// Mint a fresh uid and register a weak handle to `obj`.
    pub fn register(&self, obj: &Arc<T>) -> u64 {
        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(uid, Arc::downgrade(obj));
        uid
    }

    /// Upgrade `uid` to a strong reference, if the target is still alive.
    pub fn get(&self, uid: u64) -> Option<Arc<T>> {
        self.entries.read().get(&uid).and_then(Weak::upgrade)
    }

    /// Explicitly drop a registration, independent of whether other strong
    /// references to the target still exist elsewhere.
    pub fn unregister(&self, uid: u64) {
        self.entries.write().remove(&uid);
    }

    /// Count of registrations whose target is still alive. Opportunistically
    /// purges dead entries it encounters along the way.
    pub fn get_length(&self) -> usize {
        let mut entries = self.entries.write();
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_fails_once_strong_ref_is_dropped() {
        let table: WeakTable<u32> = WeakTable::default();

        let obj = Arc::new(7u32);
        let uid = table.register(&obj);
        assert_eq!(table.get(uid).as_deref(), Some(&7));

        drop(obj);
        assert!(table.get(uid).is_none());
    }

    #[test]
    fn get_length_counts_only_live_entries() {
        let table: WeakTable<u32> = WeakTable::default();

        let a = Arc::new(1u32);
        let _uid_a = table.register(&a);

        {
            let b = Arc::new(2u32);
            table.register(&b);
        }

        assert_eq!(table.get_length(), 1);
    }

    #[test]
    fn unregister_removes_even_live_entries() {
        let table: WeakTable<u32> = WeakTable::default();

        let obj = Arc::new(9u32);
        let uid = table.register(&obj);
        table.unregister(uid);

        assert!(table.get(uid).is_none());
    }
}
