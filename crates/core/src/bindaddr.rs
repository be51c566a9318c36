//! Interning cache for resolved bind/advertised addresses.
//!
//! Stream-sides frequently need to compare "is this the same configured
//! local address" without re-resolving a hostname on every comparison. This
//! interns `(family, host)` pairs into a stable `Arc<SocketAddr>` handle so
//! repeated lookups of the same host return the same allocation, the way the
//! teacher's `Table<K, V>` wrapper pre-sizes and reuses a single backing map
//! rather than re-allocating per lookup.

use std::net::SocketAddr;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::Family;

#[derive(Default)]
pub struct BindAddrCache {
    table: RwLock<AHashMap<(String, Family), Arc<SocketAddr>>>,
}

impl BindAddrCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `addr` under `(host, family)`. Subsequent calls with the same
    /// key return a clone of the same `Arc`, not a fresh allocation.
    pub fn intern(&self, host: &str, family: Family, addr: SocketAddr) -> Arc<SocketAddr> {
        let key = (host.to_string(), family);

        if let Some(existing) = self.table.read().get(&key) {
            return existing.clone();
        }

        self.table
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(addr))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_intern_returns_same_allocation() {
        let cache = BindAddrCache::new();
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        let a = cache.intern("host.example", Family::V4, addr);
        let b = cache.intern("host.example", Family::V4, addr);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_families_intern_separately() {
        let cache = BindAddrCache::new();
        let v4: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let v6: SocketAddr = "[::1]:5000".parse().unwrap();

        cache.intern("host.example", Family::V4, v4);
        cache.intern("host.example", Family::V6, v6);

        assert_eq!(cache.len(), 2);
    }
}
