//! Packet-inspection extension point (spec component C12).
//!
//! Mirrors the teacher's `ServiceHandler` trait: a `Send + Sync` trait with
//! default no-op methods, so most implementations only need to override the
//! handful of hooks they actually care about. The dynamic-module loader that
//! would instantiate third-party observers is out of scope; this trait is
//! the entire surface such a loader would need to satisfy.

use std::net::SocketAddr;

/// One registered packet-inspection sink.
pub trait Observer: Send + Sync {
    /// Called for every forwarded datagram, before it is written to the
    /// peer's socket. `buf` is the packet as received (after symmetric
    /// learning, before any transformation by an earlier-registered
    /// observer). Returning `Some(bytes)` replaces the forwarded payload;
    /// returning `None` leaves it untouched.
    #[allow(unused_variables)]
    fn on_packet(
        &self,
        call_id: &str,
        from: SocketAddr,
        to: SocketAddr,
        is_rtcp: bool,
        buf: &[u8],
    ) -> Option<Vec<u8>> {
        None
    }

    /// Called once a session's stream-side has a freshly allocated port
    /// pair.
    #[allow(unused_variables)]
    fn on_allocated(&self, call_id: &str, port: u16) {}

    /// Called when a session is torn down, whether by explicit `D`/`X`
    /// command or by TTL expiry.
    #[allow(unused_variables)]
    fn on_destroy(&self, call_id: &str) {}
}

/// An observer that does nothing; the default when no plugins are
/// configured.
#[derive(Clone, Copy, Default)]
pub struct NullObserver;

impl Observer for NullObserver {}

/// Dispatches each packet to every registered observer in registration
/// order, composing their replacement buffers.
#[derive(Default)]
pub struct ObserverChain {
    observers: Vec<Box<dyn Observer>>,
}

impl ObserverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Box<dyn Observer>) {
        self.observers.push(observer);
    }

    pub fn on_packet(
        &self,
        call_id: &str,
        from: SocketAddr,
        to: SocketAddr,
        is_rtcp: bool,
        buf: &[u8],
    ) -> Option<Vec<u8>> {
        let mut current: Option<Vec<u8>> = None;

        for observer in &self.observers {
            let view: &[u8] = current.as_deref().unwrap_or(buf);
            if let Some(replacement) = observer.on_packet(call_id, from, to, is_rtcp, view) {
                current = Some(replacement);
            }
        }

        current
    }

    pub fn on_allocated(&self, call_id: &str, port: u16) {
        for observer in &self.observers {
            observer.on_allocated(call_id, port);
        }
    }

    pub fn on_destroy(&self, call_id: &str) {
        for observer in &self.observers {
            observer.on_destroy(call_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl Observer for Upper {
        fn on_packet(
            &self,
            _call_id: &str,
            _from: SocketAddr,
            _to: SocketAddr,
            _is_rtcp: bool,
            buf: &[u8],
        ) -> Option<Vec<u8>> {
            Some(buf.iter().map(|b| b.to_ascii_uppercase()).collect())
        }
    }

    #[test]
    fn chain_composes_replacements_in_order() {
        let mut chain = ObserverChain::new();
        chain.register(Box::new(NullObserver));
        chain.register(Box::new(Upper));

        let from: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let to: SocketAddr = "127.0.0.1:2".parse().unwrap();

        let out = chain.on_packet("call", from, to, false, b"hi");
        assert_eq!(out.unwrap(), b"HI");
    }

    #[test]
    fn no_observers_means_no_replacement() {
        let chain = ObserverChain::new();
        let from: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let to: SocketAddr = "127.0.0.1:2".parse().unwrap();

        assert!(chain.on_packet("call", from, to, false, b"hi").is_none());
    }
}
