//! Session table and stream-side model (spec component C6).
//!
//! A session is a call-id keyed pair of stream-sides (`caller`, `callee`).
//! Sessions own their stream-sides strongly; each stream-side holds only a
//! weak back-reference to its session, so the caller/callee <-> session
//! graph never forms an ownership cycle (strong-from-owner, weak-from-child).
//!
//! Ports are handed out in RTP/RTCP pairs by [`crate::ports::PortAllocator`]
//! and released as a pair on session teardown.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

use crate::Family;
use crate::bindaddr::BindAddrCache;
use crate::ports::{PortAllocator, PortRange};
use crate::weak::WeakTable;

/// Manually-ticked monotonic clock. Advanced once per second by the TTL
/// reaper (component C8); everything else only ever reads it.
#[derive(Default)]
pub struct Timer(AtomicU64);

impl Timer {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlMode {
    Unified,
    Independent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    Off,
    Raw,
    Pcap,
}

#[derive(Debug)]
pub enum SessionError {
    NotFound,
    ResourceExhausted,
}

/// One direction's worth of media (RTP + its paired RTCP port) belonging to
/// one session.
pub struct StreamSide {
    uid: AtomicU64,
    pub role: Role,
    pub family: Family,
    pub local_rtp: SocketAddr,
    pub local_rtcp: SocketAddr,
    /// Interned handle for this side's configured local interface (the bind
    /// IP, port-less), shared by every stream-side bound on the same
    /// interface. Two sides are on the same interface iff this pointer is
    /// equal, per `BindAddrCache`'s interning contract.
    pub local_bind: Arc<SocketAddr>,
    pub advertised_addr: Option<SocketAddr>,
    pub asymmetric: bool,
    remote_rtp: RwLock<Option<SocketAddr>>,
    remote_rtcp: RwLock<Option<SocketAddr>>,
    last_update: AtomicU64,
    has_forwarded: AtomicBool,
    session: RwLock<Weak<Session>>,
}

impl StreamSide {
    pub fn uid(&self) -> u64 {
        self.uid.load(Ordering::Relaxed)
    }

    pub fn is_rtcp_port(&self, port: u16) -> bool {
        port == self.local_rtcp.port()
    }

    /// Advertised address to report back to the control channel in place of
    /// the raw bound local address, when configured.
    pub fn report_addr(&self) -> SocketAddr {
        self.advertised_addr.unwrap_or(self.local_rtp)
    }

    pub fn remote_rtp(&self) -> Option<SocketAddr> {
        *self.remote_rtp.read()
    }

    pub fn remote_rtcp(&self) -> Option<SocketAddr> {
        *self.remote_rtcp.read()
    }

    /// Apply symmetric learning for an RTP/RTCP datagram arriving from
    /// `source`. Returns `true` if the packet should still be forwarded
    /// (always true unless `asymmetric` rejects a mismatched source).
    pub fn learn_remote(&self, is_rtcp: bool, source: SocketAddr) -> bool {
        let slot = if is_rtcp {
            &self.remote_rtcp
        } else {
            &self.remote_rtp
        };

        if self.asymmetric {
            return *slot.read() == Some(source);
        }

        let mut guard = slot.write();
        if *guard != Some(source) {
            *guard = Some(source);
        }

        true
    }

    pub fn last_update(&self) -> u64 {
        self.last_update.load(Ordering::Relaxed)
    }

    pub fn has_forwarded(&self) -> bool {
        self.has_forwarded.load(Ordering::Relaxed)
    }

    pub fn touch(&self, now: u64) {
        self.last_update.store(now, Ordering::Relaxed);
        self.has_forwarded.store(true, Ordering::Relaxed);
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.read().upgrade()
    }

    /// Whether this side and `other` are bound on the same configured local
    /// interface, compared by the interned `local_bind` handle's identity
    /// rather than by structural `SocketAddr` equality.
    pub fn shares_interface(&self, other: &StreamSide) -> bool {
        Arc::ptr_eq(&self.local_bind, &other.local_bind)
    }

    /// The other leg of this stream-side's session, if both sides have been
    /// created and the session is still alive.
    pub fn peer(&self) -> Option<Arc<StreamSide>> {
        let session = self.session()?;
        match self.role {
            Role::Caller => session.callee.read().clone(),
            Role::Callee => session.caller.read().clone(),
        }
    }
}

pub struct Session {
    uid: AtomicU64,
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: RwLock<Option<String>>,
    pub created_at: u64,
    pub max_ttl: AtomicU64,
    pub setup_ttl: AtomicU64,
    pub ttl_mode: TtlMode,
    pub record_mode: RwLock<RecordMode>,
    pub notify_target: RwLock<Option<String>>,
    pub caller: RwLock<Option<Arc<StreamSide>>>,
    pub callee: RwLock<Option<Arc<StreamSide>>>,
}

impl Session {
    pub fn uid(&self) -> u64 {
        self.uid.load(Ordering::Relaxed)
    }

    fn last_update_of(side: &RwLock<Option<Arc<StreamSide>>>) -> Option<u64> {
        side.read().as_ref().map(|s| s.last_update())
    }

    fn has_forwarded_any(&self) -> bool {
        self.caller.read().as_ref().is_some_and(|s| s.has_forwarded())
            || self.callee.read().as_ref().is_some_and(|s| s.has_forwarded())
    }

    /// Seconds since the activity timestamp that governs expiry, per
    /// `ttl_mode`: in `Unified` mode the session stays alive as long as
    /// *either* side is active; in `Independent` mode it expires as soon as
    /// the *more* stale side crosses its TTL.
    pub fn idle_seconds(&self, now: u64) -> u64 {
        let caller_last = Self::last_update_of(&self.caller);
        let callee_last = Self::last_update_of(&self.callee);

        let reference = match self.ttl_mode {
            TtlMode::Unified => caller_last.into_iter().chain(callee_last).max(),
            TtlMode::Independent => caller_last.into_iter().chain(callee_last).min(),
        }
        .unwrap_or(self.created_at);

        now.saturating_sub(reference)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        let ttl = if self.has_forwarded_any() {
            self.max_ttl.load(Ordering::Relaxed)
        } else {
            self.setup_ttl.load(Ordering::Relaxed)
        };

        self.idle_seconds(now) > ttl
    }
}

pub struct SessionManagerOptions {
    pub port_range: PortRange,
    pub default_max_ttl: u64,
    pub default_setup_ttl: u64,
}

impl Default for SessionManagerOptions {
    fn default() -> Self {
        Self {
            port_range: PortRange::default(),
            default_max_ttl: 60,
            default_setup_ttl: 10,
        }
    }
}

/// The session table plus everything needed to allocate and tear down the
/// stream-sides it owns.
pub struct SessionManager {
    sessions_by_call_id: RwLock<AHashMap<String, Arc<Session>>>,
    sessions_weak: WeakTable<Session>,
    streams_weak: WeakTable<StreamSide>,
    streams_by_port: RwLock<AHashMap<u16, Weak<StreamSide>>>,
    port_allocator: Mutex<PortAllocator>,
    bind_cache: BindAddrCache,
    timer: Timer,
    default_max_ttl: u64,
    default_setup_ttl: u64,
}

impl SessionManager {
    pub fn new(options: SessionManagerOptions) -> Arc<Self> {
        let capacity = options.port_range.pairs();

        Arc::new(Self {
            sessions_by_call_id: RwLock::new(AHashMap::with_capacity(capacity)),
            sessions_weak: WeakTable::with_capacity(capacity),
            streams_weak: WeakTable::with_capacity(capacity * 2),
            streams_by_port: RwLock::new(AHashMap::with_capacity(capacity * 2)),
            port_allocator: Mutex::new(PortAllocator::new(options.port_range)),
            bind_cache: BindAddrCache::new(),
            timer: Timer::default(),
            default_max_ttl: options.default_max_ttl,
            default_setup_ttl: options.default_setup_ttl,
        })
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn session_count(&self) -> usize {
        self.sessions_weak.get_length()
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<Session>> {
        self.sessions_by_call_id.read().get(call_id).cloned()
    }

    /// Every currently live session, in no particular order. Used by the
    /// `I` opcode's multi-line info reply.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions_by_call_id.read().values().cloned().collect()
    }

    fn create_stream_side(
        &self,
        role: Role,
        bind_ip: IpAddr,
        advertised: Option<SocketAddr>,
        asymmetric: bool,
    ) -> Result<Arc<StreamSide>, SessionError> {
        let (even, odd) = self
            .port_allocator
            .lock()
            .alloc(None)
            .ok_or(SessionError::ResourceExhausted)?;

        let local_rtp = SocketAddr::new(bind_ip, even);
        let local_rtcp = SocketAddr::new(bind_ip, odd);
        let family = Family::of(&local_rtp);

        let local_bind = self
            .bind_cache
            .intern(&bind_ip.to_string(), family, SocketAddr::new(bind_ip, 0));

        let side = Arc::new(StreamSide {
            uid: AtomicU64::new(0),
            role,
            family,
            local_rtp,
            local_rtcp,
            local_bind,
            advertised_addr: advertised,
            asymmetric,
            remote_rtp: RwLock::new(None),
            remote_rtcp: RwLock::new(None),
            last_update: AtomicU64::new(self.timer.get()),
            has_forwarded: AtomicBool::new(false),
            session: RwLock::new(Weak::new()),
        });

        let uid = self.streams_weak.register(&side);
        side.uid.store(uid, Ordering::Relaxed);

        self.streams_by_port.write().insert(even, Arc::downgrade(&side));
        self.streams_by_port.write().insert(odd, Arc::downgrade(&side));

        Ok(side)
    }

    /// `U`: create the session if it doesn't exist, or update the existing
    /// caller side's learned remote address.
    pub fn update_caller(
        &self,
        call_id: &str,
        from_tag: &str,
        remote: Option<SocketAddr>,
        bind_ip: IpAddr,
        advertised: Option<SocketAddr>,
        asymmetric: bool,
    ) -> Result<Arc<StreamSide>, SessionError> {
        if let Some(session) = self.get(call_id) {
            let existing = session.caller.read().clone();
            if let Some(side) = existing {
                if let Some(remote) = remote {
                    side.learn_remote(false, remote);
                }
                return Ok(side);
            }

            let side = self.create_stream_side(Role::Caller, bind_ip, advertised, asymmetric)?;
            if let Some(remote) = remote {
                side.learn_remote(false, remote);
            }

            *side.session.write() = Arc::downgrade(&session);
            *session.caller.write() = Some(side.clone());

            return Ok(side);
        }

        let caller = self.create_stream_side(Role::Caller, bind_ip, advertised, asymmetric)?;
        if let Some(remote) = remote {
            caller.learn_remote(false, remote);
        }

        let session = Arc::new(Session {
            uid: AtomicU64::new(0),
            call_id: call_id.to_string(),
            from_tag: from_tag.to_string(),
            to_tag: RwLock::new(None),
            created_at: self.timer.get(),
            max_ttl: AtomicU64::new(self.default_max_ttl),
            setup_ttl: AtomicU64::new(self.default_setup_ttl),
            ttl_mode: TtlMode::Unified,
            record_mode: RwLock::new(RecordMode::Off),
            notify_target: RwLock::new(None),
            caller: RwLock::new(Some(caller.clone())),
            callee: RwLock::new(None),
        });

        *caller.session.write() = Arc::downgrade(&session);

        let uid = self.sessions_weak.register(&session);
        session.uid.store(uid, Ordering::Relaxed);

        self.sessions_by_call_id
            .write()
            .insert(call_id.to_string(), session);

        Ok(caller)
    }

    /// `L`: create the session if it doesn't exist, or update the existing
    /// callee side's learned remote address. A `from_tag` not matching the
    /// session's recorded tag does not block the update: tag-pair validation
    /// is left to the command layer, which has the full request context.
    pub fn update_callee(
        &self,
        call_id: &str,
        from_tag: &str,
        to_tag: &str,
        remote: Option<SocketAddr>,
        bind_ip: IpAddr,
        advertised: Option<SocketAddr>,
        asymmetric: bool,
    ) -> Result<Arc<StreamSide>, SessionError> {
        let session = match self.get(call_id) {
            Some(session) => session,
            None => {
                let session = Arc::new(Session {
                    uid: AtomicU64::new(0),
                    call_id: call_id.to_string(),
                    from_tag: from_tag.to_string(),
                    to_tag: RwLock::new(Some(to_tag.to_string())),
                    created_at: self.timer.get(),
                    max_ttl: AtomicU64::new(self.default_max_ttl),
                    setup_ttl: AtomicU64::new(self.default_setup_ttl),
                    ttl_mode: TtlMode::Unified,
                    record_mode: RwLock::new(RecordMode::Off),
                    notify_target: RwLock::new(None),
                    caller: RwLock::new(None),
                    callee: RwLock::new(None),
                });

                let uid = self.sessions_weak.register(&session);
                session.uid.store(uid, Ordering::Relaxed);

                self.sessions_by_call_id
                    .write()
                    .insert(call_id.to_string(), session.clone());

                session
            }
        };

        *session.to_tag.write() = Some(to_tag.to_string());

        let existing = session.callee.read().clone();
        if let Some(side) = existing {
            if let Some(remote) = remote {
                side.learn_remote(false, remote);
            }
            return Ok(side);
        }

        let side = self.create_stream_side(Role::Callee, bind_ip, advertised, asymmetric)?;
        if let Some(remote) = remote {
            side.learn_remote(false, remote);
        }

        *side.session.write() = Arc::downgrade(&session);
        *session.callee.write() = Some(side.clone());

        Ok(side)
    }

    fn teardown_session(&self, session: &Arc<Session>) {
        self.sessions_weak.unregister(session.uid());

        let mut port_allocator = self.port_allocator.lock();
        let mut streams_by_port = self.streams_by_port.write();

        for side in [session.caller.read().clone(), session.callee.read().clone()]
            .into_iter()
            .flatten()
        {
            self.streams_weak.unregister(side.uid());
            streams_by_port.remove(&side.local_rtp.port());
            streams_by_port.remove(&side.local_rtcp.port());
            port_allocator.restore(side.local_rtp.port());
        }
    }

    /// `D`: delete a session by call-id. Returns `NotFound` if no such
    /// session exists.
    pub fn delete(&self, call_id: &str) -> Result<Arc<Session>, SessionError> {
        let session = self
            .sessions_by_call_id
            .write()
            .remove(call_id)
            .ok_or(SessionError::NotFound)?;

        self.teardown_session(&session);
        Ok(session)
    }

    /// `X`: delete every session.
    pub fn delete_all(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self
            .sessions_by_call_id
            .write()
            .drain()
            .map(|(_, v)| v)
            .collect();

        let count = sessions.len();
        for session in &sessions {
            self.teardown_session(session);
        }

        count
    }

    /// Look a stream-side up by the local port a datagram arrived on. Used
    /// by the packet pump; works for either the RTP or the RTCP half of the
    /// pair.
    pub fn lookup_by_port(&self, port: u16) -> Option<Arc<StreamSide>> {
        self.streams_by_port.read().get(&port).and_then(Weak::upgrade)
    }

    /// Sweep for and remove every session whose idle time exceeds its TTL.
    /// Called once per tick by the TTL reaper (component C8).
    pub fn sweep_expired(&self) -> Vec<Arc<Session>> {
        let now = self.timer.get();

        let expired: Vec<(String, Arc<Session>)> = self
            .sessions_by_call_id
            .read()
            .iter()
            .filter(|(_, session)| session.is_expired(now))
            .map(|(call_id, session)| (call_id.clone(), session.clone()))
            .collect();

        if expired.is_empty() {
            return Vec::new();
        }

        {
            let mut table = self.sessions_by_call_id.write();
            for (call_id, _) in &expired {
                table.remove(call_id);
            }
        }

        let sessions: Vec<Arc<Session>> = expired.into_iter().map(|(_, s)| s).collect();
        for session in &sessions {
            self.teardown_session(session);
        }

        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn manager() -> Arc<SessionManager> {
        SessionManager::new(SessionManagerOptions {
            port_range: PortRange::new(40000, 40020),
            default_max_ttl: 60,
            default_setup_ttl: 10,
        })
    }

    #[test]
    fn update_caller_creates_session_with_even_port() {
        let mgr = manager();
        let side = mgr
            .update_caller(
                "call-1",
                "from",
                Some("10.0.0.1:5000".parse().unwrap()),
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                None,
                false,
            )
            .unwrap();

        assert_eq!(side.local_rtp.port() % 2, 0);
        assert_eq!(side.local_rtcp.port(), side.local_rtp.port() + 1);
        assert_eq!(side.remote_rtp(), Some("10.0.0.1:5000".parse().unwrap()));
        assert_eq!(mgr.session_count(), 1);
    }

    #[test]
    fn update_then_delete_releases_ports() {
        let mgr = manager();
        let caller = mgr
            .update_caller("call-1", "from", None, IpAddr::V4(Ipv4Addr::UNSPECIFIED), None, false)
            .unwrap();
        mgr.update_callee(
            "call-1",
            "from",
            "to",
            None,
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            None,
            false,
        )
        .unwrap();

        let rtp_port = caller.local_rtp.port();
        mgr.delete("call-1").unwrap();

        assert_eq!(mgr.session_count(), 0);
        assert!(mgr.lookup_by_port(rtp_port).is_none());

        // the released pair is immediately available again
        let reused = mgr
            .update_caller("call-2", "from", None, IpAddr::V4(Ipv4Addr::UNSPECIFIED), None, false)
            .unwrap();
        assert_eq!(reused.local_rtp.port(), rtp_port);
    }

    #[test]
    fn peer_lookup_crosses_caller_and_callee() {
        let mgr = manager();
        let caller = mgr
            .update_caller("call-1", "from", None, IpAddr::V4(Ipv4Addr::UNSPECIFIED), None, false)
            .unwrap();
        let callee = mgr
            .update_callee(
                "call-1",
                "from",
                "to",
                None,
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                None,
                false,
            )
            .unwrap();

        assert_eq!(caller.peer().unwrap().local_rtp, callee.local_rtp);
        assert_eq!(callee.peer().unwrap().local_rtp, caller.local_rtp);
    }

    #[test]
    fn idle_session_is_expired_after_setup_ttl() {
        let mgr = manager();
        mgr.update_caller("call-1", "from", None, IpAddr::V4(Ipv4Addr::UNSPECIFIED), None, false)
            .unwrap();

        for _ in 0..11 {
            mgr.timer.tick();
        }

        let expired = mgr.sweep_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(mgr.session_count(), 0);
    }

    #[test]
    fn resource_exhaustion_surfaces_as_error() {
        let mgr = SessionManager::new(SessionManagerOptions {
            port_range: PortRange::new(40000, 40000),
            default_max_ttl: 60,
            default_setup_ttl: 10,
        });

        mgr.update_caller("call-1", "from", None, IpAddr::V4(Ipv4Addr::UNSPECIFIED), None, false)
            .unwrap();

        let err = mgr
            .update_caller("call-2", "from", None, IpAddr::V4(Ipv4Addr::UNSPECIFIED), None, false)
            .unwrap_err();

        assert!(matches!(err, SessionError::ResourceExhausted));
    }
}
