//! Logging/statistics observer registered into the core's `ObserverChain`.
//!
//! Mirrors the teacher's `src/observer.rs`: a thin wrapper implementing the
//! core trait (`ServiceHandler` there, `relay_core::observer::Observer`
//! here) that logs each lifecycle event at `info` and forwards it into the
//! statistics table. The teacher's JSON event-bus forwarding (its `api`
//! feature) has no counterpart here — there is no HTTP/WS surface in this
//! daemon — so only the logging and statistics halves are kept.

use std::net::SocketAddr;

use relay_core::Observer as CoreObserver;

use crate::statistics::Statistics;

#[derive(Clone)]
pub struct Observer {
    statistics: Statistics,
}

impl Observer {
    pub fn new(statistics: Statistics) -> Self {
        Self { statistics }
    }
}

impl CoreObserver for Observer {
    fn on_packet(&self, _call_id: &str, _from: SocketAddr, _to: SocketAddr, _is_rtcp: bool, _buf: &[u8]) -> Option<Vec<u8>> {
        None
    }

    fn on_allocated(&self, call_id: &str, port: u16) {
        log::info!("allocated: call_id={call_id:?}, port={port}");
        self.statistics.register(call_id);
    }

    fn on_destroy(&self, call_id: &str) {
        log::info!("destroyed: call_id={call_id:?}");
        self.statistics.unregister(call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::command::QueryStats;

    #[test]
    fn allocated_then_destroyed_round_trips_through_statistics() {
        let stats = Statistics::default();
        let observer = Observer::new(stats.clone());

        observer.on_allocated("call-1", 40000);
        assert!(stats.counters("call-1").is_some());

        observer.on_destroy("call-1");
        assert!(stats.counters("call-1").is_none());
    }
}
