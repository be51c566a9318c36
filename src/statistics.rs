//! Per-call-id packet/byte counters, and the sink that backs both the
//! command processor's `Q` opcode and the pump's forwarding counters.
//!
//! Grounded on the teacher's `src/statistics.rs`: the same `Number`/`Count`/
//! `Counts<T>` shape, the same ahash-keyed table behind a single lock, and
//! the same optional Prometheus text-exporter module. The table key changes
//! from the teacher's `SessionAddr` (client address + interface) to the
//! call-id the relay's sessions are keyed by.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use relay_core::command::{QueryStats, SessionCounters};
use relay_core::pump::PumpStats;

#[cfg(feature = "prometheus")]
pub mod prometheus {
    use std::sync::LazyLock;

    use anyhow::Result;
    use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder, register_int_counter, register_int_gauge};

    use super::{Count, Counts, Number};

    macro_rules! counter {
        ($operation:expr, $dst:expr) => {
            register_int_counter!(
                format!("rtprelay_{}_{}", $operation, $dst),
                format!("total {} {}", $dst, $operation)
            )
        };
    }

    pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::default_or_panic);

    impl Number for IntCounter {
        fn add(&self, value: usize) {
            self.inc_by(value as u64);
        }

        fn get(&self) -> usize {
            self.get() as usize
        }
    }

    pub struct Metrics {
        pub sessions: IntGauge,
        pub total: Counts<IntCounter>,
    }

    impl Metrics {
        fn new() -> Result<Self> {
            Ok(Self {
                sessions: register_int_gauge!("rtprelay_sessions", "active RTP sessions")?,
                total: Counts::new("total")?,
            })
        }

        fn default_or_panic() -> Self {
            Self::new().expect("unable to register prometheus metrics")
        }
    }

    impl Counts<IntCounter> {
        fn new(prefix: &str) -> Result<Self> {
            Ok(Self {
                received_bytes: counter!("received", format!("{prefix}_bytes"))?,
                sent_bytes: counter!("sent", format!("{prefix}_bytes"))?,
                received_packets: counter!("received", format!("{prefix}_packets"))?,
                sent_packets: counter!("sent", format!("{prefix}_packets"))?,
                error_packets: counter!("error", format!("{prefix}_packets"))?,
            })
        }
    }

    pub fn encode(buf: &mut Vec<u8>) -> Result<()> {
        TextEncoder::new().encode(&prometheus::gather(), buf)?;
        Ok(())
    }
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Counts<T> {
    pub received_bytes: T,
    pub sent_bytes: T,
    pub received_packets: T,
    pub sent_packets: T,
    pub error_packets: T,
}

impl<T: Number> Counts<T> {
    fn to_session_counters(&self) -> SessionCounters {
        SessionCounters {
            received_bytes: self.received_bytes.get() as u64,
            received_packets: self.received_packets.get() as u64,
            sent_bytes: self.sent_bytes.get() as u64,
            sent_packets: self.sent_packets.get() as u64,
        }
    }
}

/// Process-wide statistics table, keyed by call-id.
#[derive(Clone)]
pub struct Statistics(Arc<RwLock<AHashMap<String, Counts<Count>>>>);

impl Default for Statistics {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(AHashMap::with_capacity(1024))))
    }
}

impl Statistics {
    pub fn register(&self, call_id: &str) {
        #[cfg(feature = "prometheus")]
        self::prometheus::METRICS.sessions.inc();

        self.0.write().insert(call_id.to_string(), Counts::default());
    }

    pub fn unregister(&self, call_id: &str) {
        #[cfg(feature = "prometheus")]
        self::prometheus::METRICS.sessions.dec();

        self.0.write().remove(call_id);
    }

    fn record(&self, call_id: &str, bytes: usize, errored: bool, sent: bool) {
        let table = self.0.read();
        let Some(counts) = table.get(call_id) else {
            return;
        };

        if errored {
            counts.error_packets.add(1);
            return;
        }

        if sent {
            counts.sent_bytes.add(bytes);
            counts.sent_packets.add(1);
        } else {
            counts.received_bytes.add(bytes);
            counts.received_packets.add(1);
        }

        #[cfg(feature = "prometheus")]
        {
            if errored {
                self::prometheus::METRICS.total.error_packets.add(1);
            } else if sent {
                self::prometheus::METRICS.total.sent_bytes.add(bytes);
                self::prometheus::METRICS.total.sent_packets.add(1);
            } else {
                self::prometheus::METRICS.total.received_bytes.add(bytes);
                self::prometheus::METRICS.total.received_packets.add(1);
            }
        }
    }
}

impl QueryStats for Statistics {
    fn counters(&self, call_id: &str) -> Option<SessionCounters> {
        self.0.read().get(call_id).map(Counts::to_session_counters)
    }
}

impl PumpStats for Statistics {
    fn on_forwarded(&self, call_id: &str, bytes: usize) {
        self.record(call_id, bytes, false, true);
        self.record(call_id, bytes, false, false);
    }

    fn on_dropped(&self, call_id: &str) {
        self.record(call_id, 0, true, false);
    }
}
