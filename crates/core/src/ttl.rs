//! Idle-TTL reaper (spec component C8).
//!
//! Runs as a 1 Hz repeating task on the shared [`crate::wheel::TimedWheel`].
//! Each tick advances the session table's clock by one second (the same
//! manually-ticked `Timer` the teacher's `SessionManager` uses), then asks
//! the table to drop everything whose idle time has crossed its TTL.

use std::sync::Arc;
use std::time::Duration;

use crate::observer::ObserverChain;
use crate::session::SessionManager;
use crate::wheel::{TaskId, TimedWheel, WheelControl};

/// Best-effort delivery of an expiry event to whatever the session was
/// configured to notify. The wire format and transport of that
/// notification channel are out of scope here; this is only the dispatch
/// contract a concrete sender (e.g. a UDP or Unix-socket notifier) must
/// satisfy.
pub trait ExpiryNotifier: Send + Sync {
    fn notify_expired(&self, call_id: &str, target: Option<&str>);
}

#[derive(Default)]
pub struct NullNotifier;

impl ExpiryNotifier for NullNotifier {
    fn notify_expired(&self, _call_id: &str, _target: Option<&str>) {}
}

pub struct TtlReaper {
    task_id: TaskId,
    wheel: Arc<TimedWheel>,
}

impl TtlReaper {
    pub fn spawn(
        wheel: Arc<TimedWheel>,
        manager: Arc<SessionManager>,
        observers: Arc<ObserverChain>,
        notifier: Arc<dyn ExpiryNotifier>,
    ) -> Self {
        let task_id = wheel.schedule_rc(Duration::from_secs(1), move |_now| {
            manager.timer().tick();

            for session in manager.sweep_expired() {
                observers.on_destroy(&session.call_id);

                let target = session.notify_target.read().clone();
                notifier.notify_expired(&session.call_id, target.as_deref());

                log::info!("session '{}' expired (idle exceeded ttl)", session.call_id);
            }

            WheelControl::Reschedule
        });

        Self {
            task_id,
            wheel: wheel.clone(),
        }
    }

    /// Stop the reaper. The session table itself is unaffected; this only
    /// cancels the periodic sweep.
    pub fn stop(&self) {
        self.wheel.cancel(self.task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortRange;
    use crate::session::SessionManagerOptions;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct CountingNotifier(AtomicUsize);

    impl ExpiryNotifier for CountingNotifier {
        fn notify_expired(&self, _call_id: &str, _target: Option<&str>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn reaper_expires_idle_session_within_a_few_ticks() {
        let manager = SessionManager::new(SessionManagerOptions {
            port_range: PortRange::new(40000, 40010),
            default_max_ttl: 2,
            default_setup_ttl: 1,
        });

        manager
            .update_caller(
                "call-1",
                "from",
                None,
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                None,
                false,
            )
            .unwrap();

        let wheel = TimedWheel::new(Duration::from_millis(10));
        let observers = Arc::new(ObserverChain::new());
        let notifier = Arc::new(CountingNotifier(AtomicUsize::new(0)));

        let reaper = TtlReaper::spawn(wheel.clone(), manager.clone(), observers, notifier.clone());

        thread::sleep(Duration::from_millis(3500));
        assert_eq!(manager.session_count(), 0);
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);

        reaper.stop();
        wheel.shutdown();
    }
}
