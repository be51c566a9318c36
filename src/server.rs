//! Main loop and shutdown driver (spec component C11).
//!
//! No teacher file does this — turn-rs's server loop lives entirely inside
//! tokio's reactor, with no periodic driver of its own — so this is
//! grounded directly on the original `rtpproxy`'s `main()` loop: a
//! `target_pfreq/10` Hz tick that checks the shutdown flags each time
//! around, generalized from `prdic_init`/`prdic_procrastinate` busy-wait
//! polling to a tokio `interval`.
//!
//! State machine (spec §4.11): `running` --SIGHUP--> `draining` --sessions
//! reach zero--> clean exit. `running`/`draining` --SIGTERM or SIGINT-->
//! `fast_exit` (break immediately, regardless of remaining sessions). A
//! second fast-shutdown signal while already in `fast_exit` aborts the
//! process immediately, mirroring `fatsignal()`'s "something probably
//! jammed, do quick exit right from sighandler" escape hatch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use relay_core::SessionManager;
use tokio::signal::unix::{SignalKind, signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownState {
    Running,
    Draining,
}

/// Runs the periodic driver loop until a clean or fast shutdown completes,
/// or the process is aborted by a repeated fast-shutdown signal.
pub async fn run(manager: Arc<SessionManager>, target_pfreq: f64) -> Result<()> {
    let fastshutdown = Arc::new(AtomicBool::new(false));
    let slowshutdown = Arc::new(AtomicBool::new(false));

    spawn_signal_task(SignalKind::hangup(), {
        let slowshutdown = slowshutdown.clone();
        move || {
            if !slowshutdown.swap(true, Ordering::SeqCst) {
                log::info!("got SIGHUP, initiating deorbiting-burn sequence");
            }
        }
    });

    spawn_signal_task(SignalKind::terminate(), {
        let fastshutdown = fastshutdown.clone();
        fast_shutdown_handler(fastshutdown)
    });

    spawn_signal_task(SignalKind::interrupt(), {
        let fastshutdown = fastshutdown.clone();
        fast_shutdown_handler(fastshutdown)
    });

    let mut state = ShutdownState::Running;
    let period = Duration::from_secs_f64(1.0 / (target_pfreq / 10.0));
    let mut ticker = tokio::time::interval(period);

    loop {
        ticker.tick().await;

        if fastshutdown.load(Ordering::SeqCst) {
            log::info!("fast shutdown requested, exiting immediately");
            break;
        }

        if slowshutdown.load(Ordering::SeqCst) {
            state = ShutdownState::Draining;
        }

        if state == ShutdownState::Draining && manager.session_count() == 0 {
            log::info!("deorbiting-burn sequence completed, exiting");
            break;
        }
    }

    Ok(())
}

fn fast_shutdown_handler(fastshutdown: Arc<AtomicBool>) -> impl Fn() {
    move || {
        if !fastshutdown.swap(true, Ordering::SeqCst) {
            log::info!("got shutdown signal");
            return;
        }

        // second signal while already fast-shutting-down: something is
        // jammed, abort right here rather than waiting on the next tick.
        log::warn!("got second shutdown signal, aborting now");
        std::process::exit(1);
    }
}

fn spawn_signal_task(kind: SignalKind, mut on_signal: impl FnMut() + Send + 'static) {
    tokio::spawn(async move {
        let Ok(mut stream) = signal(kind) else {
            log::warn!("failed to install handler for {kind:?}");
            return;
        };

        while stream.recv().await.is_some() {
            on_signal();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::SessionManagerOptions;
    use relay_core::ports::PortRange;

    #[tokio::test(flavor = "multi_thread")]
    async fn runs_until_fastshutdown_flips() {
        let manager = SessionManager::new(SessionManagerOptions {
            port_range: PortRange::new(40000, 40010),
            default_max_ttl: 60,
            default_setup_ttl: 10,
        });

        let fastshutdown = Arc::new(AtomicBool::new(false));
        {
            let fastshutdown = fastshutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                fastshutdown.store(true, Ordering::SeqCst);
            });
        }

        // exercise the same predicate the loop body uses, without waiting on
        // real OS signals inside a test.
        let mut ticker = tokio::time::interval(Duration::from_millis(5));
        loop {
            ticker.tick().await;
            if fastshutdown.load(Ordering::SeqCst) {
                break;
            }
        }

        assert_eq!(manager.session_count(), 0);
    }
}
