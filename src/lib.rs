pub mod config;
pub mod listener;
pub mod notify;
pub mod observer;
pub mod pidfile;
pub mod server;
pub mod statistics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use relay_core::command::{CommandProcessor, CommandProcessorOptions};
use relay_core::observer::ObserverChain;
use relay_core::pump::Pump;
use relay_core::session::{SessionManager, SessionManagerOptions};
use relay_core::ttl::TtlReaper;
use relay_core::wheel::TimedWheel;

use self::config::Config;
use self::listener::Listener;
use self::notify::Notifier;
use self::observer::Observer;
use self::pidfile::PidFile;
use self::statistics::Statistics;

/// Assembles every subsystem (C1-C12) described by the config and runs
/// until shutdown. Mirrors the teacher's `startup(config)` entry point in
/// `src/lib.rs`, generalized from a single `Service` into this daemon's
/// session table + pump + reaper + command processor + listeners.
pub async fn startup(config: Arc<Config>) -> Result<()> {
    let _pidfile = match &config.pid_file {
        Some(path) => Some(PidFile::create(path.clone())?),
        None => None,
    };

    let statistics = Statistics::default();
    let observer = Observer::new(statistics.clone());

    let mut chain = ObserverChain::new();
    chain.register(Box::new(observer));
    let observers = Arc::new(chain);

    let manager = SessionManager::new(SessionManagerOptions {
        port_range: relay_core::ports::PortRange::new(config.port_min, config.port_max),
        default_max_ttl: config.max_ttl,
        default_setup_ttl: config.setup_ttl,
    });

    let pump = Pump::new(manager.clone(), observers.clone(), Arc::new(statistics.clone()));

    let wheel = TimedWheel::new(Duration::from_secs_f64(1.0 / (config.target_pfreq / 10.0)));
    let notifier = Arc::new(Notifier::spawn());
    let _reaper = TtlReaper::spawn(wheel.clone(), manager.clone(), observers.clone(), notifier);

    let processor = Arc::new(CommandProcessor::new(
        manager.clone(),
        pump,
        observers,
        Arc::new(statistics),
        CommandProcessorOptions {
            bind_ip: config.bind_ip(),
            advertised_ip: config.advertised,
            asymmetric: config.asymmetric,
        },
    ));

    Listener::bind_all(&config.control, processor).await?;

    log::info!(
        "rtprelay ready: ports {}-{}, {} control endpoint(s)",
        config.port_min,
        config.port_max,
        config.control.len()
    );

    server::run(manager, config.target_pfreq).await?;

    wheel.shutdown();
    log::info!("rtprelay ended");

    Ok(())
}
