use std::fs::read_to_string;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::listener::ControlSpec;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

/// `-d log_level[:log_facility]`. The facility token is accepted and
/// recorded so existing rtpproxy-style invocations parse, but `simple_logger`
/// has no notion of syslog facilities, so it otherwise goes unused.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub facility: Option<String>,
}

impl FromStr for Log {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once(':') {
            Some((level, facility)) => Ok(Self {
                level: level.parse()?,
                facility: Some(facility.to_string()),
            }),
            None => Ok(Self {
                level: value.parse()?,
                facility: None,
            }),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    Fifo,
    Rr,
    Other,
}

impl FromStr for SchedPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "fifo" => Self::Fifo,
            "rr" => Self::Rr,
            _ => return Err(format!("unknown scheduling policy: {value}")),
        })
    }
}

impl Default for SchedPolicy {
    fn default() -> Self {
        Self::Other
    }
}

/// `--overload_prot[=low:high]`: watermarks for an overload-protection
/// layer external to the core (§1 lists stats/overload handling as outside
/// this crate's scope beyond the `E<overload>` reply code it already knows
/// how to emit). Recorded so the flag round-trips; nothing currently reads
/// the thresholds back out.
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct OverloadProtection {
    pub low: u32,
    pub high: u32,
}

impl FromStr for OverloadProtection {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (low, high) = value
            .split_once(':')
            .ok_or_else(|| format!("expected low:high, got '{value}'"))?;

        Ok(Self {
            low: low.parse().map_err(|_| format!("bad low watermark: {low}"))?,
            high: high.parse().map_err(|_| format!("bad high watermark: {high}"))?,
        })
    }
}

/// User/group a privilege-drop wrapper would apply after bind. The core
/// only records these (§1: the privilege-drop wrapper itself is an external
/// collaborator); nothing in this crate calls `setuid`/`setgid`.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct RunAs {
    pub user: String,
    pub group: Option<String>,
}

impl FromStr for RunAs {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.split_once(':') {
            Some((user, group)) => Self {
                user: user.to_string(),
                group: Some(group.to_string()),
            },
            None => Self {
                user: value.to_string(),
                group: None,
            },
        })
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Control endpoints, `type:path[:opts]` (§6.1). At least one is
    /// required; the listener (C10) binds every one of them.
    #[serde(default)]
    pub control: Vec<ControlSpec>,
    /// Local interface addresses new stream-sides bind RTP/RTCP sockets on.
    /// The first entry is used; additional entries are accepted for parity
    /// with rtpproxy's `-l addr1[/addr2]` repeatable syntax but bridging
    /// across more than one local interface is not implemented by the core.
    #[serde(default = "Config::default_bind")]
    pub bind: Vec<IpAddr>,
    /// Address substituted into command replies in place of the real bound
    /// local address, e.g. behind NAT.
    #[serde(default)]
    pub advertised: Option<IpAddr>,
    #[serde(default = "Config::default_port_min")]
    pub port_min: u16,
    #[serde(default = "Config::default_port_max")]
    pub port_max: u16,
    #[serde(default = "Config::default_max_ttl")]
    pub max_ttl: u64,
    #[serde(default = "Config::default_setup_ttl")]
    pub setup_ttl: u64,
    /// `-b`: force every newly created stream-side into asymmetric mode
    /// (never relearn the remote address from the source of inbound
    /// packets; the control channel's address is authoritative).
    #[serde(default)]
    pub asymmetric: bool,
    #[serde(default)]
    pub run_as: Option<RunAs>,
    #[serde(default)]
    pub foreground: bool,
    #[serde(default)]
    pub notify_socket: Option<String>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    /// `--dso`: path to a single dynamic module. The loader itself is out
    /// of scope (§1); the field exists only so the CLI surface matches
    /// rtpproxy's, per Open Question (a).
    #[serde(default)]
    pub dso: Option<PathBuf>,
    #[serde(default)]
    pub nice: Option<i32>,
    #[serde(default)]
    pub overload_prot: Option<OverloadProtection>,
    #[serde(default)]
    pub sched_policy: SchedPolicy,
    #[serde(default = "Config::default_target_pfreq")]
    pub target_pfreq: f64,
    #[serde(default)]
    pub sched_offset: f64,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    fn default_bind() -> Vec<IpAddr> {
        vec!["0.0.0.0".parse().unwrap()]
    }

    fn default_port_min() -> u16 {
        35000
    }

    fn default_port_max() -> u16 {
        65534
    }

    fn default_max_ttl() -> u64 {
        60
    }

    fn default_setup_ttl() -> u64 {
        10
    }

    fn default_target_pfreq() -> f64 {
        100.0
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control: Vec::new(),
            bind: Self::default_bind(),
            advertised: None,
            port_min: Self::default_port_min(),
            port_max: Self::default_port_max(),
            max_ttl: Self::default_max_ttl(),
            setup_ttl: Self::default_setup_ttl(),
            asymmetric: false,
            run_as: None,
            foreground: false,
            notify_socket: None,
            pid_file: None,
            dso: None,
            nice: None,
            overload_prot: None,
            sched_policy: SchedPolicy::default(),
            target_pfreq: Self::default_target_pfreq(),
            sched_offset: 0.0,
            log: Log::default(),
        }
    }
}

/// Command-line surface (spec §6.3). Every flag is optional here even
/// though some have no sane default (e.g. `control`), because a `--config`
/// file may supply it instead; [`Config::load`] is what enforces "at least
/// one control endpoint" once the two layers are merged.
#[derive(Parser, Debug, Default)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    /// Control socket spec, `type:path[:opts]`. Repeatable.
    #[arg(short = 's', long = "control")]
    control: Vec<ControlSpec>,

    /// Local IPv4/IPv6 bind address for new stream-sides. Repeatable.
    #[arg(short = 'l', long = "bind")]
    bind: Vec<IpAddr>,

    /// Advertised address substituted into command replies.
    #[arg(short = 'A', long)]
    advertised: Option<IpAddr>,

    #[arg(short = 'm', long)]
    port_min: Option<u16>,

    #[arg(short = 'M', long)]
    port_max: Option<u16>,

    #[arg(short = 't', long)]
    max_ttl: Option<u64>,

    #[arg(short = 'W', long)]
    setup_ttl: Option<u64>,

    #[arg(short = 'b', long)]
    asymmetric: bool,

    #[arg(short = 'u', long = "run-as")]
    run_as: Option<RunAs>,

    #[arg(short = 'F', long)]
    foreground: bool,

    #[arg(short = 'n', long = "notify")]
    notify_socket: Option<String>,

    #[arg(short = 'p', long)]
    pid_file: Option<PathBuf>,

    #[arg(long)]
    dso: Option<PathBuf>,

    #[arg(long)]
    nice: Option<i32>,

    #[arg(long)]
    overload_prot: Option<OverloadProtection>,

    #[arg(short = 'c', long)]
    sched_policy: Option<SchedPolicy>,

    #[arg(long)]
    target_pfreq: Option<f64>,

    #[arg(short = 'N', long)]
    sched_offset: Option<f64>,

    #[arg(short = 'd', long)]
    log: Option<Log>,

    /// Load a config file (json5; trailing commas and comments are
    /// permitted) and merge these flags over it field-by-field.
    #[arg(long, short = 'C')]
    config: Option<PathBuf>,
}

impl Config {
    /// Load command-line flags, merge a `--config` file underneath them if
    /// one was given, and return the combined configuration.
    ///
    /// Matches the teacher's precedence rule ("if the configuration file
    /// path is specified, the configuration is read from the configuration
    /// file, otherwise the default configuration is used"), generalized
    /// from an either/or into a per-field merge: this daemon has many more
    /// independently useful runtime flags than the teacher's single
    /// `--config`, so a file supplies a baseline and the CLI overrides
    /// exactly the fields it was given.
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();

        let mut config = match &cli.config {
            Some(path) => {
                let text = read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_json5::from_str(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Config::default(),
        };

        if !cli.control.is_empty() {
            config.control = cli.control;
        }
        if !cli.bind.is_empty() {
            config.bind = cli.bind;
        }
        if cli.advertised.is_some() {
            config.advertised = cli.advertised;
        }
        if let Some(v) = cli.port_min {
            config.port_min = v;
        }
        if let Some(v) = cli.port_max {
            config.port_max = v;
        }
        if let Some(v) = cli.max_ttl {
            config.max_ttl = v;
        }
        if let Some(v) = cli.setup_ttl {
            config.setup_ttl = v;
        }
        if cli.asymmetric {
            config.asymmetric = true;
        }
        if cli.run_as.is_some() {
            config.run_as = cli.run_as;
        }
        if cli.foreground {
            config.foreground = true;
        }
        if cli.notify_socket.is_some() {
            config.notify_socket = cli.notify_socket;
        }
        if cli.pid_file.is_some() {
            config.pid_file = cli.pid_file;
        }
        if cli.dso.is_some() {
            config.dso = cli.dso;
        }
        if cli.nice.is_some() {
            config.nice = cli.nice;
        }
        if cli.overload_prot.is_some() {
            config.overload_prot = cli.overload_prot;
        }
        if let Some(v) = cli.sched_policy {
            config.sched_policy = v;
        }
        if let Some(v) = cli.target_pfreq {
            config.target_pfreq = v;
        }
        if let Some(v) = cli.sched_offset {
            config.sched_offset = v;
        }
        if let Some(v) = cli.log {
            config.log = v;
        }

        if config.control.is_empty() {
            anyhow::bail!("at least one -s/--control endpoint is required");
        }

        if config.port_min % 2 != 0 {
            anyhow::bail!("port_min must be even");
        }

        if config.port_max as u32 + 1 > 65535 {
            anyhow::bail!("port_max + 1 must not exceed 65535");
        }

        Ok(config)
    }

    pub fn bind_ip(&self) -> IpAddr {
        self.bind.first().copied().unwrap_or_else(|| Config::default_bind()[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_parses_level_and_facility() {
        let log: Log = "debug:local0".parse().unwrap();
        assert_eq!(log.level.as_level(), log::Level::Debug);
        assert_eq!(log.facility.as_deref(), Some("local0"));
    }

    #[test]
    fn log_parses_level_only() {
        let log: Log = "warn".parse().unwrap();
        assert_eq!(log.level.as_level(), log::Level::Warn);
        assert!(log.facility.is_none());
    }

    #[test]
    fn run_as_parses_user_and_group() {
        let run_as: RunAs = "rtpproxy:rtpproxy".parse().unwrap();
        assert_eq!(run_as.user, "rtpproxy");
        assert_eq!(run_as.group.as_deref(), Some("rtpproxy"));
    }

    #[test]
    fn overload_prot_parses_watermarks() {
        let prot: OverloadProtection = "10:20".parse().unwrap();
        assert_eq!(prot.low, 10);
        assert_eq!(prot.high, 20);
    }

    #[test]
    fn default_config_rejects_missing_control_endpoint() {
        assert!(Config::default().control.is_empty());
    }
}
