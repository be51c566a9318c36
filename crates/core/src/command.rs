//! Control-channel command processor (spec component C9, `command_async`).
//!
//! Parses one line of the request protocol (`COOKIE OPCODE [ARGS...]`),
//! mutates the session table through [`crate::session::SessionManager`], and
//! renders one reply line (`COOKIE ...` on success, `COOKIE E<code>` on
//! failure). No teacher file speaks this protocol directly — turn-rs
//! terminates STUN/TURN messages, not a line protocol — so this module
//! follows the real rtpproxy wire protocol described in the spec, using the
//! same `Result`-returning, default-friendly style the teacher's
//! `ServiceHandler` handlers use.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::observer::ObserverChain;
use crate::pump::Pump;
use crate::session::{Session, SessionError, SessionManager};

/// The fixed protocol-version token rtpproxy clients poll for with a bare
/// `V` request.
const PROTOCOL_VERSION: &str = "20040107";

/// Feature-date tokens this build answers `1` to on a `VF` query.
const SUPPORTED_FEATURES: &[&str] = &["20040107", "20050322", "20060704"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    Syntax,
    NotFound,
    Permission,
    Overload,
    ResourceExhausted,
    Internal,
}

impl CommandError {
    fn code(self) -> &'static str {
        match self {
            CommandError::Syntax => "E1",
            CommandError::NotFound => "E2",
            CommandError::Permission => "E3",
            CommandError::Overload => "E4",
            CommandError::ResourceExhausted => "E5",
            CommandError::Internal => "E6",
        }
    }
}

impl From<SessionError> for CommandError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound => CommandError::NotFound,
            SessionError::ResourceExhausted => CommandError::ResourceExhausted,
        }
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl std::error::Error for CommandError {}

/// Per-call-id counters the `Q` opcode reports. The concrete accounting
/// (e.g. the binary's Prometheus-backed statistics module) lives outside
/// this crate; this is only the read contract the command processor needs.
pub trait QueryStats: Send + Sync {
    fn counters(&self, call_id: &str) -> Option<SessionCounters>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCounters {
    pub received_bytes: u64,
    pub received_packets: u64,
    pub sent_bytes: u64,
    pub sent_packets: u64,
}

#[derive(Default)]
pub struct NullQueryStats;

impl QueryStats for NullQueryStats {
    fn counters(&self, _call_id: &str) -> Option<SessionCounters> {
        None
    }
}

pub struct CommandProcessorOptions {
    pub bind_ip: IpAddr,
    pub advertised_ip: Option<IpAddr>,
    pub asymmetric: bool,
}

pub struct CommandProcessor {
    manager: Arc<SessionManager>,
    pump: Arc<Pump>,
    observers: Arc<ObserverChain>,
    stats: Arc<dyn QueryStats>,
    bind_ip: IpAddr,
    advertised_ip: Option<IpAddr>,
    asymmetric: bool,
}

impl CommandProcessor {
    pub fn new(
        manager: Arc<SessionManager>,
        pump: Arc<Pump>,
        observers: Arc<ObserverChain>,
        stats: Arc<dyn QueryStats>,
        options: CommandProcessorOptions,
    ) -> Self {
        Self {
            manager,
            pump,
            observers,
            stats,
            bind_ip: options.bind_ip,
            advertised_ip: options.advertised_ip,
            asymmetric: options.asymmetric,
        }
    }

    /// Parse and execute one request line, returning the full reply line
    /// (without a trailing newline — framing is the listener's job).
    pub async fn handle_line(&self, line: &str) -> String {
        let mut tokens = line.split_whitespace();

        let Some(cookie) = tokens.next() else {
            return format!("{}", CommandError::Syntax.code());
        };

        let Some(opcode) = tokens.next() else {
            return format!("{} {}", cookie, CommandError::Syntax.code());
        };

        let args: Vec<&str> = tokens.collect();

        let result = self.dispatch(opcode, &args).await;

        match result {
            Ok(body) => format!("{} {}", cookie, body),
            Err(err) => format!("{} {}", cookie, err.code()),
        }
    }

    async fn dispatch(&self, opcode: &str, args: &[&str]) -> Result<String, CommandError> {
        match opcode.to_ascii_uppercase().as_str() {
            "V" => Ok(PROTOCOL_VERSION.to_string()),
            "VF" => Ok(self.handle_feature_query(args)),
            "U" => self.handle_update_caller(args).await,
            "L" => self.handle_update_callee(args).await,
            "D" => self.handle_delete(args),
            "X" => Ok(self.handle_delete_all()),
            "Q" => self.handle_query(args),
            "G" => self.handle_stats(args),
            "I" => Ok(self.handle_info(args)),
            "P" | "S" => Err(CommandError::Internal),
            _ => Err(CommandError::Syntax),
        }
    }

    fn handle_feature_query(&self, args: &[&str]) -> String {
        match args.first() {
            Some(date) if SUPPORTED_FEATURES.contains(date) => "1".to_string(),
            _ => "0".to_string(),
        }
    }

    fn advertised(&self) -> Option<SocketAddr> {
        self.advertised_ip.map(|ip| SocketAddr::new(ip, 0))
    }

    async fn handle_update_caller(&self, args: &[&str]) -> Result<String, CommandError> {
        let [call_id, remote_ip, remote_port, from_tag, ..] = args else {
            return Err(CommandError::Syntax);
        };

        let remote = parse_remote(remote_ip, remote_port)?;

        let side = self.manager.update_caller(
            call_id,
            from_tag,
            remote,
            self.bind_ip,
            self.advertised(),
            self.asymmetric,
        )?;

        self.pump
            .register(side.clone())
            .await
            .map_err(|_| CommandError::Internal)?;

        self.observers.on_allocated(call_id, side.local_rtp.port());

        Ok(format_port_reply(&side.report_addr()))
    }

    async fn handle_update_callee(&self, args: &[&str]) -> Result<String, CommandError> {
        let [call_id, remote_ip, remote_port, from_tag, to_tag, ..] = args else {
            return Err(CommandError::Syntax);
        };

        let remote = parse_remote(remote_ip, remote_port)?;

        let side = self.manager.update_callee(
            call_id,
            from_tag,
            to_tag,
            remote,
            self.bind_ip,
            self.advertised(),
            self.asymmetric,
        )?;

        self.pump
            .register(side.clone())
            .await
            .map_err(|_| CommandError::Internal)?;

        self.observers.on_allocated(call_id, side.local_rtp.port());

        Ok(format_port_reply(&side.report_addr()))
    }

    fn handle_delete(&self, args: &[&str]) -> Result<String, CommandError> {
        let Some(call_id) = args.first() else {
            return Err(CommandError::Syntax);
        };

        let session = self.manager.delete(call_id)?;
        self.teardown_sides(&session);
        self.observers.on_destroy(call_id);

        Ok("0".to_string())
    }

    fn handle_delete_all(&self) -> String {
        let count = self.manager.delete_all();
        log::info!("deleted {} session(s) on X", count);
        "0".to_string()
    }

    fn handle_query(&self, args: &[&str]) -> Result<String, CommandError> {
        let Some(call_id) = args.first() else {
            return Err(CommandError::Syntax);
        };

        if self.manager.get(call_id).is_none() {
            return Err(CommandError::NotFound);
        }

        let counters = self.stats.counters(call_id).unwrap_or_default();

        Ok(format!(
            "{} {} {} {}",
            counters.received_packets,
            counters.received_bytes,
            counters.sent_packets,
            counters.sent_bytes,
        ))
    }

    fn handle_stats(&self, args: &[&str]) -> Result<String, CommandError> {
        match args.first() {
            Some(&"all") | None => Ok(format!("sessions:{}", self.manager.session_count())),
            Some(_name) => Err(CommandError::NotFound),
        }
    }

    /// `I`: a multi-line listing, one summary line followed by one line per
    /// live session (or, with a call-id argument, just that session's
    /// line). Lines are newline-joined into the single reply line the
    /// listener writes out; the framing only requires the reply start with
    /// the request's cookie, not that it be a single physical line.
    fn handle_info(&self, args: &[&str]) -> String {
        let sessions = match args.first() {
            Some(call_id) => self.manager.get(call_id).into_iter().collect(),
            None => self.manager.sessions(),
        };

        let mut lines = vec![format!("sessions created: {}", self.manager.session_count())];

        for session in &sessions {
            let caller_port = session.caller.read().as_ref().map(|s| s.local_rtp.port());
            let callee_port = session.callee.read().as_ref().map(|s| s.local_rtp.port());

            lines.push(format!(
                "{}: caller_port={} callee_port={}",
                session.call_id,
                caller_port.map_or_else(|| "none".to_string(), |p| p.to_string()),
                callee_port.map_or_else(|| "none".to_string(), |p| p.to_string()),
            ));
        }

        lines.join("\n")
    }

    fn teardown_sides(&self, session: &Session) {
        if let Some(side) = session.caller.read().clone() {
            self.pump.unregister(&side);
        }
        if let Some(side) = session.callee.read().clone() {
            self.pump.unregister(&side);
        }
    }
}

fn parse_remote(ip: &str, port: &str) -> Result<Option<SocketAddr>, CommandError> {
    if ip == "0.0.0.0" || ip == "::" {
        return Ok(None);
    }

    let ip: IpAddr = ip.parse().map_err(|_| CommandError::Syntax)?;
    let port: u16 = port.parse().map_err(|_| CommandError::Syntax)?;

    Ok(Some(SocketAddr::new(ip, port)))
}

fn format_port_reply(addr: &SocketAddr) -> String {
    format!("{}", addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::ObserverChain;
    use crate::ports::PortRange;
    use crate::pump::{NullStats, Pump};
    use crate::session::SessionManagerOptions;
    use std::net::Ipv4Addr;

    fn processor() -> CommandProcessor {
        let manager = SessionManager::new(SessionManagerOptions {
            port_range: PortRange::new(42000, 42020),
            default_max_ttl: 60,
            default_setup_ttl: 10,
        });

        let observers = Arc::new(ObserverChain::new());
        let pump = Pump::new(manager.clone(), observers.clone(), Arc::new(NullStats));

        CommandProcessor::new(
            manager,
            pump,
            observers,
            Arc::new(NullQueryStats),
            CommandProcessorOptions {
                bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                advertised_ip: None,
                asymmetric: false,
            },
        )
    }

    #[tokio::test]
    async fn version_query_returns_fixed_token() {
        let proc = processor();
        assert_eq!(proc.handle_line("1 V").await, "1 20040107");
    }

    #[tokio::test]
    async fn happy_path_creates_session_and_deletes_it() {
        let proc = processor();

        let reply = proc.handle_line("1 U call-1 10.0.0.1 5000 fromtag").await;
        assert!(reply.starts_with("1 "));
        let port: u16 = reply.split_whitespace().nth(1).unwrap().parse().unwrap();
        assert_eq!(port % 2, 0);

        let reply = proc
            .handle_line("2 L call-1 10.0.0.2 6000 fromtag totag")
            .await;
        assert!(reply.starts_with("2 "));

        let reply = proc.handle_line("3 D call-1 fromtag totag").await;
        assert_eq!(reply, "3 0");
    }

    #[tokio::test]
    async fn delete_unknown_session_is_not_found() {
        let proc = processor();
        let reply = proc.handle_line("1 D nosuch fromtag").await;
        assert_eq!(reply, "1 E2");
    }

    #[tokio::test]
    async fn malformed_request_is_syntax_error() {
        let proc = processor();
        let reply = proc.handle_line("1 U call-1").await;
        assert_eq!(reply, "1 E1");
    }
}
