//! Control-socket listener (spec component C10).
//!
//! Binds every configured control endpoint (§6.1's `type:path[:opts]`
//! syntax) and frames incoming requests into the line protocol the command
//! processor (`relay_core::command::CommandProcessor`) understands: one
//! line per request on stream transports, one datagram per request on
//! datagram transports. No teacher file speaks this protocol; this module
//! is grounded on the teacher's `src/server/socket.rs` + `dgram.rs` shape
//! (one spawned accept/recv loop per configured transport, handed a shared
//! handler), generalized from STUN framing to newline/datagram framing.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use relay_core::command::CommandProcessor;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UdpSocket, UnixDatagram, UnixListener};

const MAX_DGRAM: usize = 65_536;

/// One configured control endpoint, parsed from the `type:path[:opts]`
/// syntax of spec §6.1.
#[derive(Debug, Clone)]
pub enum ControlSpec {
    UnixDgram(PathBuf),
    UnixStream(PathBuf),
    Udp(SocketAddr),
    Udp6(SocketAddr),
    Tcp(SocketAddr),
    Tcp6(SocketAddr),
    Stdio,
    /// Socket-activated TCP listener: fd 3, per the systemd socket-
    /// activation convention. `rtpproxy` itself only supports this for a
    /// single endpoint; preserved here unchanged (Open Question (a) is
    /// about `--dso`, not this, but the same "one instance only" caution
    /// applies and is not enforced).
    Sysd,
}

#[derive(Debug)]
pub struct ControlSpecParseError(String);

impl std::error::Error for ControlSpecParseError {}

impl fmt::Display for ControlSpecParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid control socket spec '{}'", self.0)
    }
}

fn parse_socket_addr(rest: &str) -> Result<SocketAddr, ControlSpecParseError> {
    if let Ok(addr) = rest.parse() {
        return Ok(addr);
    }

    // tolerate a trailing `:opts` segment by dropping it and retrying once.
    if let Some((addr, _opts)) = rest.rsplit_once(':') {
        if let Ok(addr) = addr.parse() {
            return Ok(addr);
        }
    }

    Err(ControlSpecParseError(rest.to_string()))
}

impl FromStr for ControlSpec {
    type Err = ControlSpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s
            .split_once(':')
            .ok_or_else(|| ControlSpecParseError(s.to_string()))?;

        Ok(match kind {
            "stdio" => ControlSpec::Stdio,
            "sysd" => ControlSpec::Sysd,
            "unix" => ControlSpec::UnixDgram(PathBuf::from(rest)),
            "cunix" => ControlSpec::UnixStream(PathBuf::from(rest)),
            "udp" => ControlSpec::Udp(parse_socket_addr(rest)?),
            "udp6" => ControlSpec::Udp6(parse_socket_addr(rest)?),
            "tcp" => ControlSpec::Tcp(parse_socket_addr(rest)?),
            "tcp6" => ControlSpec::Tcp6(parse_socket_addr(rest)?),
            _ => return Err(ControlSpecParseError(s.to_string())),
        })
    }
}

impl fmt::Display for ControlSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlSpec::UnixDgram(p) => write!(f, "unix:{}", p.display()),
            ControlSpec::UnixStream(p) => write!(f, "cunix:{}", p.display()),
            ControlSpec::Udp(a) => write!(f, "udp:{a}"),
            ControlSpec::Udp6(a) => write!(f, "udp6:{a}"),
            ControlSpec::Tcp(a) => write!(f, "tcp:{a}"),
            ControlSpec::Tcp6(a) => write!(f, "tcp6:{a}"),
            ControlSpec::Stdio => write!(f, "stdio:"),
            ControlSpec::Sysd => write!(f, "sysd:"),
        }
    }
}

impl serde::Serialize for ControlSpec {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ControlSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Binds every configured endpoint and dispatches framed requests to the
/// shared [`CommandProcessor`]. Each endpoint runs on its own spawned task,
/// matching the spec's "dedicated thread or epoll set" per C10.
pub struct Listener;

impl Listener {
    pub async fn bind_all(specs: &[ControlSpec], processor: Arc<CommandProcessor>) -> Result<()> {
        for spec in specs {
            Self::bind_one(spec.clone(), processor.clone())
                .await
                .with_context(|| format!("binding control endpoint {spec}"))?;
        }

        Ok(())
    }

    async fn bind_one(spec: ControlSpec, processor: Arc<CommandProcessor>) -> Result<()> {
        match spec {
            ControlSpec::UnixStream(path) => {
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path)?;
                log::info!("control: listening on cunix:{}", path.display());

                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, _)) => {
                                let processor = processor.clone();
                                tokio::spawn(serve_stream(stream, processor));
                            }
                            Err(err) => {
                                log::error!("control listener accept failed: {err}");
                                break;
                            }
                        }
                    }
                });
            }
            ControlSpec::Tcp(addr) | ControlSpec::Tcp6(addr) => {
                let listener = TcpListener::bind(addr).await?;
                log::info!("control: listening on tcp:{addr}");

                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, _)) => {
                                let processor = processor.clone();
                                tokio::spawn(serve_stream(stream, processor));
                            }
                            Err(err) => {
                                log::error!("control listener accept failed: {err}");
                                break;
                            }
                        }
                    }
                });
            }
            ControlSpec::UnixDgram(path) => {
                let _ = std::fs::remove_file(&path);
                let socket = UnixDatagram::bind(&path)?;
                log::info!("control: listening on unix:{}", path.display());

                tokio::spawn(async move {
                    let mut buf = vec![0u8; MAX_DGRAM];
                    loop {
                        match socket.recv_from(&mut buf).await {
                            Ok((n, from)) => {
                                let reply = processor.handle_line(line_of(&buf[..n])).await;
                                if let Some(from) = from.as_pathname() {
                                    let _ = socket.send_to(format!("{reply}\n").as_bytes(), from).await;
                                }
                            }
                            Err(err) => {
                                log::error!("control dgram recv failed: {err}");
                                break;
                            }
                        }
                    }
                });
            }
            ControlSpec::Udp(addr) | ControlSpec::Udp6(addr) => {
                let socket = UdpSocket::bind(addr).await?;
                log::info!("control: listening on udp:{addr}");

                tokio::spawn(async move {
                    let mut buf = vec![0u8; MAX_DGRAM];
                    loop {
                        match socket.recv_from(&mut buf).await {
                            Ok((n, from)) => {
                                let reply = processor.handle_line(line_of(&buf[..n])).await;
                                let _ = socket.send_to(format!("{reply}\n").as_bytes(), from).await;
                            }
                            Err(err) => {
                                log::error!("control dgram recv failed: {err}");
                                break;
                            }
                        }
                    }
                });
            }
            ControlSpec::Stdio => {
                log::info!("control: listening on stdio");

                tokio::spawn(async move {
                    let mut lines = BufReader::new(tokio::io::stdin()).lines();
                    let mut stdout = tokio::io::stdout();

                    while let Ok(Some(line)) = lines.next_line().await {
                        let reply = processor.handle_line(&line).await;
                        if stdout.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                            break;
                        }
                        let _ = stdout.flush().await;
                    }
                });
            }
            ControlSpec::Sysd => {
                #[cfg(unix)]
                {
                    use std::os::fd::FromRawFd;

                    // systemd socket activation convention: the first
                    // passed socket is fd 3.
                    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(3) };
                    std_listener.set_nonblocking(true)?;
                    let listener = TcpListener::from_std(std_listener)?;
                    log::info!("control: listening on sysd-activated socket (fd 3)");

                    tokio::spawn(async move {
                        loop {
                            match listener.accept().await {
                                Ok((stream, _)) => {
                                    let processor = processor.clone();
                                    tokio::spawn(serve_stream(stream, processor));
                                }
                                Err(err) => {
                                    log::error!("control listener accept failed: {err}");
                                    break;
                                }
                            }
                        }
                    });
                }

                #[cfg(not(unix))]
                anyhow::bail!("sysd control endpoints require a unix target");
            }
        }

        Ok(())
    }
}

fn line_of(buf: &[u8]) -> &str {
    std::str::from_utf8(buf).unwrap_or_default().trim_end_matches(['\r', '\n'])
}

async fn serve_stream<S>(stream: S, processor: Arc<CommandProcessor>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let reply = processor.handle_line(&line).await;
                if writer.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                log::debug!("control connection read failed: {err}");
                break;
            }
        }
    }
}
