//! Best-effort expiry notification (spec §6.3, `relay_core::ttl::ExpiryNotifier`).
//!
//! When a session's `U`/`L` request carried a `notify_socket:notify_tag`
//! pair, the reaper's expiry of that session fires a one-line UDP or unix
//! datagram (`notify_tag\n`) at the configured address, mirroring
//! `rtpproxy`'s `rtpp_notify` subsystem. Delivery is fire-and-forget: a
//! failed send is logged and otherwise ignored, matching the spec's
//! "best-effort" framing for this subsystem's external wire format.

use std::net::SocketAddr;

use relay_core::ttl::ExpiryNotifier;
use tokio::net::{UdpSocket, UnixDatagram};
use tokio::sync::mpsc;

enum Target {
    Udp(SocketAddr),
    Unix(String),
}

fn parse_target(socket: &str) -> Option<Target> {
    if let Some(path) = socket.strip_prefix("unix:") {
        return Some(Target::Unix(path.to_string()));
    }

    socket.parse().ok().map(Target::Udp)
}

struct Dispatch {
    socket: String,
    tag: String,
}

/// Dispatches expiry notifications on a background task, so the reaper's
/// synchronous `notify_expired` call never blocks on I/O.
pub struct Notifier {
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl Notifier {
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Dispatch>();

        tokio::spawn(async move {
            let udp = UdpSocket::bind("0.0.0.0:0").await.ok();

            while let Some(dispatch) = rx.recv().await {
                let Some(target) = parse_target(&dispatch.socket) else {
                    log::warn!("notify: unparseable target '{}'", dispatch.socket);
                    continue;
                };

                let payload = format!("{}\n", dispatch.tag);

                let result = match (&target, &udp) {
                    (Target::Udp(addr), Some(udp)) => udp.send_to(payload.as_bytes(), addr).await.map(drop),
                    (Target::Udp(_), None) => continue,
                    (Target::Unix(path), _) => send_unix(path, payload.as_bytes()).await,
                };

                if let Err(err) = result {
                    log::debug!("notify: failed to deliver to {}: {err}", dispatch.socket);
                }
            }
        });

        Self { tx }
    }
}

async fn send_unix(path: &str, payload: &[u8]) -> std::io::Result<()> {
    let socket = UnixDatagram::unbound()?;
    socket.send_to(payload, path).await?;
    Ok(())
}

impl ExpiryNotifier for Notifier {
    fn notify_expired(&self, call_id: &str, target: Option<&str>) {
        let Some(target) = target else {
            return;
        };

        // `target` is `notify_socket:notify_tag`; split on the last colon
        // since unix socket paths may themselves contain colons.
        let Some((socket, tag)) = target.rsplit_once(':') else {
            log::warn!("notify: malformed notify target '{target}' for call {call_id}");
            return;
        };

        let _ = self.tx.send(Dispatch {
            socket: socket.to_string(),
            tag: tag.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udp_target() {
        assert!(matches!(parse_target("127.0.0.1:9000"), Some(Target::Udp(_))));
    }

    #[test]
    fn parses_unix_target() {
        assert!(matches!(parse_target("unix:/tmp/notify.sock"), Some(Target::Unix(_))));
    }
}
