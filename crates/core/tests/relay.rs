//! End-to-end scenarios wiring the session table, pump, command processor
//! and TTL reaper together, the way `src/lib.rs::startup` assembles them in
//! the binary crate. Unit tests inside each module already cover that
//! module in isolation; these exercise the seams between them, mirroring
//! the teacher's `crates/service/tests/turn.rs` (one `#[test]`/
//! `#[tokio::test]` per end-to-end scenario, real sockets, no mocks).

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use rtprelay_core::command::{CommandProcessor, CommandProcessorOptions, NullQueryStats};
use rtprelay_core::observer::ObserverChain;
use rtprelay_core::pump::{NullStats, Pump};
use rtprelay_core::session::{SessionManager, SessionManagerOptions};
use rtprelay_core::ttl::{NullNotifier, TtlReaper};
use rtprelay_core::wheel::TimedWheel;
use rtprelay_core::ports::PortRange;

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn processor(port_range: PortRange, max_ttl: u64, setup_ttl: u64) -> (Arc<CommandProcessor>, Arc<SessionManager>) {
    let manager = SessionManager::new(SessionManagerOptions {
        port_range,
        default_max_ttl: max_ttl,
        default_setup_ttl: setup_ttl,
    });

    let observers = Arc::new(ObserverChain::new());
    let pump = Pump::new(manager.clone(), observers.clone(), Arc::new(NullStats));

    let processor = Arc::new(CommandProcessor::new(
        manager.clone(),
        pump,
        observers,
        Arc::new(NullQueryStats),
        CommandProcessorOptions {
            bind_ip: LOOPBACK,
            advertised_ip: None,
            asymmetric: false,
        },
    ));

    (processor, manager)
}

#[tokio::test]
async fn happy_path_update_then_forward_then_delete() {
    let (processor, manager) = processor(PortRange::new(42000, 42100), 60, 30);

    let reply = processor.handle_line("1 U call-1 0.0.0.0 0 from-tag").await;
    assert!(reply.starts_with("1 "), "expected a port reply, got {reply}");
    let caller_port: u16 = reply.split_whitespace().nth(1).unwrap().parse().unwrap();

    let reply = processor.handle_line("2 L call-1 0.0.0.0 0 from-tag to-tag").await;
    let callee_port: u16 = reply.split_whitespace().nth(1).unwrap().parse().unwrap();

    let caller_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let callee_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    caller_socket
        .send_to(b"rtp-from-caller", (LOOPBACK, caller_port))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    callee_socket
        .send_to(b"rtp-from-callee", (LOOPBACK, callee_port))
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = tokio::time::timeout(Duration::from_millis(200), caller_socket.recv_from(&mut buf))
        .await
        .expect("caller should receive the forwarded datagram")
        .unwrap();
    assert_eq!(&buf[..n], b"rtp-from-callee");

    let reply = processor.handle_line("3 D call-1").await;
    assert_eq!(reply, "3 0");
    assert_eq!(manager.session_count(), 0);
}

#[tokio::test]
async fn symmetric_learning_redirects_to_the_source_of_the_last_packet() {
    let (processor, _manager) = processor(PortRange::new(42200, 42300), 60, 30);

    let reply = processor.handle_line("1 U call-2 0.0.0.0 0 from-tag").await;
    let caller_port: u16 = reply.split_whitespace().nth(1).unwrap().parse().unwrap();
    let reply = processor.handle_line("2 L call-2 0.0.0.0 0 from-tag to-tag").await;
    let callee_port: u16 = reply.split_whitespace().nth(1).unwrap().parse().unwrap();

    let first_callee_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let second_callee_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // caller sends first so the callee side has somewhere to forward to.
    let caller_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    caller_socket.send_to(b"seed", (LOOPBACK, caller_port)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    first_callee_socket
        .send_to(b"from-first", (LOOPBACK, callee_port))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    // a second source now sends to the same session port; the pump should
    // relearn it and stop sending to the first source.
    second_callee_socket
        .send_to(b"from-second", (LOOPBACK, callee_port))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    caller_socket.send_to(b"relay-me", (LOOPBACK, caller_port)).await.unwrap();

    let mut buf = [0u8; 64];
    let recv = tokio::time::timeout(Duration::from_millis(150), second_callee_socket.recv_from(&mut buf)).await;
    assert!(recv.is_ok(), "second source should now receive forwarded traffic");
}

#[tokio::test]
async fn idle_session_is_reaped_after_max_ttl() {
    let (processor, manager) = processor(PortRange::new(42400, 42410), 1, 1);

    processor.handle_line("1 U call-3 0.0.0.0 0 from-tag").await;
    processor.handle_line("2 L call-3 0.0.0.0 0 from-tag to-tag").await;
    assert_eq!(manager.session_count(), 1);

    // the reaper runs on its own real-time wheel thread, independent of
    // tokio's clock, so this sleeps real wall time rather than a paused one.
    let wheel = TimedWheel::new(Duration::from_millis(10));
    let observers = Arc::new(ObserverChain::new());
    let reaper = TtlReaper::spawn(wheel.clone(), manager.clone(), observers, Arc::new(NullNotifier));

    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert_eq!(manager.session_count(), 0);

    reaper.stop();
    wheel.shutdown();
}

#[tokio::test]
async fn port_exhaustion_surfaces_as_e5() {
    // one pair available: the caller's `U` consumes it, so the callee's `L`
    // for a second call-id must fail with the resource-exhausted code.
    let (processor, _manager) = processor(PortRange::new(42500, 42500), 60, 30);

    let reply = processor.handle_line("1 U call-4 0.0.0.0 0 from-tag").await;
    assert!(!reply.contains("E5"));

    let reply = processor.handle_line("2 U call-5 0.0.0.0 0 from-tag").await;
    assert_eq!(reply, "2 E5");
}
