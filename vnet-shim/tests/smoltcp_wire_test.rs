//! End-to-end tests: two interfaces running the smoltcp engine over an
//! in-process virtual wire.

use std::net::SocketAddr;
use std::time::Duration;

use vnet_shim::{ConnectionState, LocalSocket, SocketType};

mod harness;
use harness::{NodePair, wait_until};

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn test_tcp_connect_exchange_and_close() {
    let _ = tracing_subscriber::fmt::try_init();
    let pair = NodePair::new();
    let server_addr: SocketAddr = "10.77.0.1:8080".parse().unwrap();

    let listener = pair.a.iface.open(SocketType::Stream, None).unwrap();
    pair.a.iface.bind(listener, server_addr).unwrap();
    pair.a.iface.listen(listener, 4).unwrap();

    let client = pair.b.iface.open(SocketType::Stream, Some(LocalSocket(20))).unwrap();
    pair.b.iface.connect(client, server_addr).unwrap();

    let mut accepted = None;
    assert!(
        wait_until(TIMEOUT, || {
            accepted = pair.a.iface.accept(listener).unwrap();
            accepted.is_some()
        }),
        "no connection accepted"
    );
    let accepted = accepted.unwrap();
    pair.a.iface.attach_local(accepted, LocalSocket(10)).unwrap();
    assert!(wait_until(TIMEOUT, || {
        pair.b.iface.connection_state(client) == Some(ConnectionState::Connected)
    }));

    pair.b.iface.write(client, b"ping").unwrap();
    assert!(wait_until(TIMEOUT, || pair.a.bridge.written_to(LocalSocket(10)) == b"ping"));

    pair.a.iface.write(accepted, b"pong").unwrap();
    assert!(wait_until(TIMEOUT, || pair.b.bridge.written_to(LocalSocket(20)) == b"pong"));

    // Peer close propagates to the other side's local socket
    pair.b.iface.close(client).unwrap();
    assert!(wait_until(TIMEOUT, || {
        pair.a.iface.connection_state(accepted) == Some(ConnectionState::Closing)
    }));
    assert!(pair.a.bridge.closes().contains(&LocalSocket(10)));
    assert!(pair.wire.frames_delivered() > 0);
}

#[test]
fn test_udp_datagram_delivery() {
    let _ = tracing_subscriber::fmt::try_init();
    let pair = NodePair::new();

    let rx = pair.a.iface.open(SocketType::Datagram, Some(LocalSocket(1))).unwrap();
    pair.a.iface.bind(rx, "10.77.0.1:5353".parse().unwrap()).unwrap();

    let tx = pair.b.iface.open(SocketType::Datagram, None).unwrap();
    pair.b.iface.bind(tx, "10.77.0.2:0".parse().unwrap()).unwrap();
    pair.b.iface.connect(tx, "10.77.0.1:5353".parse().unwrap()).unwrap();

    // The first datagram may be dropped while ARP resolves
    assert!(wait_until(TIMEOUT, || {
        let _ = pair.b.iface.write(tx, b"query");
        !pair.a.bridge.written_to(LocalSocket(1)).is_empty()
    }));
    assert!(pair.a.bridge.written_to(LocalSocket(1)).starts_with(b"query"));
}

#[test]
fn test_shutdown_releases_connections() {
    let pair = NodePair::new();
    let conn = pair.a.iface.open(SocketType::Stream, Some(LocalSocket(3))).unwrap();
    pair.a.iface.connect(conn, "10.77.0.2:9".parse().unwrap()).unwrap();

    pair.a.iface.shutdown();
    assert_eq!(pair.a.iface.connection_count(), 0);
    assert_eq!(pair.a.bridge.closes(), vec![LocalSocket(3)]);
    assert!(!pair.a.iface.is_running());
}
