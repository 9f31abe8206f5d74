//! Server lifecycle: startup, graceful shutdown, and single-step serving.

mod common;

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use portcullis::{ServeOptions, Server, ServerConfig};

use common::{Event, RecordingFactory, TestServer, assert_disconnected, wait_until};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> ServerConfig {
    ServerConfig::new("127.0.0.1:0".parse::<SocketAddr>().unwrap())
}

#[test]
fn shutdown_disconnects_all_clients() {
    let mut server = TestServer::start(config(), RecordingFactory::new());

    let mut c1 = server.connect();
    let mut c2 = server.connect();
    assert!(wait_until(WAIT, || server.metrics.active() == 2));

    server.stop().expect("serve");

    // Every session was closed exactly once and every client disconnected.
    let closed = server
        .events()
        .iter()
        .filter(|e| **e == Event::Closed)
        .count();
    assert_eq!(closed, 2);
    assert_eq!(server.metrics.active(), 0);
    assert_disconnected(&mut c1);
    assert_disconnected(&mut c2);
}

#[test]
fn shutdown_is_idempotent() {
    let mut server = TestServer::start(config(), RecordingFactory::new());
    server.stop().expect("serve");
    server.stop().expect("second stop");
}

#[test]
fn connections_are_dispatched_in_accept_order() {
    let mut server = TestServer::start(config(), RecordingFactory::new());

    let clients: Vec<_> = (0..3).map(|_| server.connect()).collect();
    let expected: Vec<SocketAddr> = clients
        .iter()
        .map(|c| c.local_addr().expect("local addr"))
        .collect();

    assert!(wait_until(WAIT, || {
        server
            .events()
            .iter()
            .filter(|e| matches!(e, Event::Opened(_)))
            .count()
            == 3
    }));

    let opened: Vec<SocketAddr> = server
        .events()
        .iter()
        .filter_map(|e| match e {
            Event::Opened(peer) => Some(*peer),
            _ => None,
        })
        .collect();
    assert_eq!(opened, expected);
    server.stop().expect("serve");
}

#[test]
fn nonblocking_serve_runs_one_iteration() {
    let factory = Arc::new(RecordingFactory::new());
    let session_factory: Arc<dyn portcullis::SessionFactory> = factory.clone();
    let mut server = Server::bind(config(), session_factory).expect("bind");
    let addr = server.local_addr();
    let opts = ServeOptions::new()
        .nonblocking()
        .without_interrupt_handling()
        .with_timeout(Duration::from_millis(20));

    // No pending I/O: a single iteration returns promptly.
    server.serve(&opts).expect("idle iteration");
    assert_eq!(server.active_connections(), 0);

    let mut client = std::net::TcpStream::connect(addr).expect("connect");
    client.write_all(b"ping\r\n").expect("write");

    // Caller-driven loop: iterate until the connection is dispatched.
    assert!(wait_until(WAIT, || {
        server.serve(&opts).expect("iteration");
        factory.events().contains(&Event::Handled)
    }));
    assert_eq!(server.active_connections(), 1);
}

#[cfg(unix)]
#[test]
fn worker_pool_serves_and_shuts_down_together() {
    let factory = Arc::new(RecordingFactory::new());
    let mut server = Server::bind(config(), factory.clone()).expect("bind");
    let addr = server.local_addr();
    let shutdown = server.shutdown_handle();
    let opts = ServeOptions::new()
        .without_interrupt_handling()
        .with_timeout(Duration::from_millis(20))
        .with_workers(2);
    let pool = std::thread::spawn(move || server.serve(&opts));

    // The kernel spreads these across the workers' listeners; every one
    // must be dispatched regardless of which worker it lands on.
    let mut clients: Vec<_> = (0..4)
        .map(|_| {
            let client = std::net::TcpStream::connect(addr).expect("connect");
            client.set_read_timeout(Some(WAIT)).expect("read timeout");
            client
        })
        .collect();
    assert!(wait_until(WAIT, || {
        factory
            .events()
            .iter()
            .filter(|e| **e == Event::Handled)
            .count()
            == 4
    }));

    // One handle stops the whole pool.
    shutdown.shutdown();
    pool.join().expect("pool thread").expect("serve");

    let closed = factory
        .events()
        .iter()
        .filter(|e| **e == Event::Closed)
        .count();
    assert_eq!(closed, 4);
    for client in &mut clients {
        assert_disconnected(client);
    }
}

#[test]
fn idle_server_serves_after_quiet_period() {
    let mut server = TestServer::start(config(), RecordingFactory::new());

    // Several poll timeouts elapse with no traffic.
    std::thread::sleep(Duration::from_millis(100));

    let _client = server.connect();
    assert!(wait_until(WAIT, || server.events().contains(&Event::Handled)));
    server.stop().expect("serve");
}
