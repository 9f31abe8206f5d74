//! Shared harness: a recording session factory plus a server running on a
//! background thread.

// Each test binary uses its own subset of this module.
#![allow(dead_code)]

use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use portcullis::{
    Interest, ServeOptions, Server, ServerMetrics, ServerResult, Session, SessionFactory,
    ShutdownHandle, Transport,
};

/// Observable lifecycle events recorded by [`RecordingSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Opened(SocketAddr),
    Handled,
    MaxCons,
    MaxConsPerIp,
    Fault,
    Closed,
}

pub struct RecordingSession {
    transport: Transport,
    events: Arc<Mutex<Vec<Event>>>,
    fault_on_handle: bool,
    closing: bool,
}

impl RecordingSession {
    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl Session for RecordingSession {
    fn handle(&mut self) -> io::Result<()> {
        if self.fault_on_handle {
            return Err(io::Error::other("injected handler fault"));
        }
        self.record(Event::Handled);
        Ok(())
    }

    fn handle_error(&mut self, _err: &io::Error) {
        self.record(Event::Fault);
        self.closing = true;
    }

    fn handle_max_cons(&mut self) {
        self.record(Event::MaxCons);
        self.closing = true;
    }

    fn handle_max_cons_per_ip(&mut self) {
        self.record(Event::MaxConsPerIp);
        self.closing = true;
    }

    fn on_readable(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; 1024];
        loop {
            match self.transport.read(&mut chunk) {
                Ok(0) => {
                    self.closing = true;
                    break;
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn interest(&self) -> Interest {
        Interest::READABLE
    }

    fn closing(&self) -> bool {
        self.closing
    }

    fn close(&mut self) {
        self.record(Event::Closed);
    }

    fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }
}

/// Factory that records every dispatch and can inject failures by
/// connection ordinal (0-based accept order).
pub struct RecordingFactory {
    events: Arc<Mutex<Vec<Event>>>,
    opened: AtomicUsize,
    fail_nth: Option<usize>,
    fault_nth: Option<usize>,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            opened: AtomicUsize::new(0),
            fail_nth: None,
            fault_nth: None,
        }
    }

    /// The nth construction returns an error.
    pub fn fail_construction(mut self, nth: usize) -> Self {
        self.fail_nth = Some(nth);
        self
    }

    /// The nth session's `handle()` returns an error.
    pub fn fault_handle(mut self, nth: usize) -> Self {
        self.fault_nth = Some(nth);
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Default for RecordingFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionFactory for RecordingFactory {
    fn open(&self, transport: Transport, peer: SocketAddr) -> io::Result<Box<dyn Session>> {
        let ordinal = self.opened.fetch_add(1, Ordering::SeqCst);
        if self.fail_nth == Some(ordinal) {
            return Err(io::Error::other("injected construction failure"));
        }
        self.events.lock().unwrap().push(Event::Opened(peer));
        Ok(Box::new(RecordingSession {
            transport,
            events: Arc::clone(&self.events),
            fault_on_handle: self.fault_nth == Some(ordinal),
            closing: false,
        }))
    }
}

/// A server serving on a background thread until dropped or stopped.
pub struct TestServer {
    pub addr: SocketAddr,
    pub metrics: Arc<ServerMetrics>,
    pub factory: Arc<RecordingFactory>,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<ServerResult<()>>>,
}

impl TestServer {
    pub fn start(config: portcullis::ServerConfig, factory: RecordingFactory) -> Self {
        let factory = Arc::new(factory);
        let session_factory: Arc<dyn SessionFactory> = factory.clone();
        let mut server = Server::bind(config, session_factory).expect("bind");
        let addr = server.local_addr();
        let metrics = server.metrics();
        let shutdown = server.shutdown_handle();
        let opts = ServeOptions::new()
            .without_interrupt_handling()
            .with_timeout(Duration::from_millis(20));
        let thread = std::thread::spawn(move || server.serve(&opts));
        Self {
            addr,
            metrics,
            factory,
            shutdown,
            thread: Some(thread),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.factory.events()
    }

    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        stream
    }

    pub fn stop(&mut self) -> ServerResult<()> {
        self.shutdown.shutdown();
        match self.thread.take() {
            Some(thread) => thread.join().expect("serve thread panicked"),
            None => Ok(()),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Polls `predicate` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Waits for the peer to close the connection (read returns EOF).
pub fn assert_disconnected(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => panic!("expected orderly disconnect, got error: {e}"),
        }
    }
}
