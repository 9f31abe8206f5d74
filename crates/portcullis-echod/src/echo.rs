//! Line-echo protocol session.
//!
//! A deliberately small protocol on top of the portcullis session contract:
//! greet with a `220` banner, then echo every received line back verbatim.
//! Capacity rejections send a `421` reply and disconnect once the reply has
//! been flushed.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use portcullis::{Interest, Session, SessionFactory, Transport};

const GREETING: &[u8] = b"220 portcullis-echod ready\r\n";
const REPLY_MAX_CONS: &[u8] = b"421 Too many connections. Service temporarily unavailable.\r\n";
const REPLY_MAX_CONS_PER_IP: &[u8] = b"421 Too many connections from the same IP address.\r\n";

const READ_CHUNK: usize = 4096;

pub struct EchoSession {
    transport: Transport,
    peer: SocketAddr,
    inbuf: BytesMut,
    outbuf: BytesMut,
    /// Once set, the channel closes as soon as the output buffer drains.
    quitting: bool,
}

impl EchoSession {
    fn new(transport: Transport, peer: SocketAddr) -> Self {
        Self {
            transport,
            peer,
            inbuf: BytesMut::with_capacity(READ_CHUNK),
            outbuf: BytesMut::new(),
            quitting: false,
        }
    }

    /// Queues a reply and flushes as much of the output buffer as the
    /// socket accepts right now.
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.outbuf.extend_from_slice(data);
        self.flush_outbuf()
    }

    fn flush_outbuf(&mut self) -> io::Result<()> {
        while !self.outbuf.is_empty() {
            match self.transport.write(&self.outbuf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.outbuf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Echoes each complete line in the input buffer.
    fn echo_lines(&mut self) -> io::Result<()> {
        while let Some(end) = self.inbuf.iter().position(|&b| b == b'\n') {
            let line = self.inbuf.split_to(end + 1);
            self.outbuf.extend_from_slice(&line);
        }
        self.flush_outbuf()
    }
}

impl Session for EchoSession {
    fn handle(&mut self) -> io::Result<()> {
        tracing::info!(peer = %self.peer, secured = self.transport.is_secured(), "client connected");
        self.send(GREETING)
    }

    fn handle_error(&mut self, err: &io::Error) {
        tracing::warn!(peer = %self.peer, error = %err, "session error; disconnecting");
        self.outbuf.clear();
        self.quitting = true;
    }

    fn handle_max_cons(&mut self) {
        let _ = self.send(REPLY_MAX_CONS);
        self.quitting = true;
    }

    fn handle_max_cons_per_ip(&mut self) {
        let _ = self.send(REPLY_MAX_CONS_PER_IP);
        self.quitting = true;
    }

    fn on_readable(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.transport.read(&mut chunk) {
                Ok(0) => {
                    self.quitting = true;
                    break;
                }
                Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.echo_lines()
    }

    fn on_writable(&mut self) -> io::Result<()> {
        self.flush_outbuf()
    }

    fn interest(&self) -> Interest {
        if self.outbuf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    fn closing(&self) -> bool {
        self.quitting && self.outbuf.is_empty()
    }

    fn close(&mut self) {
        let _ = self.transport.shutdown();
        tracing::info!(peer = %self.peer, "client disconnected");
    }

    fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }
}

pub struct EchoFactory;

impl SessionFactory for EchoFactory {
    fn open(&self, transport: Transport, peer: SocketAddr) -> io::Result<Box<dyn Session>> {
        Ok(Box::new(EchoSession::new(transport, peer)))
    }
}
