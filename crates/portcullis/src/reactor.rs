//! Channel registry and poll token layout.
//!
//! Tokens 0-2 are reserved for the listener, the signal watcher, and the
//! shutdown waker; session channels start at 3. The registry counts session
//! channels only — the listener is not a connection and does not count
//! against the admission caps.

use std::collections::HashMap;
use std::net::IpAddr;

use mio::Token;

use crate::session::Session;

pub(crate) const LISTENER_TOKEN: Token = Token(0);
pub(crate) const SIGNAL_TOKEN: Token = Token(1);
pub(crate) const WAKER_TOKEN: Token = Token(2);
const FIRST_SESSION_TOKEN: usize = 3;

/// One active session channel plus the admission bookkeeping needed to
/// release its slot when the channel is removed.
pub(crate) struct SessionEntry {
    pub session: Box<dyn Session>,
    /// Remote address recorded in the admission multiset on accept.
    pub ip: IpAddr,
}

/// The set of session channels registered with the event loop.
pub(crate) struct Registry {
    entries: HashMap<Token, SessionEntry>,
    next_token: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_token: FIRST_SESSION_TOKEN,
        }
    }

    /// Number of active session channels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers a session channel and returns its token.
    pub fn insert(&mut self, entry: SessionEntry) -> Token {
        let token = self.next_free_token();
        self.entries.insert(token, entry);
        token
    }

    fn next_free_token(&mut self) -> Token {
        loop {
            let candidate = Token(self.next_token);
            self.next_token = self
                .next_token
                .checked_add(1)
                .unwrap_or(FIRST_SESSION_TOKEN);
            if candidate.0 >= FIRST_SESSION_TOKEN && !self.entries.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut SessionEntry> {
        self.entries.get_mut(&token)
    }

    pub fn remove(&mut self, token: Token) -> Option<SessionEntry> {
        self.entries.remove(&token)
    }

    /// Snapshot of the active tokens, in registration order.
    pub fn tokens(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self.entries.keys().copied().collect();
        tokens.sort_unstable();
        tokens
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::net::SocketAddr;

    use mio::Interest;

    use super::*;
    use crate::transport::Transport;

    struct StubSession {
        transport: Transport,
        closing: bool,
    }

    impl Session for StubSession {
        fn handle(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn handle_error(&mut self, _err: &io::Error) {
            self.closing = true;
        }
        fn handle_max_cons(&mut self) {
            self.closing = true;
        }
        fn handle_max_cons_per_ip(&mut self) {
            self.closing = true;
        }
        fn on_readable(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn interest(&self) -> Interest {
            Interest::READABLE
        }
        fn closing(&self) -> bool {
            self.closing
        }
        fn close(&mut self) {
            self.closing = true;
        }
        fn transport_mut(&mut self) -> &mut Transport {
            &mut self.transport
        }
    }

    fn entry() -> (SessionEntry, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr: SocketAddr = listener.local_addr().expect("addr");
        let client = std::net::TcpStream::connect(addr).expect("connect");
        let (accepted, peer) = listener.accept().expect("accept");
        accepted.set_nonblocking(true).expect("nonblocking");
        let session = StubSession {
            transport: Transport::Plain(mio::net::TcpStream::from_std(accepted)),
            closing: false,
        };
        (
            SessionEntry {
                session: Box::new(session),
                ip: peer.ip(),
            },
            client,
        )
    }

    #[test]
    fn tokens_start_after_reserved_range() {
        let mut registry = Registry::new();
        let (e, _client) = entry();
        let token = registry.insert(e);
        assert!(token.0 >= FIRST_SESSION_TOKEN);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn tokens_are_unique_while_live() {
        let mut registry = Registry::new();
        let (a, _ca) = entry();
        let (b, _cb) = entry();
        let ta = registry.insert(a);
        let tb = registry.insert(b);
        assert_ne!(ta, tb);
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(ta).is_some());
        assert_eq!(registry.len(), 1);
        assert!(registry.get_mut(ta).is_none());
        assert!(registry.get_mut(tb).is_some());
    }

    #[test]
    fn removing_unknown_token_is_none() {
        let mut registry = Registry::new();
        assert!(registry.remove(Token(99)).is_none());
        assert!(registry.is_empty());
    }
}
