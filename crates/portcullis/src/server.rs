//! Server lifecycle: bind, accept, dispatch, shutdown.
//!
//! The server binds in its constructor (misconfiguration is diagnosed
//! immediately, before any serving), then [`Server::serve`] runs a mio poll
//! loop that accepts connections, passes them through admission control, and
//! hands admitted ones to their session. A single misbehaving connection —
//! a handler fault, a failed construction — is contained and cleaned up
//! without disturbing the rest of the service.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};

use crate::admission::Admission;
use crate::config::{ServeOptions, ServerConfig};
use crate::error::{ServerError, ServerResult};
use crate::metrics::ServerMetrics;
use crate::reactor::{LISTENER_TOKEN, Registry, SIGNAL_TOKEN, SessionEntry, WAKER_TOKEN};
use crate::session::SessionFactory;
#[cfg(unix)]
use crate::signals::SignalWatcher;
use crate::tls::{TlsConfig, TlsStream};
use crate::transport::Transport;

/// Lifecycle states. Construction covers CREATED→BOUND; CLOSED is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Bound,
    Serving,
    Closed,
}

/// Shared shutdown request shared by an event loop and its handles. Under
/// the pre-fork model all workers observe the same state, so one request
/// stops the whole pool.
#[derive(Default)]
pub(crate) struct ShutdownState {
    requested: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
}

impl ShutdownState {
    fn lock_wakers(&self) -> MutexGuard<'_, Vec<Waker>> {
        match self.wakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        for waker in self.lock_wakers().iter() {
            let _ = waker.wake();
        }
    }

    fn attach(&self, waker: Waker) {
        self.lock_wakers().push(waker);
    }

    fn adopt_from(&self, other: &ShutdownState) {
        let drained: Vec<Waker> = other.lock_wakers().drain(..).collect();
        self.lock_wakers().extend(drained);
    }
}

/// Cloneable handle that requests an orderly shutdown of a serving loop
/// (and, under pre-fork, of every worker in the pool) from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    state: Arc<ShutdownState>,
}

impl ShutdownHandle {
    /// Requests shutdown and wakes the loop(s). Idempotent.
    pub fn shutdown(&self) {
        self.state.request();
    }

    /// True once shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.state.requested()
    }
}

/// Connection-accepting server front end.
///
/// Owns the listening socket and, while serving, the event loop's channel
/// registry. Sessions are owned by the registry once dispatched; the server
/// holds only a transient reference during dispatch.
pub struct Server {
    config: ServerConfig,
    factory: Arc<dyn SessionFactory>,
    listener: TcpListener,
    local_addr: SocketAddr,
    poll: Poll,
    events: Events,
    registry: Registry,
    admission: Admission,
    tls: Option<Arc<rustls::ServerConfig>>,
    metrics: Arc<ServerMetrics>,
    shutdown: Arc<ShutdownState>,
    state: Lifecycle,
}

impl Server {
    /// Resolves, binds, and listens on `config.bind_addr`.
    ///
    /// Failure here (bad address, permission denied, port in use) is fatal
    /// and raised immediately: a misconfigured server never starts limping.
    pub fn bind(config: ServerConfig, factory: Arc<dyn SessionFactory>) -> ServerResult<Self> {
        let addr = config.bind_addr;
        let listener =
            bind_listener(addr, config.backlog).map_err(|source| ServerError::Bind { addr, source })?;
        Self::from_parts(listener, config, factory)
    }

    /// Adopts a pre-bound listening socket instead of binding a fresh one.
    pub fn from_listener(
        listener: std::net::TcpListener,
        config: ServerConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> ServerResult<Self> {
        let addr = listener.local_addr()?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::Bind { addr, source })?;
        Self::from_parts(TcpListener::from_std(listener), config, factory)
    }

    fn from_parts(
        mut listener: TcpListener,
        config: ServerConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> ServerResult<Self> {
        // TLS misconfiguration surfaces here, not on the first handshake.
        let tls = config.tls.as_ref().map(TlsConfig::build_server_config).transpose()?;

        let local_addr = listener.local_addr()?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let shutdown = Arc::new(ShutdownState::default());
        shutdown.attach(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let events = Events::with_capacity(config.event_capacity);
        let admission = Admission::new(config.max_cons, config.max_cons_per_ip);
        let metrics = Arc::clone(&config.metrics);

        Ok(Self {
            config,
            factory,
            listener,
            local_addr,
            poll,
            events,
            registry: Registry::new(),
            admission,
            tls,
            metrics,
            shutdown,
            state: Lifecycle::Bound,
        })
    }

    /// The address this server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The observability handle this server reports into.
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Number of session channels currently registered.
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Handle for requesting shutdown from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            state: Arc::clone(&self.shutdown),
        }
    }

    pub(crate) fn shutdown_state(&self) -> Arc<ShutdownState> {
        Arc::clone(&self.shutdown)
    }

    /// Builds an independent worker bound to the same address via
    /// `SO_REUSEPORT`, sharing this server's shutdown state and metrics.
    pub(crate) fn spawn_sibling(&self) -> ServerResult<Self> {
        let mut config = self.config.clone();
        config.bind_addr = self.local_addr;
        let mut sibling = Self::bind(config, Arc::clone(&self.factory))?;
        sibling.share_shutdown(&self.shutdown);
        Ok(sibling)
    }

    fn share_shutdown(&mut self, state: &Arc<ShutdownState>) {
        let old = std::mem::replace(&mut self.shutdown, Arc::clone(state));
        state.adopt_from(&old);
    }

    /// Starts serving.
    ///
    /// Blocks until shutdown (or runs one loop iteration when
    /// `opts.blocking` is false). A worker count other than 1 enters the
    /// pre-fork model on Unix; combining it with non-blocking serve is a
    /// configuration error, rejected before any serving I/O.
    pub fn serve(&mut self, opts: &ServeOptions) -> ServerResult<()> {
        if self.state == Lifecycle::Closed {
            return Err(ServerError::Closed);
        }

        if opts.workers != 1 {
            if !opts.blocking {
                return Err(ServerError::Config(
                    "'workers' and non-blocking serve are mutually exclusive".into(),
                ));
            }
            #[cfg(unix)]
            {
                return crate::workers::serve_prefork(self, opts);
            }
            // Platforms without the pre-fork model serve inline instead.
        }

        self.log_start(false);
        self.run(opts)
    }

    pub(crate) fn log_start(&self, prefork: bool) {
        let model = if prefork {
            "prefork + event-loop"
        } else {
            "event-loop"
        };
        tracing::info!(
            concurrency_model = model,
            addr = %self.local_addr,
            pid = std::process::id(),
            "starting server"
        );
        tracing::debug!(
            max_cons = %cap_or_unlimited(self.config.max_cons),
            max_cons_per_ip = %cap_or_unlimited(self.config.max_cons_per_ip),
            backlog = self.config.backlog,
            tls = self.tls.is_some(),
            "server limits"
        );
    }

    /// The inline event loop for one process/worker.
    pub(crate) fn run(&mut self, opts: &ServeOptions) -> ServerResult<()> {
        self.state = Lifecycle::Serving;

        #[cfg(unix)]
        let mut signal_watcher = if opts.handle_interrupt {
            Some(SignalWatcher::new(self.poll.registry(), SIGNAL_TOKEN)?)
        } else {
            None
        };

        let mut stopping = false;
        loop {
            if self.shutdown.requested() {
                stopping = true;
            } else {
                match self.poll.poll(&mut self.events, opts.timeout) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                }

                let ready: Vec<(Token, bool, bool)> = self
                    .events
                    .iter()
                    .map(|event| (event.token(), event.is_readable(), event.is_writable()))
                    .collect();

                for (token, readable, writable) in ready {
                    match token {
                        LISTENER_TOKEN => self.accept_ready(),
                        SIGNAL_TOKEN => {
                            #[cfg(unix)]
                            if let Some(watcher) = signal_watcher.as_mut() {
                                if watcher.interrupted() {
                                    tracing::info!("received interrupt signal");
                                    stopping = true;
                                }
                            }
                        }
                        WAKER_TOKEN => {}
                        token => self.session_ready(token, readable, writable),
                    }
                }

                if self.shutdown.requested() {
                    stopping = true;
                }
            }

            if stopping {
                if opts.blocking {
                    tracing::info!(
                        sessions = self.registry.len(),
                        pid = std::process::id(),
                        "shutting down server"
                    );
                    self.close_all();
                }
                return Ok(());
            }
            if !opts.blocking {
                return Ok(());
            }
        }
    }

    /// Drains the accept queue, dispatching each connection in accept order.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.handle_accepted(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Dispatches one accepted connection: construct the session, apply
    /// admission control, hand off to the protocol.
    ///
    /// Faults in the dispatcher's own bookkeeping are server-level bugs:
    /// logged with full context and the offending connection cleaned up, but
    /// never allowed to take down the service. Faults inside the session's
    /// `handle()` are routed to its own error callback.
    fn handle_accepted(&mut self, stream: TcpStream, peer: SocketAddr) {
        let transport = match &self.tls {
            None => Transport::Plain(stream),
            Some(tls_config) => match TlsStream::new(stream, Arc::clone(tls_config)) {
                Ok(tls_stream) => Transport::Tls(tls_stream),
                Err(e) => {
                    self.metrics.dispatch_bug();
                    tracing::error!(%peer, error = %e, "failed to wrap accepted socket; dropping connection");
                    return;
                }
            },
        };

        let session = match self.factory.open(transport, peer) {
            Ok(session) => session,
            Err(e) => {
                self.metrics.dispatch_bug();
                tracing::error!(%peer, error = %e, "session construction failed; dropping connection");
                return;
            }
        };

        if !session.connected() {
            // Constructor-level rejection: not a fault, no bookkeeping.
            tracing::debug!(%peer, "session abandoned before handoff");
            return;
        }

        let ip = peer.ip();
        self.admission.record(ip);
        let token = self.registry.insert(SessionEntry { session, ip });
        self.metrics.connection_opened();

        let registered = match self.registry.get_mut(token) {
            Some(entry) => self.poll.registry().register(
                entry.session.transport_mut().socket_mut(),
                token,
                Interest::READABLE,
            ),
            None => Ok(()),
        };
        if let Err(e) = registered {
            self.metrics.dispatch_bug();
            tracing::error!(%peer, ?token, error = %e, "failed to register connection channel; dropping connection");
            self.remove_session(token);
            return;
        }

        tracing::debug!(%peer, ?token, "connection accepted");

        // Capacity is checked against the post-accept registry count, global
        // cap first: protecting the whole server from any client outranks
        // fairness between clients.
        if !self.admission.accepts_more(self.registry.len()) {
            self.metrics.rejected_global();
            tracing::info!(%peer, active = self.registry.len(), "connection refused: too many connections");
            if let Some(entry) = self.registry.get_mut(token) {
                entry.session.handle_max_cons();
            }
            self.after_event(token);
            return;
        }

        if self.admission.per_ip_exceeded(ip) {
            self.metrics.rejected_per_ip();
            tracing::info!(%peer, count = self.admission.count(ip), "connection refused: too many connections from this address");
            if let Some(entry) = self.registry.get_mut(token) {
                entry.session.handle_max_cons_per_ip();
            }
            self.after_event(token);
            return;
        }

        let fault = match self.registry.get_mut(token) {
            Some(entry) => entry.session.handle().err(),
            None => None,
        };
        if let Some(err) = fault {
            self.metrics.handler_fault();
            tracing::warn!(%peer, ?token, error = %err, "handler fault during session start");
            if let Some(entry) = self.registry.get_mut(token) {
                entry.session.handle_error(&err);
            }
        }

        self.after_event(token);
    }

    /// Routes a readiness event to its session, containing any fault.
    fn session_ready(&mut self, token: Token, readable: bool, writable: bool) {
        let fault = {
            let Some(entry) = self.registry.get_mut(token) else {
                // Stale event for an already-removed channel.
                return;
            };
            let mut fault: Option<io::Error> = None;
            if readable {
                if let Err(e) = entry.session.on_readable() {
                    fault = Some(e);
                }
            }
            if fault.is_none() && writable {
                if let Err(e) = entry.session.on_writable() {
                    fault = Some(e);
                }
            }
            fault
        };

        if let Some(err) = fault {
            self.metrics.handler_fault();
            tracing::warn!(?token, error = %err, "handler fault contained");
            if let Some(entry) = self.registry.get_mut(token) {
                entry.session.handle_error(&err);
            }
        }

        self.after_event(token);
    }

    /// Post-callback sweep: reap the channel if the session marked itself
    /// closing, otherwise refresh its registered interest.
    fn after_event(&mut self, token: Token) {
        let interest = {
            let Some(entry) = self.registry.get_mut(token) else {
                return;
            };
            if entry.session.closing() {
                None
            } else {
                Some(entry.session.interest())
            }
        };

        match interest {
            None => self.remove_session(token),
            Some(interest) => {
                let reregistered = match self.registry.get_mut(token) {
                    Some(entry) => self.poll.registry().reregister(
                        entry.session.transport_mut().socket_mut(),
                        token,
                        interest,
                    ),
                    None => Ok(()),
                };
                if let Err(e) = reregistered {
                    tracing::warn!(?token, error = %e, "failed to update channel interest; closing connection");
                    self.remove_session(token);
                }
            }
        }
    }

    /// Removes a channel: deregister, close the session exactly once, and
    /// release its admission slot.
    fn remove_session(&mut self, token: Token) {
        let Some(mut entry) = self.registry.remove(token) else {
            return;
        };
        let _ = self
            .poll
            .registry()
            .deregister(entry.session.transport_mut().socket_mut());
        entry.session.close();
        self.admission.release(entry.ip);
        self.metrics.connection_closed();
        tracing::debug!(?token, ip = %entry.ip, "connection channel removed");
    }

    /// Stops serving and forcibly disconnects every connected client.
    /// Irreversible: the server cannot serve again afterwards. Idempotent.
    pub fn close_all(&mut self) {
        if self.state == Lifecycle::Closed {
            return;
        }
        for token in self.registry.tokens() {
            self.remove_session(token);
        }
        debug_assert!(self.registry.is_empty());
        let _ = self.poll.registry().deregister(&mut self.listener);
        self.state = Lifecycle::Closed;
        tracing::info!(addr = %self.local_addr, "server closed");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    // Workers under the pre-fork model bind the same address.
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    Ok(TcpListener::from_std(socket.into()))
}

fn cap_or_unlimited(cap: usize) -> String {
    if cap == 0 {
        "unlimited".to_string()
    } else {
        cap.to_string()
    }
}
