//! Server configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::metrics::ServerMetrics;
use crate::tls::TlsConfig;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Listen backlog: the OS queue depth for not-yet-accepted connections.
    pub backlog: u32,
    /// Global cap on simultaneous connections. Defaults to 512. 0 means
    /// unlimited, but a limit is recommended to avoid running out of file
    /// descriptors.
    pub max_cons: usize,
    /// Cap on simultaneous connections from one address. Defaults to 0
    /// (unlimited).
    pub max_cons_per_ip: usize,
    /// Capacity of the event buffer handed to the poller.
    pub event_capacity: usize,
    /// TLS configuration. None disables TLS.
    pub tls: Option<TlsConfig>,
    /// Observability handle. Fresh counters by default; inject a shared
    /// handle to aggregate across servers.
    pub metrics: Arc<ServerMetrics>,
}

impl ServerConfig {
    /// Creates a configuration listening on `bind_addr` with defaults.
    pub fn new(bind_addr: impl Into<SocketAddr>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            backlog: 100,
            max_cons: 512,
            max_cons_per_ip: 0,
            event_capacity: 1024,
            tls: None,
            metrics: Arc::new(ServerMetrics::new()),
        }
    }

    /// Sets the listen backlog.
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Sets the global connection cap. 0 means unlimited.
    pub fn with_max_cons(mut self, max_cons: usize) -> Self {
        self.max_cons = max_cons;
        self
    }

    /// Sets the per-address connection cap. 0 means unlimited.
    pub fn with_max_cons_per_ip(mut self, max_cons_per_ip: usize) -> Self {
        self.max_cons_per_ip = max_cons_per_ip;
        self
    }

    /// Enables TLS with the given configuration.
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Injects a shared observability handle.
    pub fn with_metrics(mut self, metrics: Arc<ServerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(
            "127.0.0.1:2121"
                .parse::<SocketAddr>()
                .expect("valid address"),
        )
    }
}

/// Options for one call to [`Server::serve`](crate::Server::serve).
#[derive(Debug, Clone, Copy)]
pub struct ServeOptions {
    /// Upper bound on how long one poll iteration blocks waiting for
    /// readiness when no I/O is pending. None blocks until the next event.
    /// This is not a per-connection idle timeout.
    pub timeout: Option<Duration>,
    /// If false, run a single loop iteration and return. Mutually exclusive
    /// with a worker count other than 1.
    pub blocking: bool,
    /// When true, SIGINT/SIGTERM are caught and converted into an orderly
    /// shutdown instead of killing the process. When false the caller owns
    /// interrupt semantics entirely (see
    /// [`Server::shutdown_handle`](crate::Server::shutdown_handle)).
    pub handle_interrupt: bool,
    /// Number of pre-forked workers. 1 (the default) serves inline in the
    /// calling thread; 0 means one worker per available processing unit.
    /// Ignored on platforms without the pre-fork model.
    pub workers: usize,
}

impl ServeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds each poll iteration's readiness wait.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run one loop iteration and return instead of serving until shutdown.
    pub fn nonblocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    /// Leave SIGINT/SIGTERM handling to the caller.
    pub fn without_interrupt_handling(mut self) -> Self {
        self.handle_interrupt = false;
        self
    }

    /// Pre-fork `workers` independent event loops. 0 means one per core.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            blocking: true,
            handle_interrupt: true,
            workers: 1,
        }
    }
}
