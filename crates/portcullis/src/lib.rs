//! Portcullis: a connection-accepting server front end.
//!
//! Portcullis owns everything between "a TCP listener exists" and "a
//! protocol handler is serving this client": binding and listening,
//! accepting, admission control (global and per-address connection caps),
//! and dispatching each admitted connection to a [`Session`] built by a
//! [`SessionFactory`]. Protocol logic lives entirely behind the [`Session`]
//! trait; a fault in one session is contained and never disturbs its
//! neighbours.
//!
//! ```text
//!                    +-----------------------------+
//!   TCP SYN -------->| listener (mio readiness)    |
//!                    +--------------+--------------+
//!                                   | accept
//!                    +--------------v--------------+
//!                    | admission control           |
//!                    |  max_cons / max_cons_per_ip |
//!                    +--------------+--------------+
//!                                   | dispatch
//!                    +--------------v--------------+
//!                    | Session (via SessionFactory)|
//!                    +-----------------------------+
//! ```
//!
//! Two concurrency models are available from the same [`Server`]: the
//! default inline event loop, and on Unix a pre-fork pool of share-nothing
//! worker loops selected with [`ServeOptions::with_workers`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use portcullis::{ServeOptions, Server, ServerConfig};
//! # use std::{io, net::SocketAddr};
//! # use portcullis::{Session, SessionFactory, Transport};
//! # struct F;
//! # struct S(Transport);
//! # impl Session for S {
//! #     fn handle(&mut self) -> io::Result<()> { Ok(()) }
//! #     fn handle_error(&mut self, _: &io::Error) {}
//! #     fn handle_max_cons(&mut self) {}
//! #     fn handle_max_cons_per_ip(&mut self) {}
//! #     fn on_readable(&mut self) -> io::Result<()> { Ok(()) }
//! #     fn closing(&self) -> bool { true }
//! #     fn close(&mut self) {}
//! #     fn transport_mut(&mut self) -> &mut Transport { &mut self.0 }
//! # }
//! # impl SessionFactory for F {
//! #     fn open(&self, t: Transport, _: SocketAddr) -> io::Result<Box<dyn Session>> {
//! #         Ok(Box::new(S(t)))
//! #     }
//! # }
//!
//! # fn main() -> portcullis::ServerResult<()> {
//! let config = ServerConfig::new("127.0.0.1:2121".parse::<std::net::SocketAddr>().unwrap())
//!     .with_max_cons(512)
//!     .with_max_cons_per_ip(8);
//! let mut server = Server::bind(config, Arc::new(F))?;
//! server.serve(&ServeOptions::new())?;
//! # Ok(())
//! # }
//! ```

mod admission;
mod config;
mod error;
mod metrics;
mod reactor;
mod session;
#[cfg(unix)]
mod signals;
mod tls;
mod transport;

mod server;
#[cfg(unix)]
mod workers;

pub use admission::Admission;
pub use config::{ServeOptions, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use metrics::ServerMetrics;
pub use server::{Server, ShutdownHandle};
pub use session::{Session, SessionFactory};
pub use tls::{TlsConfig, TlsStream};
pub use transport::Transport;

// Sessions express their readiness interest in mio's terms.
pub use mio::Interest;
