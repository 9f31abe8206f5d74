//! The protocol-handler collaborator contract.
//!
//! The server core never parses protocol bytes. Each accepted connection is
//! handed to a [`Session`] built by the embedder's [`SessionFactory`]; the
//! session owns all I/O and state for that connection from then on, while the
//! event loop drives its readiness callbacks.

use std::io;
use std::net::SocketAddr;

use mio::Interest;

use crate::transport::Transport;

/// One protocol session bound to an accepted connection.
///
/// Lifecycle, as driven by the event loop:
///
/// 1. The factory constructs the session. If [`connected`](Session::connected)
///    then returns false, the connection is abandoned silently — this is the
///    constructor's way of rejecting a connection without it counting as a
///    fault.
/// 2. If admission fails, exactly one of the two capacity callbacks runs and
///    [`handle`](Session::handle) is never called. The callback decides what
///    the client sees (typically a rejection reply) and marks the session
///    closing.
/// 3. Otherwise [`handle`](Session::handle) runs once. An `Err` from it, or
///    from a later readiness callback, is contained by the loop and routed to
///    [`handle_error`](Session::handle_error); it never escapes to other
///    connections.
/// 4. When [`closing`](Session::closing) reports true, the loop deregisters
///    the channel, invokes [`close`](Session::close) exactly once, and
///    releases the connection's admission slot.
///
/// All callbacks run on the event-loop thread that owns the session. They
/// must not block: a blocking session stalls every connection sharing the
/// loop. Use the pre-fork model for workloads that cannot avoid blocking.
pub trait Session: Send {
    /// True once construction left the session in a usable state.
    fn connected(&self) -> bool {
        true
    }

    /// Protocol entry point, invoked once after admission passes.
    fn handle(&mut self) -> io::Result<()>;

    /// Fault callback. The loop has already logged and counted the fault;
    /// implementations typically reply with an error and mark closing.
    fn handle_error(&mut self, err: &io::Error);

    /// The server hit its global connection cap.
    fn handle_max_cons(&mut self);

    /// This connection's address hit its per-address cap.
    fn handle_max_cons_per_ip(&mut self);

    /// The socket has data (or EOF) pending.
    fn on_readable(&mut self) -> io::Result<()>;

    /// The socket can accept writes again.
    fn on_writable(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Readiness interest the loop should keep registered for this channel.
    fn interest(&self) -> Interest {
        Interest::READABLE
    }

    /// True once the session wants to be torn down. The loop observes this
    /// after every callback.
    fn closing(&self) -> bool;

    /// Releases the connection. Called exactly once, by the loop, when the
    /// channel is removed from the registry.
    fn close(&mut self);

    /// Access to the transport, for poll registration.
    fn transport_mut(&mut self) -> &mut Transport;
}

/// Builds one [`Session`] per accepted connection.
///
/// Shared across worker event loops under the pre-fork model, so factories
/// must be `Send + Sync`. Returning `Err` is treated as a server-level
/// dispatch bug: logged with context, the connection dropped, the server
/// kept running.
pub trait SessionFactory: Send + Sync {
    fn open(&self, transport: Transport, peer: SocketAddr) -> io::Result<Box<dyn Session>>;
}
