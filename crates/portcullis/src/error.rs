//! Server error types.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur during server operations.
///
/// Capacity rejections and per-connection handler faults are deliberately
/// absent: they are policy outcomes routed to the session's own callbacks
/// and never surface through this enum.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Bind failed. Raised at construction, before any serving begins.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Invalid combination of serve options.
    #[error("invalid serve configuration: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The server has already been closed and cannot serve again.
    #[error("server already closed")]
    Closed,
}

impl ServerError {
    /// Returns true if this error is fatal before serving starts.
    pub fn is_startup_error(&self) -> bool {
        matches!(self, Self::Bind { .. } | Self::Config(_) | Self::Tls(_))
    }
}
