//! Interrupt-signal integration for the event loop (Unix only).

use std::io;

use mio::{Interest, Registry, Token};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_mio::v1_0::Signals;

/// Watches SIGINT/SIGTERM through the poll, so an interrupt wakes the loop
/// like any other readiness event.
pub(crate) struct SignalWatcher {
    signals: Signals,
}

impl SignalWatcher {
    pub fn new(registry: &Registry, token: Token) -> io::Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        registry.register(&mut signals, token, Interest::READABLE)?;
        Ok(Self { signals })
    }

    /// Drains pending signals. Returns true if an interrupt was delivered.
    pub fn interrupted(&mut self) -> bool {
        self.signals.pending().next().is_some()
    }
}
