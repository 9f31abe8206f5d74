//! Injected observability handle.
//!
//! A `ServerMetrics` is passed to the server at construction (via
//! [`ServerConfig`](crate::ServerConfig)) instead of living in process-global
//! state. The default handle is a fresh set of counters; embedders that want
//! aggregation across servers clone one `Arc` into every config.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for admission, dispatch, and lifecycle events.
///
/// All counters are monotonic except `active`, which is a gauge tracking the
/// number of session channels currently registered with the event loop.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    accepted: AtomicU64,
    active: AtomicU64,
    rejected_global: AtomicU64,
    rejected_per_ip: AtomicU64,
    handler_faults: AtomicU64,
    dispatch_bugs: AtomicU64,
    closed: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connection_opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        // Saturating decrement: close paths are idempotent at the edges.
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub(crate) fn rejected_global(&self) {
        self.rejected_global.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rejected_per_ip(&self) {
        self.rejected_per_ip.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handler_fault(&self) {
        self.handler_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dispatch_bug(&self) {
        self.dispatch_bugs.fetch_add(1, Ordering::Relaxed);
    }

    /// Total connections admitted into the channel registry.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Session channels currently registered.
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Connections rejected by the global capacity check.
    pub fn rejected_global_total(&self) -> u64 {
        self.rejected_global.load(Ordering::Relaxed)
    }

    /// Connections rejected by the per-address capacity check.
    pub fn rejected_per_ip_total(&self) -> u64 {
        self.rejected_per_ip.load(Ordering::Relaxed)
    }

    /// Faults raised by session handlers and contained by the loop.
    pub fn handler_faults_total(&self) -> u64 {
        self.handler_faults.load(Ordering::Relaxed)
    }

    /// Faults in the dispatcher's own bookkeeping (server-level bugs).
    pub fn dispatch_bugs_total(&self) -> u64 {
        self.dispatch_bugs.load(Ordering::Relaxed)
    }

    /// Total connections removed from the channel registry.
    pub fn closed_total(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }
}
