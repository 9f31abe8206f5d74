//! Admission control: pure decision logic for newly accepted connections.
//!
//! Two caps apply, in order. The global cap protects the scarce resource
//! (file descriptors) from any client; the per-address cap is the secondary
//! fairness constraint between clients.
//!
//! The boundary conditions are asymmetric on purpose and must stay that way:
//! the global check admits the connection that brings the registry exactly to
//! the cap (`<=`), while the per-address check rejects only when the count
//! strictly exceeds the cap (`>`), so the Nth connection from one address is
//! allowed under a cap of N. Changing either comparison shifts observable
//! capacity at the boundary by one connection.

use std::collections::HashMap;
use std::net::IpAddr;

/// Decides whether accepted connections may proceed to protocol handling.
///
/// Counters are process-local: under the pre-fork model every worker runs its
/// own `Admission`, so the caps apply per worker rather than fleet-wide.
#[derive(Debug)]
pub struct Admission {
    /// Global connection cap. 0 means unlimited.
    max_cons: usize,
    /// Per-address connection cap. 0 means unlimited.
    max_cons_per_ip: usize,
    /// Counting multiset of currently-connected remote addresses.
    ip_map: HashMap<IpAddr, u32>,
}

impl Admission {
    pub fn new(max_cons: usize, max_cons_per_ip: usize) -> Self {
        Self {
            max_cons,
            max_cons_per_ip,
            ip_map: HashMap::new(),
        }
    }

    /// Returns true if the server is willing to keep the connection that
    /// brought the channel registry to `registered` entries.
    ///
    /// The check runs after accept, so `registered` already includes the
    /// connection being decided.
    pub fn accepts_more(&self, registered: usize) -> bool {
        self.max_cons == 0 || registered <= self.max_cons
    }

    /// Returns true if `ip` holds strictly more connections than the
    /// per-address cap allows.
    pub fn per_ip_exceeded(&self, ip: IpAddr) -> bool {
        self.max_cons_per_ip > 0 && self.count(ip) as usize > self.max_cons_per_ip
    }

    /// Records one connection from `ip`. Called on accept, before the
    /// admission checks, so the decision sees the post-accept count.
    pub fn record(&mut self, ip: IpAddr) {
        *self.ip_map.entry(ip).or_insert(0) += 1;
    }

    /// Releases one connection slot for `ip`. Every recorded address is
    /// released exactly once, by the channel removal path.
    pub fn release(&mut self, ip: IpAddr) {
        if let Some(count) = self.ip_map.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                self.ip_map.remove(&ip);
            }
        }
    }

    /// Current number of recorded connections from `ip`.
    pub fn count(&self, ip: IpAddr) -> u32 {
        self.ip_map.get(&ip).copied().unwrap_or(0)
    }

    /// Number of distinct addresses currently recorded.
    pub fn distinct_addresses(&self) -> usize {
        self.ip_map.len()
    }
}
