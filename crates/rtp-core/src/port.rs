//! RTP port allocation
//!
//! Each SIP identity running in the process gets its own slice of the
//! UDP port space, but leases are tracked in one shared registry so two
//! identities can never hand the same port to concurrent sessions. The
//! allocator is injected into every backend at construction rather than
//! living in a process global.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

/// First port of instance 0's range
const RANGE_BASE: u16 = 10000;

/// Ports per instance range
const RANGE_SPAN: u16 = 1998;

/// Base of the deterministic overflow region used when a range is
/// exhausted even after reclamation
const OVERFLOW_BASE: u16 = 20000;

/// Even ports per instance in the overflow region
const OVERFLOW_SLOTS: u16 = 50;

/// The port slice assigned to one backend instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    index: u16,
    base: u16,
}

impl PortRange {
    /// Range for the instance with the given index
    pub fn for_instance(index: u16) -> Self {
        Self {
            index,
            base: RANGE_BASE + index * 2000,
        }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn last(&self) -> u16 {
        self.base + RANGE_SPAN
    }

    /// First port of the fallback band used when the whole range is
    /// leased
    fn overflow_base(&self) -> u16 {
        OVERFLOW_BASE + self.index * 100
    }

    fn contains(&self, port: u16) -> bool {
        port >= self.base && port <= self.last()
    }
}

#[derive(Debug)]
struct AllocatorState {
    /// Leased port -> owning call id
    leased: HashMap<u16, String>,
    /// Next scan offset per range base, so successive calls spread
    /// across the range instead of reusing the lowest port
    cursors: HashMap<u16, u16>,
}

/// Process-wide RTP port pool.
///
/// Shared by every backend instance in the process. `allocate` and
/// `release` take the registry lock for their whole check-then-set, so
/// there is no window where two sessions can be handed the same port.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    state: Arc<Mutex<AllocatorState>>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AllocatorState {
                leased: HashMap::new(),
                cursors: HashMap::new(),
            })),
        }
    }

    /// Lease the next free even port in `range` for the call `owner`.
    ///
    /// On exhaustion, leases whose owner `is_live` rejects are swept and
    /// the scan retried; if the range is still full, a deterministic
    /// overflow port is returned with a warning. Never fails.
    pub fn allocate<F>(&self, range: PortRange, owner: &str, is_live: F) -> u16
    where
        F: Fn(&str) -> bool,
    {
        let mut state = self.state.lock();

        if let Some(port) = Self::scan(&mut state, range, owner) {
            return port;
        }

        // Range exhausted: drop leases whose call has already ended
        let stale: Vec<u16> = state
            .leased
            .iter()
            .filter(|(port, call)| range.contains(**port) && !is_live(call))
            .map(|(port, _)| *port)
            .collect();
        if !stale.is_empty() {
            warn!(
                "RTP range {}-{} exhausted, reclaimed {} stale lease(s)",
                range.base(),
                range.last(),
                stale.len()
            );
            for port in &stale {
                state.leased.remove(port);
            }
            if let Some(port) = Self::scan(&mut state, range, owner) {
                return port;
            }
        }

        // The overflow band is scanned too, so concurrent overflow
        // leases get distinct ports and no existing lease is clobbered
        let base = range.overflow_base();
        for slot in 0..OVERFLOW_SLOTS {
            let port = base + slot * 2;
            if !state.leased.contains_key(&port) {
                warn!(
                    "RTP range {}-{} still exhausted after reclamation, using overflow port {}",
                    range.base(),
                    range.last(),
                    port
                );
                state.leased.insert(port, owner.to_string());
                return port;
            }
        }
        // Fully saturated overflow band; the bind on this port will fail
        // and surface the exhaustion to the caller
        warn!(
            "overflow band {}-{} fully leased, reusing {}",
            base,
            base + (OVERFLOW_SLOTS - 1) * 2,
            base
        );
        base
    }

    fn scan(state: &mut AllocatorState, range: PortRange, owner: &str) -> Option<u16> {
        let slots = (RANGE_SPAN / 2) + 1;
        let start = *state.cursors.get(&range.base()).unwrap_or(&0);

        for i in 0..slots {
            let slot = (start + i) % slots;
            let port = range.base() + slot * 2;
            if !state.leased.contains_key(&port) {
                state.leased.insert(port, owner.to_string());
                state.cursors.insert(range.base(), (slot + 1) % slots);
                debug!("leased RTP port {} to {}", port, owner);
                return Some(port);
            }
        }
        None
    }

    /// Return a port to the pool. Releasing an unleased port is a no-op.
    pub fn release(&self, port: u16) {
        let mut state = self.state.lock();
        if state.leased.remove(&port).is_some() {
            debug!("released RTP port {}", port);
        }
    }

    /// Number of currently leased ports, across all ranges
    pub fn leased_count(&self) -> usize {
        self.state.lock().leased.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_even_ports_in_range() {
        let pool = PortAllocator::new();
        let range = PortRange::for_instance(0);
        for _ in 0..50 {
            let port = pool.allocate(range, "call-1", |_| true);
            assert!(port >= 10000 && port <= 11998);
            assert_eq!(port % 2, 0);
        }
        assert_eq!(pool.leased_count(), 50);
    }

    #[test]
    fn test_no_duplicate_leases() {
        let pool = PortAllocator::new();
        let range = PortRange::for_instance(0);
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000 {
            let port = pool.allocate(range, &format!("call-{}", i), |_| true);
            assert!(seen.insert(port), "port {} leased twice", port);
        }
    }

    #[test]
    fn test_instances_partition_the_port_space() {
        let pool = PortAllocator::new();
        let a = pool.allocate(PortRange::for_instance(0), "a", |_| true);
        let b = pool.allocate(PortRange::for_instance(1), "b", |_| true);
        assert!(a < 12000);
        assert!(b >= 12000 && b <= 13998);
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = PortAllocator::new();
        let range = PortRange::for_instance(0);
        let port = pool.allocate(range, "call-1", |_| true);
        pool.release(port);
        pool.release(port);
        assert_eq!(pool.leased_count(), 0);
    }

    #[test]
    fn test_exhaustion_reclaims_dead_owners() {
        let pool = PortAllocator::new();
        let range = PortRange::for_instance(0);
        // 1000 even ports in the range
        for i in 0..1000 {
            pool.allocate(range, &format!("dead-{}", i), |_| true);
        }
        // Everything is leased, but every owner is gone
        let port = pool.allocate(range, "live-1", |call| call == "live-1");
        assert!(range.contains(port));
        assert_eq!(pool.leased_count(), 1);
    }

    #[test]
    fn test_exhaustion_with_live_owners_overflows() {
        let pool = PortAllocator::new();
        let range = PortRange::for_instance(2);
        for i in 0..1000 {
            pool.allocate(range, &format!("live-{}", i), |_| true);
        }
        let port = pool.allocate(range, "one-more", |_| true);
        assert_eq!(port, 20200);
    }

    #[test]
    fn test_concurrent_overflow_leases_are_distinct() {
        let pool = PortAllocator::new();
        let range = PortRange::for_instance(2);
        for i in 0..1000 {
            pool.allocate(range, &format!("live-{}", i), |_| true);
        }
        let first = pool.allocate(range, "over-1", |_| true);
        let second = pool.allocate(range, "over-2", |_| true);
        assert_eq!(first, 20200);
        assert_eq!(second, 20202);

        // Releasing one overflow lease leaves the other intact
        pool.release(second);
        assert_eq!(pool.leased_count(), 1001);
        assert_eq!(pool.allocate(range, "over-3", |_| true), 20202);
    }
}
