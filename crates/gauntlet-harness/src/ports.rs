//! Session-scoped ephemeral port allocation.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::Range;
use std::sync::Mutex;

use rand::RngExt as _;

use crate::error::HarnessError;

/// Range the harness draws trial ports from.
pub const PORT_RANGE: Range<u16> = 25000..30000;

/// Random draws attempted before declaring the range exhausted. Large enough
/// that a spurious exhaustion with even one free port left is negligible.
const MAX_DRAWS: usize = 100_000;

/// One side of a trial's UDP conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn loopback(port: u16) -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Issues ports that are unique for the lifetime of the allocator.
///
/// The used set only ever grows: a port burned by a failed trial stays
/// burned, so no two allocations anywhere in the session can collide,
/// including across sequential trials whose sockets linger in TIME_WAIT-like
/// states.
#[derive(Debug, Default)]
pub struct PortAllocator {
    used: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a port in [`PORT_RANGE`] never issued by this allocator.
    pub fn allocate(&self) -> Result<u16, HarnessError> {
        let mut used = self.used.lock().expect("port registry poisoned");
        let mut rng = rand::rng();
        for _ in 0..MAX_DRAWS {
            let port = rng.random_range(PORT_RANGE);
            if used.insert(port) {
                return Ok(port);
            }
        }
        Err(HarnessError::PortsExhausted)
    }

    /// Two distinct ports for a server/client endpoint pair.
    pub fn allocate_pair(&self) -> Result<(u16, u16), HarnessError> {
        Ok((self.allocate()?, self.allocate()?))
    }

    /// Number of ports issued so far in this session.
    pub fn issued(&self) -> usize {
        self.used.lock().expect("port registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_pairwise_distinct() {
        let alloc = PortAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let port = alloc.allocate().expect("allocation");
            assert!(PORT_RANGE.contains(&port));
            assert!(seen.insert(port), "port {port} issued twice");
        }
        assert_eq!(alloc.issued(), 500);
    }

    #[test]
    fn pair_ports_differ() {
        let alloc = PortAllocator::new();
        let (a, b) = alloc.allocate_pair().expect("pair");
        assert_ne!(a, b);
    }

    #[test]
    fn exhaustion_errors_instead_of_spinning() {
        let alloc = PortAllocator::new();
        for _ in 0..PORT_RANGE.len() {
            alloc.allocate().expect("allocation within range capacity");
        }
        assert!(matches!(
            alloc.allocate(),
            Err(HarnessError::PortsExhausted)
        ));
    }

    #[test]
    fn allocation_is_safe_under_concurrency() {
        use std::sync::Arc;

        let alloc = Arc::new(PortAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| alloc.allocate().expect("allocation"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for port in h.join().expect("thread") {
                assert!(all.insert(port), "port {port} issued twice");
            }
        }
        assert_eq!(alloc.issued(), 400);
    }
}
