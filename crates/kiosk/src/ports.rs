//! Host port allocation for instances.
//!
//! Every instance owns a pair of host ports: one for the remote-desktop
//! session and one for the console. The allocator hands out the lowest free
//! value in each configured range so allocation order is reproducible, and
//! it never hands out a value that is currently held by another instance.

use std::collections::BTreeSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which of the two ranges ran dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRange {
    Rdp,
    Console,
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortRange::Rdp => write!(f, "rdp"),
            PortRange::Console => write!(f, "console"),
        }
    }
}

/// No free value left in one of the ranges.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{range} port range exhausted")]
pub struct ExhaustedRange {
    pub range: PortRange,
}

/// The (remote-desktop, console) host port pair reserved for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPair {
    pub rdp: u16,
    pub console: u16,
}

struct Pool {
    start: u16,
    end: u16,
    taken: BTreeSet<u16>,
}

impl Pool {
    fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            taken: BTreeSet::new(),
        }
    }

    /// Lowest free port in the range, or None when every value is taken.
    fn allocate(&mut self) -> Option<u16> {
        let port = (self.start..=self.end).find(|p| !self.taken.contains(p))?;
        self.taken.insert(port);
        Some(port)
    }

    /// Releasing a port that is not held is a no-op: cleanup paths may race
    /// with concurrent deletes of the same instance.
    fn release(&mut self, port: u16) {
        self.taken.remove(&port);
    }

    fn free(&self) -> usize {
        (self.end as usize - self.start as usize + 1) - self.taken.len()
    }
}

struct Pools {
    rdp: Pool,
    console: Pool,
}

/// Allocator over the two bounded, inclusive port ranges.
///
/// Allocation and release are linearized by an interior mutex, so two
/// concurrent `allocate_pair` calls can never return overlapping ports and a
/// released pair is visible to the next allocation only once `release_pair`
/// has completed.
pub struct PortAllocator {
    inner: Mutex<Pools>,
}

impl PortAllocator {
    /// Create an allocator over `[rdp_start, rdp_end]` and
    /// `[console_start, console_end]` (inclusive).
    pub fn new(rdp_start: u16, rdp_end: u16, console_start: u16, console_end: u16) -> Self {
        Self {
            inner: Mutex::new(Pools {
                rdp: Pool::new(rdp_start, rdp_end),
                console: Pool::new(console_start, console_end),
            }),
        }
    }

    /// Reserve the lowest free port from each range.
    ///
    /// No partial allocation: when the console range is exhausted the
    /// tentatively chosen rdp port is rolled back before returning.
    pub fn allocate_pair(&self) -> Result<PortPair, ExhaustedRange> {
        let mut pools = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let rdp = pools.rdp.allocate().ok_or(ExhaustedRange {
            range: PortRange::Rdp,
        })?;
        let console = match pools.console.allocate() {
            Some(port) => port,
            None => {
                pools.rdp.release(rdp);
                return Err(ExhaustedRange {
                    range: PortRange::Console,
                });
            }
        };

        Ok(PortPair { rdp, console })
    }

    /// Return both ports of a pair to the free set. Idempotent.
    pub fn release_pair(&self, pair: PortPair) {
        let mut pools = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        pools.rdp.release(pair.rdp);
        pools.console.release(pair.console);
    }

    /// Free slots left in each range, for health/diagnostic output.
    pub fn free_pairs(&self) -> usize {
        let pools = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        pools.rdp.free().min(pools.console.free())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_in_order() {
        let alloc = PortAllocator::new(3390, 3394, 8081, 8085);
        let first = alloc.allocate_pair().unwrap();
        let second = alloc.allocate_pair().unwrap();
        assert_eq!(first, PortPair { rdp: 3390, console: 8081 });
        assert_eq!(second, PortPair { rdp: 3391, console: 8082 });
    }

    #[test]
    fn exhaustion_fails_after_n_pairs() {
        let alloc = PortAllocator::new(3390, 3391, 8081, 8082);
        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(alloc.allocate_pair().unwrap());
        }
        assert_eq!(seen[0].rdp, 3390);
        assert_eq!(seen[1].rdp, 3391);

        let err = alloc.allocate_pair().unwrap_err();
        assert_eq!(err.range, PortRange::Rdp);
    }

    #[test]
    fn console_exhaustion_rolls_back_rdp_choice() {
        // rdp range is larger than the console range, so the console side
        // runs dry first.
        let alloc = PortAllocator::new(3390, 3395, 8081, 8081);
        alloc.allocate_pair().unwrap();

        let err = alloc.allocate_pair().unwrap_err();
        assert_eq!(err.range, PortRange::Console);

        // The rdp port chosen during the failed call must be free again:
        // after releasing the first pair the next allocation starts over at
        // the bottom of both ranges.
        alloc.release_pair(PortPair { rdp: 3390, console: 8081 });
        let pair = alloc.allocate_pair().unwrap();
        assert_eq!(pair, PortPair { rdp: 3390, console: 8081 });
    }

    #[test]
    fn release_makes_pair_reusable() {
        let alloc = PortAllocator::new(3390, 3390, 8081, 8081);
        let pair = alloc.allocate_pair().unwrap();
        alloc.release_pair(pair);
        assert_eq!(alloc.allocate_pair().unwrap(), pair);
    }

    #[test]
    fn release_is_idempotent() {
        let alloc = PortAllocator::new(3390, 3391, 8081, 8082);
        let pair = alloc.allocate_pair().unwrap();
        alloc.release_pair(pair);
        alloc.release_pair(pair);

        // A double release must not make the same value available twice.
        let a = alloc.allocate_pair().unwrap();
        let b = alloc.allocate_pair().unwrap();
        assert_ne!(a.rdp, b.rdp);
        assert_ne!(a.console, b.console);
    }

    #[test]
    fn concurrent_allocations_never_overlap() {
        use std::sync::Arc;

        let alloc = Arc::new(PortAllocator::new(4000, 4063, 9000, 9063));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                let mut pairs = Vec::new();
                for _ in 0..8 {
                    pairs.push(alloc.allocate_pair().unwrap());
                }
                pairs
            }));
        }

        let mut rdp_seen = std::collections::HashSet::new();
        let mut console_seen = std::collections::HashSet::new();
        for handle in handles {
            for pair in handle.join().unwrap() {
                assert!(rdp_seen.insert(pair.rdp), "duplicate rdp port {}", pair.rdp);
                assert!(
                    console_seen.insert(pair.console),
                    "duplicate console port {}",
                    pair.console
                );
            }
        }
        assert_eq!(rdp_seen.len(), 64);
        assert_eq!(alloc.free_pairs(), 0);
    }
}
