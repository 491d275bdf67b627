//! Huge OS page reservation.
//!
//! Reserving huge pages is a setup-time operation: the pages are requested
//! from the OS once, wrapped in an [`Arena`], and published so later large
//! allocations can be carved out of them without further system calls.

use std::time::Duration;

use tracing::{info, warn};

use crate::allocator::ArenaAllocator;
use crate::arena::Arena;
use crate::config::{HUGE_OS_PAGE_SIZE, INTERLEAVE_TIMEOUT_SLACK};
use crate::error::ArenaError;
use crate::platform::OsMemory;

/// Share of an interleaved reservation assigned to one NUMA node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeReservation {
    pub node: usize,
    pub pages: usize,
    pub timeout: Duration,
}

/// Split `pages` evenly over `numa_count` nodes.
///
/// Nodes with a lower index receive the remainder first. Each node gets an
/// even share of `timeout` plus [`INTERLEAVE_TIMEOUT_SLACK`]. Nodes that would
/// receive no pages are left out.
pub fn interleave_plan(pages: usize, numa_count: usize, timeout: Duration) -> Vec<NodeReservation> {
    let numa_count = numa_count.max(1);
    let pages_per = pages / numa_count;
    let pages_mod = pages % numa_count;
    let timeout_per = timeout / numa_count as u32 + INTERLEAVE_TIMEOUT_SLACK;

    let mut remaining = pages;
    (0..numa_count)
        .map_while(|node| {
            if remaining == 0 {
                return None;
            }
            let node_pages = pages_per + usize::from(node < pages_mod);
            remaining -= node_pages;
            Some(NodeReservation {
                node,
                pages: node_pages,
                timeout: timeout_per,
            })
        })
        .collect()
}

impl<O: OsMemory> ArenaAllocator<O> {
    /// Reserve `pages` huge OS pages, optionally on one NUMA node, and
    /// publish them as an arena.
    ///
    /// Returns how many pages were actually reserved. Out-of-range nodes are
    /// reduced modulo the node count. If the registry is full the pages stay
    /// reserved but no arena will ever allocate from them.
    pub fn reserve_huge_os_pages_at(
        &self,
        pages: usize,
        numa_node: Option<usize>,
        timeout: Duration,
    ) -> Result<usize, ArenaError> {
        if pages == 0 {
            return Ok(0);
        }
        let numa_node = self.normalize_numa_node(numa_node);

        let region = match self.os().alloc_huge_os_pages(pages, numa_node, timeout) {
            Ok(region) if region.pages_reserved > 0 => region,
            _ => {
                warn!(pages, ?numa_node, "failed to reserve {} GiB huge pages", pages);
                return Err(ArenaError::OutOfMemory);
            }
        };
        info!(
            pages = region.pages_reserved,
            ?numa_node,
            "reserved {} GiB huge pages",
            region.pages_reserved
        );
        debug_assert_eq!(region.size, region.pages_reserved * HUGE_OS_PAGE_SIZE);

        // Huge pages come zeroed from the OS.
        let arena = match unsafe { Arena::new(region.ptr, region.size, numa_node, true, true) } {
            Ok(arena) => arena,
            Err(err) => {
                warn!(%err, "failed to set up huge page arena");
                unsafe { self.os().free_huge_os_pages(region.ptr, region.size) };
                return Err(err);
            }
        };

        if self.registry().publish(Box::new(arena)).is_err() {
            warn!(
                capacity = self.registry().capacity(),
                "arena registry is full; huge pages stay reserved but unused"
            );
        }
        Ok(region.pages_reserved)
    }

    /// Reserve `pages` huge OS pages spread evenly over all NUMA nodes.
    ///
    /// Stops at the first node that fails; arenas already published for
    /// earlier nodes stay in place. Returns the total pages reserved.
    pub fn reserve_huge_os_pages_interleave(
        &self,
        pages: usize,
        timeout: Duration,
    ) -> Result<usize, ArenaError> {
        let plan = interleave_plan(pages, self.os().numa_node_count(), timeout);
        let mut reserved = 0;
        for share in plan {
            reserved += self.reserve_huge_os_pages_at(share.pages, Some(share.node), share.timeout)?;
        }
        Ok(reserved)
    }

    /// Older entry point taking the timeout in seconds.
    ///
    /// Unlike earlier releases, this reports the number of pages actually
    /// reserved rather than echoing the request.
    #[deprecated(note = "use reserve_huge_os_pages_interleave or reserve_huge_os_pages_at")]
    pub fn reserve_huge_os_pages(&self, pages: usize, max_secs: f64) -> Result<usize, ArenaError> {
        warn!("reserve_huge_os_pages is deprecated: use reserve_huge_os_pages_interleave/at instead");
        // Negative and NaN saturate to zero.
        let timeout = Duration::from_millis((max_secs * 1000.0) as u64);
        self.reserve_huge_os_pages_interleave(pages, timeout)
    }

    /// Perform the startup reservation described by the options.
    pub fn reserve_from_options(&self, timeout: Duration) -> Result<usize, ArenaError> {
        let pages = self.options().reserve_huge_os_pages;
        if pages == 0 {
            return Ok(0);
        }
        match self.options().reserve_huge_os_pages_at {
            Some(node) => self.reserve_huge_os_pages_at(pages, Some(node), timeout),
            None => self.reserve_huge_os_pages_interleave(pages, timeout),
        }
    }
}
