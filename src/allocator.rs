//! Arena allocation policy and the free path.
//!
//! [`ArenaAllocator`] is the service the segment layer talks to. It owns the
//! arena registry, the OS layer and the options, and decides for each large
//! request whether an arena can serve it:
//!
//! 1. Requests that are too small, too large or too strictly aligned skip
//!    arenas entirely.
//! 2. Arenas local to the caller's NUMA node (or unpinned) are tried first.
//! 3. Arenas pinned to other nodes are tried next.
//! 4. Anything left goes straight to the OS.

use std::ptr::NonNull;

use tracing::error;

use crate::arena::{Arena, ArenaStats};
use crate::config::{
    block_count_of_size, Options, ARENA_MAX_OBJ_SIZE, ARENA_MIN_OBJ_SIZE, SEGMENT_ALIGN,
};
use crate::error::ArenaError;
use crate::logging::{log_arena_alloc, log_arena_free};
use crate::memid::MemoryId;
use crate::platform::{OsMemory, SystemOs};
use crate::registry::ArenaRegistry;

/// Result of a successful allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub ptr: NonNull<u8>,
    /// Whether the memory is committed.
    pub commit: bool,
    /// Whether the memory is backed by large OS pages.
    pub large: bool,
    /// Whether the memory is known to read as zero.
    pub is_zero: bool,
    /// Token to pass back to [`ArenaAllocator::free`].
    pub memid: MemoryId,
}

pub struct ArenaAllocator<O: OsMemory = SystemOs> {
    registry: ArenaRegistry,
    os: O,
    options: Options,
}

impl ArenaAllocator<SystemOs> {
    /// Allocator on the real OS, configured from the environment.
    pub fn new() -> Self {
        Self::with_os(SystemOs::new(), Options::from_env())
    }
}

impl Default for ArenaAllocator<SystemOs> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: OsMemory> ArenaAllocator<O> {
    pub fn with_os(os: O, options: Options) -> Self {
        Self {
            registry: ArenaRegistry::new(),
            os,
            options,
        }
    }

    #[inline]
    pub fn os(&self) -> &O {
        &self.os
    }

    #[inline]
    pub fn options(&self) -> &Options {
        &self.options
    }

    #[inline]
    pub fn registry(&self) -> &ArenaRegistry {
        &self.registry
    }

    /// Usage snapshot across all registered arenas.
    pub fn stats(&self) -> ArenaStats {
        self.registry.stats()
    }

    /// Whether a request of this shape may be served from an arena.
    #[inline]
    pub fn is_arena_eligible(size: usize, alignment: usize) -> bool {
        alignment <= SEGMENT_ALIGN && (ARENA_MIN_OBJ_SIZE..=ARENA_MAX_OBJ_SIZE).contains(&size)
    }

    /// Allocate `size` bytes aligned to `alignment`.
    ///
    /// `allow_large` permits memory backed by large OS pages. Only OS
    /// exhaustion is reported as an error; arena misses fall through to the OS.
    pub fn alloc_aligned(
        &self,
        size: usize,
        alignment: usize,
        commit: bool,
        allow_large: bool,
    ) -> Result<Allocation, ArenaError> {
        debug_assert!(size > 0);
        debug_assert!(alignment.is_power_of_two());

        if Self::is_arena_eligible(size, alignment) {
            let blocks = block_count_of_size(size);
            let numa_node = self.os.current_numa_node();

            let found = self
                .alloc_pass(blocks, allow_large, |arena| arena.is_local_to(numa_node))
                .or_else(|| self.alloc_pass(blocks, allow_large, |arena| !arena.is_local_to(numa_node)));

            if let Some(allocation) = found {
                debug_assert_eq!(allocation.ptr.as_ptr() as usize % alignment, 0);
                log_arena_alloc(size, allocation.ptr, allocation.memid);
                return Ok(allocation);
            }
        }

        // Fall back to the OS; large pages only if the process allows them.
        let large = allow_large && self.options.large_os_pages;
        let region = self.os.alloc_aligned(size, alignment, commit, large)?;
        Ok(Allocation {
            ptr: region.ptr,
            commit,
            large: region.large,
            is_zero: true,
            memid: MemoryId::Os,
        })
    }

    /// Allocate `size` bytes aligned to the segment alignment, which every
    /// arena block satisfies.
    #[inline]
    pub fn alloc(&self, size: usize, commit: bool, allow_large: bool) -> Result<Allocation, ArenaError> {
        self.alloc_aligned(size, SEGMENT_ALIGN, commit, allow_large)
    }

    fn alloc_pass<F>(&self, blocks: usize, allow_large: bool, select: F) -> Option<Allocation>
    where
        F: Fn(&Arena) -> bool,
    {
        self.registry
            .iter()
            .filter(|(_, arena)| select(*arena) && arena.accepts(allow_large))
            .find_map(|(slot, arena)| {
                arena.alloc_blocks(blocks).map(|claim| Allocation {
                    ptr: claim.ptr,
                    commit: true,
                    large: arena.is_large(),
                    is_zero: claim.is_zero,
                    memid: MemoryId::arena(slot, claim.index),
                })
            })
    }

    /// Release memory obtained from [`ArenaAllocator::alloc_aligned`].
    ///
    /// A null pointer or zero size is a no-op. Fatal errors mean the memid or
    /// size does not match any live allocation; nothing is released in that
    /// case, and the caller must not keep going as if the free succeeded.
    ///
    /// # Safety
    /// `ptr`, `size` and `memid` must come from one allocation made by this
    /// allocator, and the memory must not be used afterwards.
    pub unsafe fn free(&self, ptr: *mut u8, size: usize, memid: MemoryId) -> Result<(), ArenaError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };
        if size == 0 {
            return Ok(());
        }

        match memid {
            MemoryId::Os => {
                self.os.free(ptr, size);
                Ok(())
            }
            MemoryId::Arena { slot, index } => {
                let addr = ptr.as_ptr() as usize;
                let Some(arena) = self.registry.get(slot) else {
                    return Err(fatal(ArenaError::UnknownArena { ptr: addr, size, memid }));
                };
                let blocks = block_count_of_size(size);
                if !arena.contains_run(index, blocks) {
                    return Err(fatal(ArenaError::BlockOutOfRange { ptr: addr, size, memid }));
                }
                if !arena.free_blocks(index, blocks) {
                    return Err(fatal(ArenaError::DoubleFree { ptr: addr, size }));
                }
                log_arena_free(size, ptr, memid);
                Ok(())
            }
        }
    }

    /// [`ArenaAllocator::free`] taking the memid in its packed form.
    ///
    /// # Safety
    /// Same as [`ArenaAllocator::free`].
    pub unsafe fn free_raw(&self, ptr: *mut u8, size: usize, raw_memid: usize) -> Result<(), ArenaError> {
        let memid = MemoryId::from_raw(raw_memid).map_err(fatal)?;
        self.free(ptr, size, memid)
    }

    /// Turn an existing region into an arena and publish it.
    ///
    /// Returns the registry slot. If the registry is full the region is left
    /// untouched and stays owned by the caller.
    ///
    /// # Safety
    /// `[start, start + size)` must be valid, writable memory that outlives
    /// this allocator and is not used for anything else. If `is_zero` is set
    /// it must read as zero.
    pub unsafe fn manage_os_memory(
        &self,
        start: NonNull<u8>,
        size: usize,
        is_large: bool,
        is_zero: bool,
        numa_node: Option<usize>,
    ) -> Result<usize, ArenaError> {
        let numa_node = self.normalize_numa_node(numa_node);
        let arena = Arena::new(start, size, numa_node, is_large, is_zero)?;
        self.registry.publish(Box::new(arena)).map_err(|_| {
            tracing::warn!(capacity = self.registry.capacity(), "arena registry is full");
            ArenaError::RegistryFull {
                capacity: self.registry.capacity(),
            }
        })
    }

    /// Reduce a node index modulo the detected node count.
    #[inline]
    pub(crate) fn normalize_numa_node(&self, numa_node: Option<usize>) -> Option<usize> {
        numa_node.map(|node| node % self.os.numa_node_count().max(1))
    }
}

impl<O: OsMemory> std::fmt::Debug for ArenaAllocator<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaAllocator")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish()
    }
}

#[cold]
fn fatal(err: ArenaError) -> ArenaError {
    error!(%err, "fatal arena error");
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ARENA_BLOCK_SIZE, BITMAP_FIELD_BITS};
    use crate::testing::FakeOs;

    fn allocator_with(nodes: usize, current: usize) -> ArenaAllocator<FakeOs> {
        ArenaAllocator::with_os(FakeOs::new(nodes, current), Options::default())
    }

    fn add_arena(alloc: &ArenaAllocator<FakeOs>, blocks: usize, node: Option<usize>, large: bool) -> usize {
        let start = alloc.os().reserve_fake(blocks * ARENA_BLOCK_SIZE);
        unsafe {
            alloc
                .manage_os_memory(start, blocks * ARENA_BLOCK_SIZE, large, true, node)
                .unwrap()
        }
    }

    #[test]
    fn test_eligibility_bounds() {
        type A = ArenaAllocator<FakeOs>;
        assert!(!A::is_arena_eligible(ARENA_MIN_OBJ_SIZE - 1, SEGMENT_ALIGN));
        assert!(A::is_arena_eligible(ARENA_MIN_OBJ_SIZE, SEGMENT_ALIGN));
        assert!(A::is_arena_eligible(ARENA_MAX_OBJ_SIZE, 4096));
        assert!(!A::is_arena_eligible(ARENA_MAX_OBJ_SIZE + 1, 4096));
        assert!(!A::is_arena_eligible(ARENA_BLOCK_SIZE, SEGMENT_ALIGN * 2));
    }

    #[test]
    fn test_no_arenas_falls_back_to_os() {
        let alloc = allocator_with(1, 0);
        let a = alloc.alloc(ARENA_BLOCK_SIZE, true, true).unwrap();
        assert_eq!(a.memid, MemoryId::Os);
        assert!(a.is_zero);
        // Large pages are downgraded unless the option allows them.
        assert!(!a.large);
        assert_eq!(alloc.os().os_allocs(), 1);
    }

    #[test]
    fn test_large_os_pages_option() {
        let options = Options {
            large_os_pages: true,
            ..Options::default()
        };
        let alloc = ArenaAllocator::with_os(FakeOs::new(1, 0), options);
        assert!(alloc.alloc(ARENA_BLOCK_SIZE, true, true).unwrap().large);
        assert!(!alloc.alloc(ARENA_BLOCK_SIZE, true, false).unwrap().large);
    }

    #[test]
    fn test_arena_allocation_and_free() {
        let alloc = allocator_with(1, 0);
        let slot = add_arena(&alloc, BITMAP_FIELD_BITS, None, false);
        let arena_start = alloc.registry().get(slot).unwrap().start();

        let a = alloc.alloc(3 * ARENA_BLOCK_SIZE, false, false).unwrap();
        assert_eq!(a.ptr, arena_start);
        assert!(a.commit);
        assert!(a.is_zero);
        assert!(matches!(a.memid, MemoryId::Arena { slot: 0, .. }));
        assert_eq!(alloc.stats().blocks_in_use, 3);

        unsafe { alloc.free(a.ptr.as_ptr(), 3 * ARENA_BLOCK_SIZE, a.memid).unwrap() };
        assert_eq!(alloc.stats().blocks_in_use, 0);
        assert_eq!(alloc.os().os_allocs(), 0);
    }

    #[test]
    fn test_local_arena_preferred() {
        let alloc = allocator_with(2, 1);
        let remote = add_arena(&alloc, 8, Some(0), false);
        let local = add_arena(&alloc, 8, Some(1), false);

        let a = alloc.alloc(ARENA_BLOCK_SIZE, true, false).unwrap();
        assert!(matches!(a.memid, MemoryId::Arena { slot, .. } if slot == local));

        // Exhaust the local arena; the next request crosses nodes.
        let _rest = alloc.alloc(7 * ARENA_BLOCK_SIZE, true, false).unwrap();
        let b = alloc.alloc(ARENA_BLOCK_SIZE, true, false).unwrap();
        assert!(matches!(b.memid, MemoryId::Arena { slot, .. } if slot == remote));
    }

    #[test]
    fn test_large_arena_requires_permission() {
        let alloc = allocator_with(1, 0);
        add_arena(&alloc, 8, None, true);

        let denied = alloc.alloc(ARENA_BLOCK_SIZE, true, false).unwrap();
        assert_eq!(denied.memid, MemoryId::Os);

        let granted = alloc.alloc(ARENA_BLOCK_SIZE, true, true).unwrap();
        assert!(!granted.memid.is_os());
        assert!(granted.large);
    }

    #[test]
    fn test_free_null_or_empty_is_noop() {
        let alloc = allocator_with(1, 0);
        let memid = MemoryId::arena(5, crate::bitmap::BitmapIndex::new(0, 0));
        unsafe {
            assert!(alloc.free(std::ptr::null_mut(), ARENA_BLOCK_SIZE, memid).is_ok());
            assert!(alloc.free(NonNull::<u8>::dangling().as_ptr(), 0, memid).is_ok());
        }
    }

    #[test]
    fn test_os_free_bypasses_registry() {
        let alloc = allocator_with(1, 0);
        let a = alloc.alloc(ARENA_BLOCK_SIZE / 4, true, false).unwrap();
        assert!(a.memid.is_os());
        unsafe { alloc.free(a.ptr.as_ptr(), ARENA_BLOCK_SIZE / 4, a.memid).unwrap() };
        assert_eq!(alloc.os().os_frees(), 1);
        assert!(alloc.registry().is_empty());
    }

    #[test]
    fn test_free_unknown_arena_is_fatal() {
        let alloc = allocator_with(1, 0);
        let memid = MemoryId::arena(3, crate::bitmap::BitmapIndex::new(0, 0));
        let err = unsafe { alloc.free(0x1000 as *mut u8, ARENA_BLOCK_SIZE, memid) }.unwrap_err();
        assert!(matches!(err, ArenaError::UnknownArena { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_free_out_of_range_is_fatal() {
        let alloc = allocator_with(1, 0);
        add_arena(&alloc, 4, None, false);
        let memid = MemoryId::arena(0, crate::bitmap::BitmapIndex::new(0, 2));
        let err = unsafe { alloc.free(0x1000 as *mut u8, 4 * ARENA_BLOCK_SIZE, memid) }.unwrap_err();
        assert!(matches!(err, ArenaError::BlockOutOfRange { .. }));
    }

    #[test]
    fn test_free_raw_rejects_garbage() {
        let alloc = allocator_with(1, 0);
        let err = unsafe { alloc.free_raw(0x1000 as *mut u8, ARENA_BLOCK_SIZE, 0x4200) }.unwrap_err();
        assert_eq!(err, ArenaError::InvalidMemoryId { raw: 0x4200 });
    }

    #[test]
    fn test_manage_rejects_when_full() {
        let alloc = allocator_with(1, 0);
        for _ in 0..alloc.registry().capacity() {
            add_arena(&alloc, 1, None, false);
        }
        let start = alloc.os().reserve_fake(ARENA_BLOCK_SIZE);
        let err = unsafe { alloc.manage_os_memory(start, ARENA_BLOCK_SIZE, false, true, None) }.unwrap_err();
        assert_eq!(err, ArenaError::RegistryFull { capacity: 64 });
    }
}
