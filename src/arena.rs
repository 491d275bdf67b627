//! Arena descriptors.
//!
//! An [`Arena`] is one contiguous OS region cut into [`ARENA_BLOCK_SIZE`]
//! blocks. Two bitmaps of identical shape track it: `blocks_map` marks
//! blocks in use, `blocks_dirty` marks blocks that were ever handed out (and
//! so may hold non-zero bytes). Once built, the descriptor only changes
//! through atomic bitmap operations and the search hint, so it can be shared
//! freely between threads.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::bitmap::{Bitmap, BitmapIndex};
use crate::config::{ARENA_BLOCK_SIZE, BITMAP_FIELD_BITS, SEGMENT_ALIGN};
use crate::error::ArenaError;

/// Blocks claimed from an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaClaim {
    pub ptr: NonNull<u8>,
    pub index: BitmapIndex,
    /// Whether the claimed blocks are guaranteed to read as zero.
    pub is_zero: bool,
}

pub struct Arena {
    /// Start of the memory area (never changes after init).
    start: NonNull<u8>,
    /// Size of the area in arena blocks.
    block_count: usize,
    /// Preferred NUMA node; `None` lets any node allocate here.
    numa_node: Option<usize>,
    is_large: bool,
    is_zero_init: bool,
    /// Field to start the next search from. Only a hint.
    search_idx: AtomicUsize,
    blocks_map: Bitmap,
    blocks_dirty: Bitmap,
}

impl Arena {
    /// Describe `size` bytes at `start` as an arena.
    ///
    /// Trailing bitmap bits past the last real block are claimed up front so
    /// they are never handed out.
    ///
    /// # Safety
    /// `[start, start + size)` must stay valid for as long as the arena is
    /// used to allocate. The arena itself never reads or writes the region.
    pub unsafe fn new(
        start: NonNull<u8>,
        size: usize,
        numa_node: Option<usize>,
        is_large: bool,
        is_zero_init: bool,
    ) -> Result<Self, ArenaError> {
        let addr = start.as_ptr() as usize;
        if addr % SEGMENT_ALIGN != 0 {
            return Err(ArenaError::MisalignedRegion {
                start: addr,
                align: SEGMENT_ALIGN,
            });
        }
        // Partial trailing blocks are not usable.
        let block_count = size / ARENA_BLOCK_SIZE;
        if block_count == 0 {
            return Err(ArenaError::EmptyRegion { size });
        }

        let fields = block_count.div_ceil(BITMAP_FIELD_BITS);
        let blocks_map = Bitmap::try_new(fields).map_err(|_| ArenaError::OutOfMemory)?;
        let blocks_dirty = Bitmap::try_new(fields).map_err(|_| ArenaError::OutOfMemory)?;

        let post = fields * BITMAP_FIELD_BITS - block_count;
        if post > 0 {
            let idx = BitmapIndex::new(fields - 1, BITMAP_FIELD_BITS - post);
            blocks_map.claim(post, idx);
        }

        Ok(Self {
            start,
            block_count,
            numa_node,
            is_large,
            is_zero_init,
            search_idx: AtomicUsize::new(0),
            blocks_map,
            blocks_dirty,
        })
    }

    #[inline]
    pub fn start(&self) -> NonNull<u8> {
        self.start
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    #[inline]
    pub fn field_count(&self) -> usize {
        self.blocks_map.field_count()
    }

    #[inline]
    pub fn numa_node(&self) -> Option<usize> {
        self.numa_node
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        self.is_large
    }

    #[inline]
    pub fn is_zero_init(&self) -> bool {
        self.is_zero_init
    }

    /// Blocks currently in use, excluding padding bits.
    pub fn blocks_in_use(&self) -> usize {
        let padding = self.field_count() * BITMAP_FIELD_BITS - self.block_count;
        self.blocks_map.count_ones() - padding
    }

    /// Whether `numa_node` counts as local to this arena.
    #[inline]
    pub fn is_local_to(&self, numa_node: usize) -> bool {
        self.numa_node.map_or(true, |n| n == numa_node)
    }

    /// Whether a caller with the given large-page permission may use this arena.
    #[inline]
    pub fn accepts(&self, allow_large: bool) -> bool {
        allow_large || !self.is_large
    }

    /// Claim `blocks` consecutive blocks inside one bitmap field.
    ///
    /// The search starts at the hinted field and wraps around once.
    pub fn try_claim(&self, blocks: usize) -> Option<BitmapIndex> {
        if blocks == 0 || blocks > BITMAP_FIELD_BITS {
            return None;
        }
        let fcount = self.field_count();
        let mut idx = self.search_idx.load(Ordering::Relaxed);
        for _ in 0..fcount {
            if idx >= fcount {
                idx = 0;
            }
            if let Some(bitmap_idx) = self.blocks_map.try_claim_field(idx, blocks) {
                self.search_idx.store(idx, Ordering::Relaxed);
                return Some(bitmap_idx);
            }
            idx += 1;
        }
        None
    }

    /// Claim blocks and mark them dirty, reporting whether they were clean.
    pub fn alloc_blocks(&self, blocks: usize) -> Option<ArenaClaim> {
        let index = self.try_claim(blocks)?;
        let was_clean = self.blocks_dirty.claim(blocks, index);
        Some(ArenaClaim {
            ptr: self.block_ptr(index),
            index,
            is_zero: was_clean && self.is_zero_init,
        })
    }

    /// Check that `blocks` starting at `index` lie inside this arena.
    pub fn contains_run(&self, index: BitmapIndex, blocks: usize) -> bool {
        blocks > 0
            && index.field() < self.field_count()
            && index.bit_in_field() + blocks <= BITMAP_FIELD_BITS
            && index.bit() + blocks <= self.block_count
    }

    /// Return blocks to the arena.
    ///
    /// Returns `false`, releasing nothing, if any of them was not in use.
    /// The caller must have checked the run with [`Arena::contains_run`].
    pub fn free_blocks(&self, index: BitmapIndex, blocks: usize) -> bool {
        self.blocks_map.unclaim(blocks, index)
    }

    /// Whether every block of the run is in use.
    pub fn is_claimed(&self, index: BitmapIndex, blocks: usize) -> bool {
        self.blocks_map.is_claimed(blocks, index)
    }

    #[inline]
    pub fn block_ptr(&self, index: BitmapIndex) -> NonNull<u8> {
        let offset = index.bit() * ARENA_BLOCK_SIZE;
        // In bounds: index < block_count, so the offset lies inside the region.
        unsafe { NonNull::new_unchecked(self.start.as_ptr().wrapping_add(offset)) }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("start", &self.start)
            .field("block_count", &self.block_count)
            .field("numa_node", &self.numa_node)
            .field("is_large", &self.is_large)
            .field("is_zero_init", &self.is_zero_init)
            .field("blocks_map", &self.blocks_map)
            .finish()
    }
}

// Safety: Arena can be shared across threads because:
// - `start`, sizes and flags are never modified after construction
// - both bitmaps and `search_idx` are only touched through atomics
// - the arena never dereferences `start`
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

/// Usage snapshot across all registered arenas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub arenas: usize,
    pub large_arenas: usize,
    pub total_blocks: usize,
    pub blocks_in_use: usize,
}

impl ArenaStats {
    /// Total arena capacity in bytes.
    pub fn total_capacity(&self) -> usize {
        self.total_blocks * ARENA_BLOCK_SIZE
    }

    /// Bytes currently handed out from arenas.
    pub fn used_bytes(&self) -> usize {
        self.blocks_in_use * ARENA_BLOCK_SIZE
    }

    pub(crate) fn record(&mut self, arena: &Arena) {
        self.arenas += 1;
        self.large_arenas += usize::from(arena.is_large());
        self.total_blocks += arena.block_count();
        self.blocks_in_use += arena.blocks_in_use();
    }
}
