//! nalloc-arena: the arena layer of a general-purpose allocator.
//!
//! Arenas are large, pre-reserved OS regions (typically 1 GiB huge pages)
//! from which the allocator carves out coarse 32 MiB blocks for large
//! objects. Reserving huge pages is expensive, so the cost is paid once and
//! amortized over every allocation that lands in the arena afterwards.
//!
//! # Features
//!
//! - **Lock-free**: blocks are claimed with atomic bitmap operations only
//! - **NUMA-aware**: local arenas are preferred, remote arenas are a fallback
//! - **Huge pages**: 1 GiB pages can be reserved per node or interleaved
//! - **Graceful degradation**: anything an arena cannot serve goes to the OS
//! - **Loud failure**: double frees and foreign memids are reported as fatal
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use nalloc_arena::{ArenaAllocator, ARENA_BLOCK_SIZE};
//!
//! let arenas = ArenaAllocator::new();
//! // Spread 4 huge pages over all NUMA nodes; failure is not fatal.
//! let _ = arenas.reserve_huge_os_pages_interleave(4, Duration::from_secs(2));
//!
//! let block = arenas.alloc(2 * ARENA_BLOCK_SIZE, true, true).unwrap();
//! unsafe {
//!     arenas
//!         .free(block.ptr.as_ptr(), 2 * ARENA_BLOCK_SIZE, block.memid)
//!         .expect("corrupted free");
//! }
//! ```

pub mod allocator;
pub mod arena;
pub mod bitmap;
pub mod config;
pub mod error;
pub mod logging;
pub mod memid;
pub mod platform;
pub mod registry;
pub mod reserve;

#[cfg(test)]
pub(crate) mod testing;

pub use allocator::{Allocation, ArenaAllocator};
pub use arena::{Arena, ArenaStats};
pub use bitmap::{Bitmap, BitmapIndex};
pub use config::*;
pub use error::ArenaError;
pub use memid::MemoryId;
pub use platform::{sys, AllocFailed, HugeRegion, OsMemory, OsRegion, SystemOs};
pub use registry::ArenaRegistry;
pub use reserve::{interleave_plan, NodeReservation};
