//! Arena geometry and process-wide options.
//!
//! The constants fix the shape of every arena: how big a block is, how many
//! blocks one bitmap field covers, and therefore the largest object an arena
//! can ever hand out. [`Options`] carries the few switches the arena layer
//! reads from its environment.

use std::time::Duration;

use tracing::warn;

/// Alignment of a segment; every arena base is aligned to this.
pub const SEGMENT_ALIGN: usize = 4 * 1024 * 1024; // 4 MiB

/// Allocation granularity inside an arena.
pub const ARENA_BLOCK_SIZE: usize = 8 * SEGMENT_ALIGN; // 32 MiB

/// Bits per bitmap field. A claimed run never spans two fields.
pub const BITMAP_FIELD_BITS: usize = usize::BITS as usize;

/// Largest request an arena can serve (one full field of blocks).
pub const ARENA_MAX_OBJ_SIZE: usize = BITMAP_FIELD_BITS * ARENA_BLOCK_SIZE; // 2 GiB

/// Smallest request worth a coarse arena block.
pub const ARENA_MIN_OBJ_SIZE: usize = ARENA_BLOCK_SIZE / 2; // 16 MiB

/// Registry capacity. Must stay below 255: the slot lives in the low byte of a memid.
pub const MAX_ARENAS: usize = 64;

/// Size of one huge OS page.
pub const HUGE_OS_PAGE_SIZE: usize = 1024 * 1024 * 1024; // 1 GiB

/// Extra timeout budget granted to each node during interleaved reservation.
pub const INTERLEAVE_TIMEOUT_SLACK: Duration = Duration::from_millis(50);

const ENV_LARGE_OS_PAGES: &str = "NALLOC_LARGE_OS_PAGES";
const ENV_RESERVE_HUGE_OS_PAGES: &str = "NALLOC_RESERVE_HUGE_OS_PAGES";
const ENV_RESERVE_HUGE_OS_PAGES_AT: &str = "NALLOC_RESERVE_HUGE_OS_PAGES_AT";

/// Process-wide switches consumed by the arena layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// Allow large OS pages when falling back to direct OS allocation.
    pub large_os_pages: bool,
    /// Number of 1 GiB huge pages to reserve at startup.
    pub reserve_huge_os_pages: usize,
    /// Pin the startup reservation to a single NUMA node instead of interleaving.
    pub reserve_huge_os_pages_at: Option<usize>,
}

impl Options {
    /// Read options from `NALLOC_*` environment variables.
    ///
    /// Unparsable values are reported and replaced by their default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();

        if let Some(value) = lookup(ENV_LARGE_OS_PAGES) {
            match parse_bool(&value) {
                Some(flag) => options.large_os_pages = flag,
                None => warn!(key = ENV_LARGE_OS_PAGES, value = %value, "ignoring invalid option"),
            }
        }

        if let Some(value) = lookup(ENV_RESERVE_HUGE_OS_PAGES) {
            match value.trim().parse::<usize>() {
                Ok(pages) => options.reserve_huge_os_pages = pages,
                Err(_) => {
                    warn!(key = ENV_RESERVE_HUGE_OS_PAGES, value = %value, "ignoring invalid option")
                }
            }
        }

        if let Some(value) = lookup(ENV_RESERVE_HUGE_OS_PAGES_AT) {
            match value.trim().parse::<usize>() {
                Ok(node) => options.reserve_huge_os_pages_at = Some(node),
                Err(_) => {
                    warn!(key = ENV_RESERVE_HUGE_OS_PAGES_AT, value = %value, "ignoring invalid option")
                }
            }
        }

        options
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Number of arena blocks needed to hold `size` bytes.
#[inline]
pub const fn block_count_of_size(size: usize) -> usize {
    size.div_ceil(ARENA_BLOCK_SIZE)
}
