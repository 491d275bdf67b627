//! Logging for the arena layer.
//!
//! Events go through `tracing`. Hot-path events are emitted at TRACE under
//! the `arena` target so they cost nothing unless explicitly enabled.

use std::ptr::NonNull;

use tracing::trace;

use crate::memid::MemoryId;

/// Install a compact fmt subscriber honoring `RUST_LOG`.
///
/// Calling it more than once, or after another subscriber was installed, is
/// harmless.
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            EnvFilter::new("nalloc_arena=debug")
        }
        #[cfg(not(debug_assertions))]
        {
            EnvFilter::new("nalloc_arena=info")
        }
    });

    fmt().with_env_filter(filter).compact().try_init().ok();
}

#[inline]
pub(crate) fn log_arena_alloc(size: usize, ptr: NonNull<u8>, memid: MemoryId) {
    trace!(target: "arena", size, ptr = ?ptr, ?memid, "allocated");
}

#[inline]
pub(crate) fn log_arena_free(size: usize, ptr: NonNull<u8>, memid: MemoryId) {
    trace!(target: "arena", size, ptr = ?ptr, ?memid, "freed");
}
