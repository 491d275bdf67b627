//! Error type for the arena layer.
//!
//! Errors fall into two classes. Soft errors (out of memory, registry full,
//! a region that cannot become an arena) are ordinary failures the caller
//! can degrade from. Fatal errors are raised only by the free path and mean
//! the caller handed back a pointer or memid this layer never produced, or
//! freed the same blocks twice. The arena layer reports them and stops; it
//! is up to the host to abort.

use thiserror::Error;

use crate::memid::MemoryId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    /// The OS declined the request, or no huge pages could be reserved.
    #[error("out of memory")]
    OutOfMemory,

    /// Every registry slot is taken.
    #[error("arena registry is full ({capacity} arenas)")]
    RegistryFull { capacity: usize },

    /// A caller-supplied region does not start on a segment boundary.
    #[error("arena region {start:#x} is not aligned to {align:#x}")]
    MisalignedRegion { start: usize, align: usize },

    /// A caller-supplied region cannot hold a single block.
    #[error("arena region of {size} bytes is smaller than one block")]
    EmptyRegion { size: usize },

    /// A raw memid whose tag is zero but whose payload is not.
    #[error("invalid memory id {raw:#x}")]
    InvalidMemoryId { raw: usize },

    /// The memid names a slot that holds no arena.
    #[error("trying to free from non-existent arena: {ptr:#x}, size {size}, memid: {memid:?}")]
    UnknownArena { ptr: usize, size: usize, memid: MemoryId },

    /// The memid names blocks outside the arena's bitmap.
    #[error("trying to free from non-existent arena block: {ptr:#x}, size {size}, memid: {memid:?}")]
    BlockOutOfRange { ptr: usize, size: usize, memid: MemoryId },

    /// Some of the blocks being freed were already free.
    #[error("trying to free an already freed block: {ptr:#x}, size {size}")]
    DoubleFree { ptr: usize, size: usize },
}

impl ArenaError {
    /// Whether this error signals memory corruption rather than exhaustion.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidMemoryId { .. }
                | Self::UnknownArena { .. }
                | Self::BlockOutOfRange { .. }
                | Self::DoubleFree { .. }
        )
    }

    /// C status code for hosts that speak errno.
    pub fn errno(&self) -> i32 {
        match self {
            Self::OutOfMemory | Self::RegistryFull { .. } => libc::ENOMEM,
            _ => libc::EINVAL,
        }
    }
}

impl From<crate::platform::AllocFailed> for ArenaError {
    fn from(_: crate::platform::AllocFailed) -> Self {
        Self::OutOfMemory
    }
}
