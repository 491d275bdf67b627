//! Memory identifiers.
//!
//! Every allocation returns a [`MemoryId`] that the caller hands back on
//! free. Internally it is a sum type. At the boundary it packs into one
//! `usize`: the low 8 bits hold the arena slot + 1 and the upper bits hold
//! the bitmap index. The all-zero word is reserved for direct OS memory.

use crate::bitmap::BitmapIndex;
use crate::error::ArenaError;

const SLOT_BITS: u32 = 8;
const SLOT_MASK: usize = (1 << SLOT_BITS) - 1;

/// Largest bitmap index that still fits in a raw memid.
pub const MAX_ENCODED_BIT: usize = usize::MAX >> SLOT_BITS;

/// How a block of memory was obtained, and therefore how to release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryId {
    /// Allocated directly from the OS.
    #[default]
    Os,
    /// Claimed from the arena in registry slot `slot`, starting at `index`.
    Arena { slot: usize, index: BitmapIndex },
}

impl MemoryId {
    #[inline]
    pub fn arena(slot: usize, index: BitmapIndex) -> Self {
        Self::Arena { slot, index }
    }

    #[inline]
    pub fn is_os(&self) -> bool {
        matches!(self, Self::Os)
    }

    /// Pack into a single word.
    pub fn to_raw(self) -> usize {
        match self {
            Self::Os => 0,
            Self::Arena { slot, index } => {
                debug_assert!(slot < SLOT_MASK, "arena slot does not fit in a memid");
                debug_assert!(index.bit() <= MAX_ENCODED_BIT, "bitmap index overflows a memid");
                (index.bit() << SLOT_BITS) | ((slot + 1) & SLOT_MASK)
            }
        }
    }

    /// Unpack a word produced by [`MemoryId::to_raw`].
    ///
    /// A word with an empty slot tag but a non-zero payload was never produced
    /// by this layer and is rejected.
    pub fn from_raw(raw: usize) -> Result<Self, ArenaError> {
        let tag = raw & SLOT_MASK;
        match (tag, raw >> SLOT_BITS) {
            (0, 0) => Ok(Self::Os),
            (0, _) => Err(ArenaError::InvalidMemoryId { raw }),
            (tag, bit) => Ok(Self::Arena {
                slot: tag - 1,
                index: BitmapIndex::from_bit(bit),
            }),
        }
    }
}
