//! Atomic bitmap used to track arena blocks.
//!
//! The bitmap is an array of `usize` fields. Every operation works on a run
//! of bits that lies inside a single field, so each one is a single atomic
//! read-modify-write (or a compare-and-swap loop for [`Bitmap::try_claim_field`]).
//! This caps a claimed run at [`BITMAP_FIELD_BITS`] bits.

use std::collections::TryReserveError;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::BITMAP_FIELD_BITS;

/// Position of a bit in a [`Bitmap`], stored as `field * BITMAP_FIELD_BITS + bit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BitmapIndex(usize);

impl BitmapIndex {
    #[inline]
    pub const fn new(field: usize, bit: usize) -> Self {
        debug_assert!(bit < BITMAP_FIELD_BITS);
        Self(field * BITMAP_FIELD_BITS + bit)
    }

    #[inline]
    pub const fn from_bit(index: usize) -> Self {
        Self(index)
    }

    /// Field that holds this bit.
    #[inline]
    pub const fn field(self) -> usize {
        self.0 / BITMAP_FIELD_BITS
    }

    /// Offset of this bit inside its field.
    #[inline]
    pub const fn bit_in_field(self) -> usize {
        self.0 % BITMAP_FIELD_BITS
    }

    /// Absolute bit number.
    #[inline]
    pub const fn bit(self) -> usize {
        self.0
    }
}

#[inline]
const fn run_mask(count: usize) -> usize {
    if count >= BITMAP_FIELD_BITS {
        usize::MAX
    } else {
        (1usize << count) - 1
    }
}

/// A fixed-size array of atomic bit fields.
///
/// The size is fixed at construction; fields are never added or removed.
pub struct Bitmap {
    fields: Box<[AtomicUsize]>,
}

impl Bitmap {
    /// Create a bitmap of `field_count` cleared fields.
    ///
    /// Allocation failure is returned rather than aborting, so callers can
    /// release whatever region the bitmap was meant to describe.
    pub fn try_new(field_count: usize) -> Result<Self, TryReserveError> {
        let mut fields = Vec::new();
        fields.try_reserve_exact(field_count)?;
        fields.extend((0..field_count).map(|_| AtomicUsize::new(0)));
        Ok(Self {
            fields: fields.into_boxed_slice(),
        })
    }

    /// Number of fields.
    #[inline]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Total number of bits.
    #[inline]
    pub fn bit_count(&self) -> usize {
        self.fields.len() * BITMAP_FIELD_BITS
    }

    /// Try to atomically claim `count` consecutive zero bits in field `field_idx`.
    ///
    /// Returns the index of the first claimed bit, or `None` if the field has no
    /// free run of that length.
    pub fn try_claim_field(&self, field_idx: usize, count: usize) -> Option<BitmapIndex> {
        debug_assert!(count > 0 && count <= BITMAP_FIELD_BITS);
        let field = self.fields.get(field_idx)?;

        let mask = run_mask(count);
        let mut map = field.load(Ordering::Relaxed);
        if map == usize::MAX {
            return None;
        }

        // Start at the first zero bit.
        let mut bit = map.trailing_ones() as usize;
        while bit + count <= BITMAP_FIELD_BITS {
            let run = mask << bit;
            let overlap = map & run;
            if overlap == 0 {
                match field.compare_exchange_weak(map, map | run, Ordering::AcqRel, Ordering::Relaxed) {
                    Ok(_) => return Some(BitmapIndex::new(field_idx, bit)),
                    // Lost a race; retry the same position with the fresh value.
                    Err(current) => map = current,
                }
            } else {
                // Skip past the highest set bit inside the candidate run.
                let highest = BITMAP_FIELD_BITS - 1 - overlap.leading_zeros() as usize;
                bit = highest + 1;
            }
        }
        None
    }

    /// Set `count` bits starting at `idx`.
    ///
    /// Returns `true` if all of them were clear before.
    pub fn claim(&self, count: usize, idx: BitmapIndex) -> bool {
        let mask = self.field_mask(count, idx);
        let prev = self.fields[idx.field()].fetch_or(mask, Ordering::AcqRel);
        prev & mask == 0
    }

    /// Clear `count` bits starting at `idx`, but only if all of them are set.
    ///
    /// Returns `false` and leaves the field untouched when any bit of the run
    /// is already clear, so a bad free cannot release bits owned by someone else.
    pub fn unclaim(&self, count: usize, idx: BitmapIndex) -> bool {
        let mask = self.field_mask(count, idx);
        let field = &self.fields[idx.field()];
        let mut map = field.load(Ordering::Relaxed);
        loop {
            if map & mask != mask {
                return false;
            }
            match field.compare_exchange_weak(map, map & !mask, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(current) => map = current,
            }
        }
    }

    /// Whether every bit of the run is set.
    pub fn is_claimed(&self, count: usize, idx: BitmapIndex) -> bool {
        let mask = self.field_mask(count, idx);
        self.fields[idx.field()].load(Ordering::Acquire) & mask == mask
    }

    /// Number of set bits across all fields.
    pub fn count_ones(&self) -> usize {
        self.fields
            .iter()
            .map(|f| f.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    #[inline]
    fn field_mask(&self, count: usize, idx: BitmapIndex) -> usize {
        assert!(idx.field() < self.fields.len(), "bitmap field out of range");
        assert!(
            count > 0 && idx.bit_in_field() + count <= BITMAP_FIELD_BITS,
            "bitmap run crosses a field boundary"
        );
        run_mask(count) << idx.bit_in_field()
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.fields.iter().map(|x| x.load(Ordering::Relaxed)))
            .finish()
    }
}
