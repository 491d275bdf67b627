//! Fixed-capacity, append-only table of published arenas.
//!
//! Publishing reserves a slot by bumping `count`, then stores the arena
//! pointer into that slot. The two steps are separate atomics, so a reader
//! can see the count advance before the pointer lands. Readers therefore
//! scan from slot 0 and stop at the first empty slot instead of trusting
//! `count`.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::arena::{Arena, ArenaStats};
use crate::config::MAX_ARENAS;

pub struct ArenaRegistry {
    slots: [AtomicPtr<Arena>; MAX_ARENAS],
    count: AtomicUsize,
}

impl ArenaRegistry {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            count: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        MAX_ARENAS
    }

    /// Number of reserved slots. Some may not be visible yet.
    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed).min(MAX_ARENAS)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish an arena and return its slot.
    ///
    /// When the table is full the arena is handed back untouched.
    pub fn publish(&self, arena: Box<Arena>) -> Result<usize, Box<Arena>> {
        let slot = self.count.fetch_add(1, Ordering::AcqRel);
        if slot >= MAX_ARENAS {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(arena);
        }
        self.slots[slot].store(Box::into_raw(arena), Ordering::Release);
        Ok(slot)
    }

    /// The arena in `slot`, if it has been published.
    #[inline]
    pub fn get(&self, slot: usize) -> Option<&Arena> {
        let arena = self.slots.get(slot)?.load(Ordering::Acquire);
        // Published pointers are never freed or replaced while `self` lives.
        unsafe { arena.as_ref() }
    }

    /// Iterate published arenas in slot order, stopping at the first gap.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Arena)> + '_ {
        (0..MAX_ARENAS).map_while(move |slot| self.get(slot).map(|arena| (slot, arena)))
    }

    pub fn stats(&self) -> ArenaStats {
        let mut stats = ArenaStats::default();
        for (_, arena) in self.iter() {
            stats.record(arena);
        }
        stats
    }
}

impl Default for ArenaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ArenaRegistry {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            let arena = std::mem::replace(slot.get_mut(), ptr::null_mut());
            if !arena.is_null() {
                drop(unsafe { Box::from_raw(arena) });
            }
        }
    }
}

impl std::fmt::Debug for ArenaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaRegistry")
            .field("count", &self.len())
            .field("capacity", &MAX_ARENAS)
            .finish()
    }
}
