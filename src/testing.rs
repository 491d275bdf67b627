//! In-memory stand-in for the OS layer used by unit tests.
//!
//! Hands out aligned fake addresses that are never dereferenced, and records
//! every call so tests can assert on what reached the OS.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::HUGE_OS_PAGE_SIZE;
use crate::platform::{align_up, AllocFailed, HugeRegion, OsMemory, OsRegion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HugeCall {
    pub pages: usize,
    pub numa_node: Option<usize>,
    pub timeout: Duration,
}

pub struct FakeOs {
    nodes: usize,
    current: AtomicUsize,
    next_addr: AtomicUsize,
    huge_available: AtomicUsize,
    os_allocs: AtomicUsize,
    os_frees: AtomicUsize,
    huge_calls: Mutex<Vec<HugeCall>>,
}

impl FakeOs {
    pub fn new(nodes: usize, current: usize) -> Self {
        Self {
            nodes,
            current: AtomicUsize::new(current),
            next_addr: AtomicUsize::new(1 << 44),
            huge_available: AtomicUsize::new(0),
            os_allocs: AtomicUsize::new(0),
            os_frees: AtomicUsize::new(0),
            huge_calls: Mutex::new(Vec::new()),
        }
    }

    /// A fresh, 1 GiB aligned fake range of at least `size` bytes.
    pub fn reserve_fake(&self, size: usize) -> NonNull<u8> {
        let span = align_up(size.max(1), HUGE_OS_PAGE_SIZE);
        let addr = self.next_addr.fetch_add(span, Ordering::Relaxed);
        NonNull::new(addr as *mut u8).unwrap()
    }

    pub fn set_huge_pages_available(&self, pages: usize) {
        self.huge_available.store(pages, Ordering::Relaxed);
    }

    pub fn os_allocs(&self) -> usize {
        self.os_allocs.load(Ordering::Relaxed)
    }

    pub fn os_frees(&self) -> usize {
        self.os_frees.load(Ordering::Relaxed)
    }

    pub fn huge_calls(&self) -> Vec<HugeCall> {
        self.huge_calls.lock().unwrap().clone()
    }
}

impl OsMemory for FakeOs {
    fn alloc_aligned(&self, size: usize, _alignment: usize, _commit: bool, large: bool) -> Result<OsRegion, AllocFailed> {
        self.os_allocs.fetch_add(1, Ordering::Relaxed);
        Ok(OsRegion {
            ptr: self.reserve_fake(size),
            large,
        })
    }

    unsafe fn free(&self, _ptr: NonNull<u8>, _size: usize) {
        self.os_frees.fetch_add(1, Ordering::Relaxed);
    }

    fn alloc_huge_os_pages(
        &self,
        pages: usize,
        numa_node: Option<usize>,
        timeout: Duration,
    ) -> Result<HugeRegion, AllocFailed> {
        self.huge_calls.lock().unwrap().push(HugeCall {
            pages,
            numa_node,
            timeout,
        });
        let available = self.huge_available.load(Ordering::Relaxed);
        let granted = pages.min(available);
        if granted == 0 {
            return Err(AllocFailed);
        }
        self.huge_available.store(available - granted, Ordering::Relaxed);
        let size = granted * HUGE_OS_PAGE_SIZE;
        Ok(HugeRegion {
            ptr: self.reserve_fake(size),
            pages_reserved: granted,
            size,
        })
    }

    unsafe fn free_huge_os_pages(&self, _ptr: NonNull<u8>, _size: usize) {}

    fn numa_node_count(&self) -> usize {
        self.nodes.max(1)
    }

    fn current_numa_node(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }
}
