//! Platform-specific memory interface.
//!
//! The arena layer never talks to the OS directly; it goes through the
//! [`OsMemory`] trait so the policy can be exercised without mapping real
//! memory. [`SystemOs`] is the production implementation:
//! - **Linux**: `mmap` via `rustix`, huge pages and NUMA binding via `libc`
//! - **macOS**: `mach_vm_allocate` via `mach2`
//! - **Other Unix**: `mmap` via `libc`

use std::fmt;
use std::ptr::NonNull;
use std::time::Duration;

/// Error type for system memory allocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocFailed;

impl std::error::Error for AllocFailed {}

impl fmt::Display for AllocFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "System memory allocation failed")
    }
}

/// A region handed out by [`OsMemory::alloc_aligned`].
#[derive(Debug, Clone, Copy)]
pub struct OsRegion {
    pub ptr: NonNull<u8>,
    /// Whether the region ended up backed by large OS pages.
    pub large: bool,
}

/// A run of huge pages handed out by [`OsMemory::alloc_huge_os_pages`].
#[derive(Debug, Clone, Copy)]
pub struct HugeRegion {
    pub ptr: NonNull<u8>,
    /// Pages actually reserved; may be fewer than requested.
    pub pages_reserved: usize,
    /// Size of the region in bytes.
    pub size: usize,
}

/// The OS services the arena layer consumes.
///
/// Implementations must be shareable across threads.
pub trait OsMemory: Send + Sync {
    /// Allocate `size` bytes aligned to `alignment`.
    ///
    /// When `commit` is false the range is only reserved. `large` asks for
    /// large OS pages; the returned region reports whether it got them.
    fn alloc_aligned(
        &self,
        size: usize,
        alignment: usize,
        commit: bool,
        large: bool,
    ) -> Result<OsRegion, AllocFailed>;

    /// Release a region obtained from [`OsMemory::alloc_aligned`].
    ///
    /// # Safety
    /// `ptr` and `size` must describe exactly one live allocation.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);

    /// Reserve up to `pages` huge OS pages, optionally bound to a NUMA node,
    /// giving up once `timeout` has elapsed.
    fn alloc_huge_os_pages(
        &self,
        pages: usize,
        numa_node: Option<usize>,
        timeout: Duration,
    ) -> Result<HugeRegion, AllocFailed>;

    /// Release huge pages obtained from [`OsMemory::alloc_huge_os_pages`].
    ///
    /// # Safety
    /// `ptr` and `size` must describe exactly one live huge-page region.
    unsafe fn free_huge_os_pages(&self, ptr: NonNull<u8>, size: usize);

    /// Number of NUMA nodes; always at least 1.
    fn numa_node_count(&self) -> usize;

    /// NUMA node the calling thread is running on.
    fn current_numa_node(&self) -> usize;
}

/// The real operating system.
#[derive(Debug, Clone, Copy)]
pub struct SystemOs {
    page_size: usize,
    numa_nodes: usize,
}

impl SystemOs {
    /// Probe page size and NUMA topology.
    pub fn new() -> Self {
        Self {
            page_size: sys::page_size(),
            numa_nodes: sys::numa_node_count().max(1),
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

impl Default for SystemOs {
    fn default() -> Self {
        Self::new()
    }
}

impl OsMemory for SystemOs {
    fn alloc_aligned(
        &self,
        size: usize,
        alignment: usize,
        commit: bool,
        large: bool,
    ) -> Result<OsRegion, AllocFailed> {
        debug_assert!(size > 0);
        debug_assert!(alignment.is_power_of_two());

        let size = align_up(size, self.page_size);
        if alignment <= self.page_size {
            let ptr = sys::map(size, commit)?;
            let large = large && sys::advise_huge(ptr, size);
            return Ok(OsRegion { ptr, large });
        }

        // Over-map, then trim both ends down to an aligned window.
        let over = size.checked_add(alignment).ok_or(AllocFailed)?;
        let raw = sys::map(over, commit)?;
        let start = raw.as_ptr() as usize;
        let aligned = align_up(start, alignment);
        let pre = aligned - start;
        let post = over - pre - size;
        unsafe {
            if pre > 0 {
                sys::unmap(raw.as_ptr(), pre);
            }
            if post > 0 {
                sys::unmap((aligned + size) as *mut u8, post);
            }
        }
        let ptr = NonNull::new(aligned as *mut u8).ok_or(AllocFailed)?;
        let large = large && sys::advise_huge(ptr, size);
        Ok(OsRegion { ptr, large })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        sys::unmap(ptr.as_ptr(), align_up(size, self.page_size));
    }

    fn alloc_huge_os_pages(
        &self,
        pages: usize,
        numa_node: Option<usize>,
        timeout: Duration,
    ) -> Result<HugeRegion, AllocFailed> {
        sys::alloc_huge_pages(pages, numa_node, timeout)
    }

    unsafe fn free_huge_os_pages(&self, ptr: NonNull<u8>, size: usize) {
        sys::unmap(ptr.as_ptr(), size);
    }

    fn numa_node_count(&self) -> usize {
        self.numa_nodes
    }

    fn current_numa_node(&self) -> usize {
        if self.numa_nodes <= 1 {
            0
        } else {
            sys::current_numa_node() % self.numa_nodes
        }
    }
}

#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Platform-specific memory functions.
pub mod sys {
    use super::{AllocFailed, HugeRegion};
    use std::ptr::NonNull;
    use std::time::Duration;

    #[cfg(unix)]
    pub fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    /// Map `size` bytes of anonymous memory.
    ///
    /// Uncommitted mappings are `PROT_NONE` and do not reserve swap.
    #[cfg(target_os = "linux")]
    pub fn map(size: usize, commit: bool) -> Result<NonNull<u8>, AllocFailed> {
        use rustix::mm::{mmap_anonymous, MapFlags, ProtFlags};
        use std::ptr;

        debug_assert!(size > 0);

        let prot = if commit {
            ProtFlags::READ | ProtFlags::WRITE
        } else {
            ProtFlags::empty()
        };
        let addr = unsafe {
            mmap_anonymous(
                ptr::null_mut(),
                size,
                prot,
                MapFlags::PRIVATE | MapFlags::NORESERVE,
            )
        }
        .map_err(|_| AllocFailed)?;
        NonNull::new(addr.cast()).ok_or(AllocFailed)
    }

    #[cfg(target_os = "linux")]
    pub unsafe fn unmap(ptr: *mut u8, size: usize) {
        if let Err(err) = rustix::mm::munmap(ptr.cast(), size) {
            tracing::warn!(ptr = ?ptr, size, %err, "munmap failed");
        }
    }

    /// Ask for transparent huge pages; reports whether the kernel accepted.
    #[cfg(target_os = "linux")]
    pub fn advise_huge(ptr: NonNull<u8>, size: usize) -> bool {
        use rustix::mm::{madvise, Advice};
        unsafe { madvise(ptr.as_ptr().cast(), size, Advice::LinuxHugepage) }.is_ok()
    }

    #[cfg(target_vendor = "apple")]
    pub fn map(size: usize, _commit: bool) -> Result<NonNull<u8>, AllocFailed> {
        use mach2::kern_return::KERN_SUCCESS;
        use mach2::traps::mach_task_self;
        use mach2::vm::mach_vm_allocate;
        use mach2::vm_statistics::VM_FLAGS_ANYWHERE;
        use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

        debug_assert!(size > 0);

        let task = unsafe { mach_task_self() };
        let mut address: mach_vm_address_t = 0;
        let vm_size: mach_vm_size_t = size as mach_vm_size_t;

        let retval = unsafe { mach_vm_allocate(task, &mut address, vm_size, VM_FLAGS_ANYWHERE) };

        if retval == KERN_SUCCESS {
            NonNull::new(address as *mut u8).ok_or(AllocFailed)
        } else {
            Err(AllocFailed)
        }
    }

    #[cfg(target_vendor = "apple")]
    pub unsafe fn unmap(ptr: *mut u8, size: usize) {
        use mach2::traps::mach_task_self;
        use mach2::vm::mach_vm_deallocate;
        use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

        let task = mach_task_self();
        mach_vm_deallocate(task, ptr as mach_vm_address_t, size as mach_vm_size_t);
    }

    #[cfg(not(target_os = "linux"))]
    pub fn advise_huge(_ptr: NonNull<u8>, _size: usize) -> bool {
        false
    }

    /// Fallback for other Unix-like systems.
    #[cfg(all(not(target_os = "linux"), not(target_vendor = "apple"), unix))]
    pub fn map(size: usize, commit: bool) -> Result<NonNull<u8>, AllocFailed> {
        use libc::{mmap, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE};
        use std::ptr;

        debug_assert!(size > 0);

        let prot = if commit { PROT_READ | PROT_WRITE } else { PROT_NONE };
        let ptr = unsafe { mmap(ptr::null_mut(), size, prot, MAP_PRIVATE | MAP_ANON, -1, 0) };

        if ptr == MAP_FAILED {
            Err(AllocFailed)
        } else {
            NonNull::new(ptr as *mut u8).ok_or(AllocFailed)
        }
    }

    #[cfg(all(not(target_os = "linux"), not(target_vendor = "apple"), unix))]
    pub unsafe fn unmap(ptr: *mut u8, size: usize) {
        libc::munmap(ptr.cast(), size);
    }

    /// Reserve 1 GiB pages one at a time into a contiguous, 1 GiB aligned range.
    ///
    /// Stops at the first page the kernel refuses or once `timeout` elapses,
    /// and returns whatever was mapped so far.
    #[cfg(target_os = "linux")]
    pub fn alloc_huge_pages(
        pages: usize,
        numa_node: Option<usize>,
        timeout: Duration,
    ) -> Result<HugeRegion, AllocFailed> {
        use crate::config::HUGE_OS_PAGE_SIZE;
        use std::time::Instant;

        if pages == 0 {
            return Err(AllocFailed);
        }
        let size = pages.checked_mul(HUGE_OS_PAGE_SIZE).ok_or(AllocFailed)?;

        // Reserve address space first so the pages end up contiguous.
        let over = size.checked_add(HUGE_OS_PAGE_SIZE).ok_or(AllocFailed)?;
        let raw = map(over, false)?;
        let start = super::align_up(raw.as_ptr() as usize, HUGE_OS_PAGE_SIZE);
        let pre = start - raw.as_ptr() as usize;
        unsafe {
            if pre > 0 {
                unmap(raw.as_ptr(), pre);
            }
            let post = over - pre - size;
            if post > 0 {
                unmap((start + size) as *mut u8, post);
            }
        }

        let deadline = Instant::now() + timeout;
        let mut reserved = 0;
        while reserved < pages {
            let addr = (start + reserved * HUGE_OS_PAGE_SIZE) as *mut libc::c_void;
            let p = unsafe {
                libc::mmap(
                    addr,
                    HUGE_OS_PAGE_SIZE,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE
                        | libc::MAP_ANONYMOUS
                        | libc::MAP_FIXED
                        | libc::MAP_HUGETLB
                        | libc::MAP_HUGE_1GB,
                    -1,
                    0,
                )
            };
            if p == libc::MAP_FAILED {
                break;
            }
            if let Some(node) = numa_node {
                bind_to_node(p, HUGE_OS_PAGE_SIZE, node);
            }
            reserved += 1;
            if Instant::now() > deadline {
                break;
            }
        }

        if reserved < pages {
            unsafe {
                unmap(
                    (start + reserved * HUGE_OS_PAGE_SIZE) as *mut u8,
                    (pages - reserved) * HUGE_OS_PAGE_SIZE,
                );
            }
        }
        if reserved == 0 {
            return Err(AllocFailed);
        }

        Ok(HugeRegion {
            ptr: NonNull::new(start as *mut u8).ok_or(AllocFailed)?,
            pages_reserved: reserved,
            size: reserved * HUGE_OS_PAGE_SIZE,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn alloc_huge_pages(
        _pages: usize,
        _numa_node: Option<usize>,
        _timeout: Duration,
    ) -> Result<HugeRegion, AllocFailed> {
        Err(AllocFailed)
    }

    /// Best-effort `mbind(MPOL_PREFERRED)`; failures leave the default policy.
    #[cfg(target_os = "linux")]
    fn bind_to_node(addr: *mut libc::c_void, size: usize, node: usize) {
        const MPOL_PREFERRED: libc::c_long = 1;
        const MASK_BITS: usize = libc::c_ulong::BITS as usize;

        if node >= MASK_BITS {
            return;
        }
        let mask: libc::c_ulong = 1 << node;
        let rc = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                addr,
                size as libc::c_ulong,
                MPOL_PREFERRED,
                &mask as *const libc::c_ulong,
                MASK_BITS as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        if rc != 0 {
            tracing::debug!(node, "mbind failed; huge page left on default node");
        }
    }

    /// Count `/sys/devices/system/node/nodeN` entries.
    #[cfg(target_os = "linux")]
    pub fn numa_node_count() -> usize {
        std::fs::read_dir("/sys/devices/system/node")
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| {
                        e.file_name()
                            .to_str()
                            .and_then(|name| name.strip_prefix("node"))
                            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
                    })
                    .count()
            })
            .unwrap_or(1)
            .max(1)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn numa_node_count() -> usize {
        1
    }

    #[cfg(target_os = "linux")]
    pub fn current_numa_node() -> usize {
        let mut cpu: libc::c_uint = 0;
        let mut node: libc::c_uint = 0;
        let rc = unsafe {
            libc::syscall(
                libc::SYS_getcpu,
                &mut cpu as *mut libc::c_uint,
                &mut node as *mut libc::c_uint,
                std::ptr::null_mut::<libc::c_void>(),
            )
        };
        if rc == 0 {
            node as usize
        } else {
            0
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn current_numa_node() -> usize {
        0
    }
}
