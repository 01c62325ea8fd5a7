//! Kernel Heap
//!
//! Uses `linked_list_allocator` for heap management, with the backing pages
//! taken from the PMM rather than a static array.
//!
//! # Memory Layout
//! The heap is one run of kernel-mapped pages. It starts as a contiguous
//! `alloc_kpages` run and grows upward by pinning the physical pages just
//! above its top, so it stays virtually contiguous. Neither step allocates,
//! and the heap lock is only taken around `init` and `extend`.
//!
//! The kernel binary installs it with:
//! ```ignore
//! #[global_allocator]
//! static HEAP: KernelHeap = KernelHeap::empty();
//! ```

use core::alloc::{GlobalAlloc, Layout};

use linked_list_allocator::LockedHeap;
use spin::Mutex;

use super::address::{VirtAddr, PAGE_SIZE};
use super::pmm::{Pmm, PmmError};

/// The run of kernel pages under the heap.
///
/// Kept as plain numbers: the heap may be the global allocator, so its own
/// bookkeeping must never allocate.
#[derive(Debug, Clone, Copy)]
struct Backing {
    start: VirtAddr,
    pages: usize,
}

impl Backing {
    fn top(&self) -> VirtAddr {
        self.start.add(self.pages * PAGE_SIZE)
    }
}

/// A growable kernel heap backed by PMM pages.
///
/// Two locks: `backing` serializes `init` and `grow`, the heap lock guards
/// the free list. The heap lock is never held across a PMM call.
pub struct KernelHeap {
    heap: LockedHeap,
    backing: Mutex<Option<Backing>>,
}

impl KernelHeap {
    /// An uninitialized heap. Every allocation fails until [`init`](Self::init).
    pub const fn empty() -> Self {
        Self {
            heap: LockedHeap::empty(),
            backing: Mutex::new(None),
        }
    }

    /// Seed the heap with `pages` contiguous kernel pages.
    ///
    /// Does not allocate, so it can run while this heap is already the
    /// global allocator.
    ///
    /// # Errors
    /// `InvalidArgument` if already initialized or `pages` is zero, or
    /// whatever the PMM reports.
    pub fn init(&self, pmm: &Pmm, pages: usize) -> Result<(), PmmError> {
        let bytes = pages
            .checked_mul(PAGE_SIZE)
            .filter(|&b| b != 0)
            .ok_or(PmmError::InvalidArgument)?;
        let mut backing = self.backing.lock();
        if backing.is_some() {
            return Err(PmmError::InvalidArgument);
        }

        let start = pmm.alloc_kpages(pages, None)?;
        // SAFETY: the run is kernel-mapped, unused, and owned by the heap
        // for as long as the heap lives.
        unsafe { self.heap.lock().init(start.as_mut_ptr::<u8>(), bytes) };
        *backing = Some(Backing { start, pages });

        log::info!("heap: {} KiB at {}", bytes / 1024, start);
        Ok(())
    }

    /// Extend the heap by `pages` pages at its top.
    ///
    /// Allocations keep being served while the PMM is consulted.
    ///
    /// # Errors
    /// `AlreadyAllocated` if the physical pages above the top are taken,
    /// `NotFound` if the top leaves the linear window or its arena.
    pub fn grow(&self, pmm: &Pmm, pages: usize) -> Result<(), PmmError> {
        let bytes = pages
            .checked_mul(PAGE_SIZE)
            .filter(|&b| b != 0)
            .ok_or(PmmError::InvalidArgument)?;
        let mut backing = self.backing.lock();
        let current = backing.as_mut().ok_or(PmmError::InvalidArgument)?;

        let top = current.top();
        let next = pmm.kvaddr_to_paddr(top).ok_or(PmmError::NotFound)?;
        pmm.pin(next, pages)?;

        // the window is linear, so the new pages must land right at `top`
        let end = next.checked_add(bytes - 1);
        if end.and_then(|pa| pmm.paddr_to_kvaddr(pa)) != Some(top.add(bytes - 1)) {
            pmm.free_run(next, pages)?;
            return Err(PmmError::NotFound);
        }

        // SAFETY: the pages directly above `top` now belong to the heap, and
        // `top` is the heap's current end since `backing` is held.
        unsafe { self.heap.lock().extend(bytes) };
        current.pages += pages;

        log::debug!("heap: grew by {} pages to {} pages", pages, current.pages);
        Ok(())
    }

    /// Heap capacity in bytes.
    pub fn size(&self) -> usize {
        self.heap.lock().size()
    }

    /// Bytes currently handed out.
    pub fn used(&self) -> usize {
        self.heap.lock().used()
    }

    /// Pages backing the heap.
    pub fn pages(&self) -> usize {
        self.backing.lock().map_or(0, |b| b.pages)
    }

    /// Kernel address of the first heap page, once initialized.
    pub fn start(&self) -> Option<VirtAddr> {
        self.backing.lock().map(|b| b.start)
    }

    /// Whether `ptr` points into the heap.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let heap = self.heap.lock();
        let addr = ptr as usize;
        addr >= heap.bottom() as usize && addr < heap.top() as usize
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: forwarded with the caller's guarantees.
        unsafe { self.heap.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: forwarded with the caller's guarantees.
        unsafe { self.heap.dealloc(ptr, layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::address::PhysAddr;
    use crate::mm::arena::ArenaFlags;
    use crate::mm::pmm::PageList;
    use crate::mm::testing::SimRam;

    fn ram(pages: usize) -> SimRam {
        let ram = SimRam::new(PhysAddr::new(0x4000_0000), pages);
        ram.pmm()
            .add_arena(ram.arena("ram", 0, ArenaFlags::KMAP))
            .unwrap();
        ram
    }

    #[test]
    fn test_allocations_come_from_pmm_pages() {
        let ram = ram(8);
        let heap = KernelHeap::empty();
        heap.init(ram.pmm(), 2).unwrap();
        assert_eq!(heap.size(), 2 * PAGE_SIZE);
        assert_eq!(ram.pmm().free_pages(), 6);

        let layout = Layout::from_size_align(256, 16).unwrap();
        let ptr = unsafe { heap.alloc(layout) };
        assert!(!ptr.is_null());
        let pa = ram.pmm().kvaddr_to_paddr(VirtAddr::from_ptr(ptr)).unwrap();
        assert!(pa < PhysAddr::new(0x4000_2000));
        assert!(heap.used() >= 256);
        unsafe { heap.dealloc(ptr, layout) };
    }

    #[test]
    fn test_grow_extends_in_place() {
        let ram = ram(8);
        let heap = KernelHeap::empty();
        heap.init(ram.pmm(), 1).unwrap();

        let big = Layout::from_size_align(3 * PAGE_SIZE, 8).unwrap();
        assert!(unsafe { heap.alloc(big) }.is_null());

        heap.grow(ram.pmm(), 3).unwrap();
        assert_eq!(heap.size(), 4 * PAGE_SIZE);
        assert_eq!(heap.pages(), 4);
        let ptr = unsafe { heap.alloc(big) };
        assert!(!ptr.is_null());
        unsafe { heap.dealloc(ptr, big) };
    }

    #[test]
    fn test_grow_fails_when_neighbour_is_taken() {
        let ram = ram(8);
        let heap = KernelHeap::empty();
        heap.init(ram.pmm(), 1).unwrap();

        let mut other = PageList::new();
        ram.pmm().alloc_range(PhysAddr::new(0x4000_1000), 1, &mut other).unwrap();
        assert_eq!(heap.grow(ram.pmm(), 1), Err(PmmError::AlreadyAllocated));
        assert_eq!(heap.size(), PAGE_SIZE);
        assert_eq!(heap.pages(), 1);
    }

    #[test]
    fn test_grow_stops_at_the_end_of_ram() {
        let ram = ram(4);
        let heap = KernelHeap::empty();
        heap.init(ram.pmm(), 2).unwrap();
        let free = ram.pmm().free_pages();

        assert_eq!(heap.grow(ram.pmm(), 3), Err(PmmError::NotFound));
        assert_eq!(ram.pmm().free_pages(), free);
        assert_eq!(heap.grow(ram.pmm(), usize::MAX), Err(PmmError::InvalidArgument));

        heap.grow(ram.pmm(), 2).unwrap();
        assert_eq!(ram.pmm().free_pages(), 0);
        assert_eq!(heap.pages(), 4);
        assert_eq!(heap.grow(ram.pmm(), 1), Err(PmmError::NotFound));
    }

    #[test]
    fn test_allocations_continue_while_another_core_grows() {
        let ram = ram(64);
        let heap = KernelHeap::empty();
        heap.init(ram.pmm(), 1).unwrap();
        let layout = Layout::from_size_align(64, 8).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..16 {
                    heap.grow(ram.pmm(), 1).unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..500 {
                    let ptr = unsafe { heap.alloc(layout) };
                    assert!(!ptr.is_null());
                    assert!(heap.contains(ptr));
                    unsafe { heap.dealloc(ptr, layout) };
                }
            });
        });

        assert_eq!(heap.pages(), 17);
        assert_eq!(heap.size(), 17 * PAGE_SIZE);
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn test_uninitialized_heap() {
        let ram = ram(4);
        let heap = KernelHeap::empty();
        let layout = Layout::new::<u64>();
        assert!(unsafe { heap.alloc(layout) }.is_null());
        assert_eq!(heap.grow(ram.pmm(), 1), Err(PmmError::InvalidArgument));
        heap.init(ram.pmm(), 1).unwrap();
        assert_eq!(heap.init(ram.pmm(), 1), Err(PmmError::InvalidArgument));
    }
}
