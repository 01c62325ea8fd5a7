//! Runs `KernelHeap` as the process-wide allocator.
//!
//! Allocations made on the test thread while it is routed go to the kernel
//! heap, so `init` and `grow` must get by without allocating and without
//! holding the heap lock while they talk to the PMM. A slip shows up as an
//! abort or a hang rather than a failed assertion.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

use pantheros_mm::mm::*;

static KHEAP: KernelHeap = KernelHeap::empty();

thread_local! {
    static ROUTED: Cell<bool> = const { Cell::new(false) };
}

struct Router;

fn routed() -> bool {
    ROUTED.try_with(Cell::get).unwrap_or(false)
}

unsafe impl GlobalAlloc for Router {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if routed() {
            unsafe { KHEAP.alloc(layout) }
        } else {
            unsafe { System.alloc(layout) }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if KHEAP.contains(ptr) {
            unsafe { KHEAP.dealloc(ptr, layout) }
        } else {
            unsafe { System.dealloc(ptr, layout) }
        }
    }
}

#[global_allocator]
static ALLOCATOR: Router = Router;

const RAM_BASE: usize = 0x4000_0000;
const RAM_PAGES: usize = 32;

static RAM: Arena = Arena::new(
    "ram",
    PhysAddr::new(RAM_BASE),
    RAM_PAGES * PAGE_SIZE,
    0,
    ArenaFlags::KMAP,
);

fn boot_pmm() -> &'static Pmm {
    let layout = Layout::from_size_align(RAM_PAGES * PAGE_SIZE, PAGE_SIZE).unwrap();
    let host = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!host.is_null());

    let table: &'static [MmuInitialMapping] = vec![MmuInitialMapping::new(
        PhysAddr::new(RAM_BASE),
        VirtAddr::from_ptr(host),
        RAM_PAGES * PAGE_SIZE,
        InitialMappingFlags::empty(),
        c"ram",
    )]
    .leak();

    let pmm: &'static Pmm = Box::leak(Box::new(Pmm::new()));
    pmm.set_initial_mappings(table).unwrap();
    pmm.add_arena(&RAM).unwrap();
    pmm
}

#[test]
fn test_kernel_heap_as_global_allocator() {
    let pmm = boot_pmm();
    let free = pmm.free_pages();

    ROUTED.with(|r| r.set(true));
    let init = KHEAP.init(pmm, 1);
    let small: Vec<u64> = (0..16).collect();
    let small_in_heap = KHEAP.contains(small.as_ptr().cast());
    let grown = KHEAP.grow(pmm, 3);
    let large = vec![0xA5u8; 2 * PAGE_SIZE];
    let large_in_heap = KHEAP.contains(large.as_ptr());
    let sum: u64 = small.iter().sum();
    drop(large);
    drop(small);
    ROUTED.with(|r| r.set(false));

    assert_eq!(init, Ok(()));
    assert!(small_in_heap);
    assert_eq!(grown, Ok(()));
    assert!(large_in_heap);
    assert_eq!(sum, 120);
    assert_eq!(KHEAP.pages(), 4);
    assert_eq!(KHEAP.size(), 4 * PAGE_SIZE);
    assert_eq!(KHEAP.used(), 0);
    assert_eq!(pmm.free_pages(), free - 4);
    assert_eq!(KHEAP.start().and_then(|va| pmm.kvaddr_to_paddr(va)), Some(PhysAddr::new(RAM_BASE)));
}
