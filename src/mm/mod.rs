//! Memory management module for PantherOS
//!
//! Provides:
//! - Physical page management over registered arenas ([`Pmm`])
//! - Address spaces and regions ([`Aspace`], [`Vmm`])
//! - A software ARM64 table walker ([`PageTableMmu`])
//! - A PMM-backed kernel heap ([`KernelHeap`])
//!
//! The types work on any instance. The free functions below operate on the
//! kernel's global PMM and kernel address space, and are what the rest of
//! the kernel calls.
//!
//! # Boot order
//! 1. [`pmm_init`] with the boot mapping table
//! 2. [`pmm_add_arena`] for the first `KMAP` bank, whose descriptors come
//!    from the boot pool
//! 3. [`pmm_add_arena`] for every other bank, whose descriptors are carved
//!    out of the `KMAP` bank
//! 4. build the MMU, e.g. [`PageTableMmu::new`] over [`pmm`]
//! 5. [`vmm_init`] with the same table and the MMU
//! 6. everything else, including [`KernelHeap::init`]
//!
//! # Lock order
//! address space → PMM registry → arena. No lock is held across calls into
//! another address space. The kernel heap's own lock is never held across a
//! PMM call.

mod address;
mod arena;
mod aspace;
mod heap;
mod initial;
mod mapper;
mod page;
mod paging;
mod pmm;
mod region;
mod vmm;

#[cfg(test)]
mod testing;

pub use address::{
    is_page_aligned, page_align_up, pages_for, PhysAddr, VirtAddr, PAGE_MASK, PAGE_SHIFT,
    PAGE_SIZE,
};
pub use arena::{Arena, ArenaFlags};
pub use aspace::{Aspace, AspaceFlags, KERNEL_ASPACE_BASE, KERNEL_ASPACE_SIZE};
pub use heap::KernelHeap;
pub use initial::{
    InitialMappingFlags, InitialMappings, MmuInitialMapping, MMU_INITIAL_MAPPING_FLAGS_OFFSET,
    MMU_INITIAL_MAPPING_NAME_OFFSET, MMU_INITIAL_MAPPING_PHYS_OFFSET,
    MMU_INITIAL_MAPPING_SIZE, MMU_INITIAL_MAPPING_SIZE_OFFSET, MMU_INITIAL_MAPPING_VIRT_OFFSET,
};
pub use mapper::PageTableMmu;
pub use page::{PageInfo, VmPageFlags};
pub use paging::{ArchMmu, ArchMmuFlags, MappingError, PageFlags, PageTable, PageTableEntry};
pub use pmm::{PageList, Pmm, PmmError, BOOT_POOL_SIZE, MAX_ARENAS};
pub use region::{RegionFlags, RegionInfo, RegionKind, MAX_NAME_LEN};
pub use vmm::{Vmm, VmmError, VmmFlags};

use spin::Once;

/// The kernel's physical memory manager.
static PMM: Pmm = Pmm::new();

/// The kernel address space.
static KERNEL_ASPACE: Aspace = Aspace::kernel();

/// The MMU every global VMM call programs.
static ARCH_MMU: Once<&'static dyn ArchMmu> = Once::new();

/// The global PMM, for callers that want the method API.
pub fn pmm() -> &'static Pmm {
    &PMM
}

/// The global VMM, once [`vmm_init`] has run.
pub fn vmm() -> Result<Vmm<'static>, VmmError> {
    let mmu = ARCH_MMU.get().ok_or(VmmError::BadState)?;
    Ok(Vmm::new(&PMM, *mmu))
}

/// Publish the boot mapping table to the global PMM.
///
/// Call before the first [`pmm_add_arena`] so that the linear window is
/// known when arenas are registered.
///
/// # Errors
/// `InvalidArgument` if a different table was already published.
pub fn pmm_init(table: &'static [MmuInitialMapping]) -> Result<(), PmmError> {
    PMM.set_initial_mappings(table)?;
    log::info!("pmm: {} boot mappings published", table.len());
    Ok(())
}

/// Bring up virtual memory.
///
/// Registers `mmu` and reserves the permanent boot mappings inside the
/// kernel address space. `table` must be the one given to [`pmm_init`]; it
/// is published here if that step was skipped. Returns the number of
/// reservations made.
///
/// # Errors
/// - `InvalidArgument` if `table` differs from the published one
/// - `BadState` on a second call
pub fn vmm_init(
    table: &'static [MmuInitialMapping],
    mmu: &'static dyn ArchMmu,
) -> Result<usize, VmmError> {
    PMM.set_initial_mappings(table)?;
    let mut first = false;
    ARCH_MMU.call_once(|| {
        first = true;
        mmu
    });
    if !first {
        return Err(VmmError::BadState);
    }

    let reserved = vmm()?.reserve_initial_mappings(&KERNEL_ASPACE)?;
    log::info!(
        "vmm: up, {} boot mappings reserved, {} of {} pages free",
        reserved,
        PMM.free_pages(),
        PMM.total_pages()
    );
    Ok(reserved)
}

/// Register a physical arena with the global PMM.
pub fn pmm_add_arena(arena: &'static Arena) -> Result<(), PmmError> {
    PMM.add_arena(arena)
}

/// Allocate up to `count` pages; returns how many were allocated.
pub fn pmm_alloc_pages(count: usize, list: &mut PageList) -> usize {
    PMM.alloc_pages(count, list)
}

/// Pin the exact physical range `[address, address + count pages)`.
pub fn pmm_alloc_range(address: PhysAddr, count: usize, list: &mut PageList) -> Result<usize, PmmError> {
    PMM.alloc_range(address, count, list)
}

/// Allocate `count` contiguous pages aligned to `1 << alignment_log2`.
pub fn pmm_alloc_contiguous(
    count: usize,
    alignment_log2: u8,
    list: &mut PageList,
) -> Result<PhysAddr, PmmError> {
    PMM.alloc_contiguous(count, alignment_log2, list)
}

/// Return every page in `list`; returns how many were freed.
pub fn pmm_free(list: &mut PageList) -> Result<usize, PmmError> {
    PMM.free(list)
}

/// Allocate `count` kernel-mapped pages and return their kernel address.
pub fn pmm_alloc_kpages(count: usize, list: Option<&mut PageList>) -> Result<VirtAddr, PmmError> {
    PMM.alloc_kpages(count, list)
}

/// Allocate one kernel-mapped page.
pub fn pmm_alloc_kpage() -> Result<VirtAddr, PmmError> {
    PMM.alloc_kpage()
}

/// Translate a physical address in the kernel's linear window.
pub fn paddr_to_kvaddr(pa: PhysAddr) -> Option<VirtAddr> {
    PMM.paddr_to_kvaddr(pa)
}

/// Translate a kernel virtual address in the linear window.
pub fn kvaddr_to_paddr(va: VirtAddr) -> Option<PhysAddr> {
    PMM.kvaddr_to_paddr(va)
}

/// Descriptor snapshot for a managed physical page.
pub fn paddr_to_vm_page(pa: PhysAddr) -> Option<PageInfo> {
    PMM.paddr_to_vm_page(pa)
}

/// The kernel address space.
pub fn vmm_get_kernel_aspace() -> &'static Aspace {
    &KERNEL_ASPACE
}

/// Create an empty address space.
pub fn vmm_create_aspace(
    name: &str,
    base: VirtAddr,
    size: usize,
    flags: AspaceFlags,
) -> Result<Aspace, VmmError> {
    Aspace::new(name, base, size, flags)
}

/// Tear down every region of `aspace` and destroy it.
pub fn vmm_free_aspace(aspace: Aspace) -> Result<(), VmmError> {
    vmm()?.free_aspace(aspace)
}

/// Carve out `[vaddr, vaddr + size)` without backing it.
pub fn vmm_reserve_space(aspace: &Aspace, name: &str, size: usize, vaddr: VirtAddr) -> Result<(), VmmError> {
    vmm()?.reserve_space(aspace, name, size, vaddr)
}

/// Map caller-owned physical memory.
pub fn vmm_alloc_physical(
    aspace: &Aspace,
    name: &str,
    size: usize,
    vaddr: VirtAddr,
    paddr: PhysAddr,
    vmm_flags: VmmFlags,
    arch_mmu_flags: ArchMmuFlags,
) -> Result<VirtAddr, VmmError> {
    vmm()?.alloc_physical(aspace, name, size, vaddr, paddr, vmm_flags, arch_mmu_flags)
}

/// Allocate a region backed by one contiguous physical run.
pub fn vmm_alloc_contiguous(
    aspace: &Aspace,
    name: &str,
    size: usize,
    vaddr: VirtAddr,
    vmm_flags: VmmFlags,
    arch_mmu_flags: ArchMmuFlags,
) -> Result<VirtAddr, VmmError> {
    vmm()?.alloc_contiguous(aspace, name, size, vaddr, vmm_flags, arch_mmu_flags)
}

/// Allocate a region backed by fresh pages.
pub fn vmm_alloc(
    aspace: &Aspace,
    name: &str,
    size: usize,
    vaddr: VirtAddr,
    vmm_flags: VmmFlags,
    arch_mmu_flags: ArchMmuFlags,
) -> Result<VirtAddr, VmmError> {
    vmm()?.alloc(aspace, name, size, vaddr, vmm_flags, arch_mmu_flags)
}

/// Tear down the region containing `vaddr`.
pub fn vmm_free_region(aspace: &Aspace, vaddr: VirtAddr) -> Result<(), VmmError> {
    vmm()?.free_region(aspace, vaddr)
}
