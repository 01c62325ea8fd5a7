//! Virtual Memory Manager
//!
//! Places regions inside address spaces, backs them with physical pages from
//! the [`Pmm`], and programs the [`ArchMmu`].
//!
//! # Placement
//! With [`VmmFlags::VALLOC_SPECIFIC`] the caller's address is used as is and
//! the call fails if any part of it is taken. Otherwise the lowest-addressed
//! hole large enough for the request wins.
//!
//! # Failure atomicity
//! Every constructor either inserts a fully mapped region or leaves the
//! address space, the MMU and the PMM exactly as it found them.
//!
//! # Locking
//! address space lock → PMM registry lock → arena lock.

use alloc::vec::Vec;

use bitflags::bitflags;

use super::address::{is_page_aligned, PhysAddr, VirtAddr, PAGE_SHIFT, PAGE_SIZE};
use super::aspace::{Aspace, RegionTree};
use super::initial::InitialMappingFlags;
use super::paging::{ArchMmu, ArchMmuFlags, MappingError};
use super::pmm::{PageList, Pmm, PmmError};
use super::region::{Region, RegionFlags, RegionKind};

bitflags! {
    /// Placement flags for the VMM constructors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VmmFlags: u32 {
        /// Use the caller's virtual address instead of searching for a hole.
        const VALLOC_SPECIFIC = 0x1;
    }
}

/// Error type for virtual memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// Zero or misaligned size or address.
    InvalidArgument,
    /// The range lies outside the address space.
    OutOfRange,
    /// The range intersects an existing region.
    AlreadyMapped,
    /// No physical pages, or no virtual hole large enough.
    OutOfMemory,
    /// No region or arena owns the address.
    NotFound,
    /// A physical page was freed twice.
    DoubleFree,
    /// The VMM has not been initialized.
    BadState,
    /// The architecture layer refused the mapping.
    Mmu(MappingError),
}

impl core::fmt::Display for VmmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::OutOfRange => write!(f, "range outside address space"),
            Self::AlreadyMapped => write!(f, "range overlaps an existing region"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::NotFound => write!(f, "no such region"),
            Self::DoubleFree => write!(f, "double free of physical page"),
            Self::BadState => write!(f, "virtual memory not initialized"),
            Self::Mmu(e) => write!(f, "mmu: {}", e),
        }
    }
}

impl From<PmmError> for VmmError {
    fn from(e: PmmError) -> Self {
        match e {
            PmmError::InvalidArgument => Self::InvalidArgument,
            PmmError::Overlap | PmmError::AlreadyAllocated => Self::AlreadyMapped,
            PmmError::OutOfMemory => Self::OutOfMemory,
            PmmError::NotFound => Self::NotFound,
            PmmError::DoubleFree => Self::DoubleFree,
        }
    }
}

impl From<MappingError> for VmmError {
    fn from(e: MappingError) -> Self {
        match e {
            MappingError::OutOfMemory => Self::OutOfMemory,
            MappingError::AlreadyMapped => Self::AlreadyMapped,
            other => Self::Mmu(other),
        }
    }
}

/// The virtual memory manager: an address-space-agnostic view of one PMM
/// and one MMU.
#[derive(Clone, Copy)]
pub struct Vmm<'a> {
    pmm: &'a Pmm,
    mmu: &'a dyn ArchMmu,
}

impl<'a> Vmm<'a> {
    /// Bind the VMM to its physical allocator and MMU.
    pub const fn new(pmm: &'a Pmm, mmu: &'a dyn ArchMmu) -> Self {
        Self { pmm, mmu }
    }

    /// The physical allocator backing anonymous regions.
    #[inline]
    pub fn pmm(&self) -> &'a Pmm {
        self.pmm
    }

    /// The MMU programmed by this VMM.
    #[inline]
    pub fn mmu(&self) -> &'a dyn ArchMmu {
        self.mmu
    }

    /// Carve `[vaddr, vaddr + size)` out of `aspace` without backing it.
    ///
    /// Any translation already present at `vaddr` (typically a boot
    /// mapping) is left alone and its flags are recorded on the region.
    pub fn reserve_space(
        &self,
        aspace: &Aspace,
        name: &str,
        size: usize,
        vaddr: VirtAddr,
    ) -> Result<(), VmmError> {
        check_size(size)?;
        if !vaddr.is_aligned() {
            return Err(VmmError::InvalidArgument);
        }

        let mut tree = aspace.lock();
        let base = claim(aspace, &tree, size, vaddr, VmmFlags::VALLOC_SPECIFIC)?;

        let arch_mmu_flags = self
            .mmu
            .query(base)
            .map(|(_, flags)| flags)
            .unwrap_or_default();
        tree.insert(Region::new(name, RegionFlags::RESERVED, arch_mmu_flags, base, size));

        log::debug!("vmm: reserved '{}' [{}, +{:#x}) in '{}'", name, base, size, aspace.name());
        Ok(())
    }

    /// Map caller-owned physical memory at a new region.
    ///
    /// The PMM is not consulted: the pages are not its to hand out, and they
    /// are not returned to it on teardown.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc_physical(
        &self,
        aspace: &Aspace,
        name: &str,
        size: usize,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        vmm_flags: VmmFlags,
        arch_mmu_flags: ArchMmuFlags,
    ) -> Result<VirtAddr, VmmError> {
        check_size(size)?;
        if !paddr.is_aligned() || paddr.checked_add(size - 1).is_none() {
            return Err(VmmError::InvalidArgument);
        }
        check_hint(vaddr, vmm_flags)?;

        let mut tree = aspace.lock();
        let base = claim(aspace, &tree, size, vaddr, vmm_flags)?;

        self.mmu.map(base, paddr, size >> PAGE_SHIFT, arch_mmu_flags)?;

        let mut region = Region::new(name, RegionFlags::PHYSICAL, arch_mmu_flags, base, size);
        region.phys = Some(paddr);
        tree.insert(region);

        log::debug!(
            "vmm: '{}' [{}, +{:#x}) -> {} in '{}'",
            name,
            base,
            size,
            paddr,
            aspace.name()
        );
        Ok(base)
    }

    /// Allocate a region backed by one physically contiguous run.
    pub fn alloc_contiguous(
        &self,
        aspace: &Aspace,
        name: &str,
        size: usize,
        vaddr: VirtAddr,
        vmm_flags: VmmFlags,
        arch_mmu_flags: ArchMmuFlags,
    ) -> Result<VirtAddr, VmmError> {
        check_size(size)?;
        check_hint(vaddr, vmm_flags)?;
        let count = size >> PAGE_SHIFT;

        let mut tree = aspace.lock();
        let base = claim(aspace, &tree, size, vaddr, vmm_flags)?;

        let mut pages = PageList::new();
        let paddr = self
            .pmm
            .alloc_contiguous(count, PAGE_SHIFT as u8, &mut pages)?;

        if let Err(e) = self.mmu.map(base, paddr, count, arch_mmu_flags) {
            self.release(&mut pages);
            return Err(e.into());
        }

        let mut region = Region::new(name, RegionFlags::empty(), arch_mmu_flags, base, size);
        region.phys = Some(paddr);
        region.pages = pages;
        tree.insert(region);

        log::debug!(
            "vmm: '{}' [{}, +{:#x}) contiguous at {} in '{}'",
            name,
            base,
            size,
            paddr,
            aspace.name()
        );
        Ok(base)
    }

    /// Allocate a region backed by freshly allocated pages.
    ///
    /// The pages need not be contiguous. If the PMM cannot supply all of
    /// them the call fails and every page it did supply goes back.
    pub fn alloc(
        &self,
        aspace: &Aspace,
        name: &str,
        size: usize,
        vaddr: VirtAddr,
        vmm_flags: VmmFlags,
        arch_mmu_flags: ArchMmuFlags,
    ) -> Result<VirtAddr, VmmError> {
        check_size(size)?;
        check_hint(vaddr, vmm_flags)?;
        let count = size >> PAGE_SHIFT;

        let mut tree = aspace.lock();
        let base = claim(aspace, &tree, size, vaddr, vmm_flags)?;

        let mut pages = PageList::new();
        let got = self.pmm.alloc_pages(count, &mut pages);
        if got < count {
            log::warn!("vmm: '{}' needs {} pages, pmm had {}", name, count, got);
            self.release(&mut pages);
            return Err(VmmError::OutOfMemory);
        }

        let failed = pages
            .iter()
            .enumerate()
            .find_map(|(i, pa)| {
                self.mmu
                    .map(base.add(i * PAGE_SIZE), pa, 1, arch_mmu_flags)
                    .err()
                    .map(|e| (i, e))
            });
        if let Some((mapped, e)) = failed {
            if let Err(undo) = self.mmu.unmap(base, mapped) {
                log::error!("vmm: rollback of '{}' at {} failed: {}", name, base, undo);
            }
            self.release(&mut pages);
            return Err(e.into());
        }

        let mut region = Region::new(name, RegionFlags::empty(), arch_mmu_flags, base, size);
        region.pages = pages;
        tree.insert(region);

        log::debug!("vmm: '{}' [{}, +{:#x}) in '{}'", name, base, size, aspace.name());
        Ok(base)
    }

    /// Tear down the region containing `vaddr`.
    ///
    /// Mapped regions are unmapped; anonymous regions also return their
    /// pages to the PMM. Reserved regions are simply forgotten.
    pub fn free_region(&self, aspace: &Aspace, vaddr: VirtAddr) -> Result<(), VmmError> {
        let mut tree = aspace.lock();
        let region = tree.remove_containing(vaddr).ok_or(VmmError::NotFound)?;
        self.teardown(&mut tree, region)
    }

    /// Tear down every region of `aspace` and drop it.
    ///
    /// Teardown continues past failures; the first error is returned.
    pub fn free_aspace(&self, aspace: Aspace) -> Result<(), VmmError> {
        let mut tree = aspace.lock();
        let regions: Vec<Region> = tree.drain().collect();
        let mut first_err = None;
        for region in regions {
            if let Err(e) = self.teardown(&mut tree, region) {
                first_err.get_or_insert(e);
            }
        }
        drop(tree);

        log::info!("vmm: address space '{}' destroyed", aspace.name());
        first_err.map_or(Ok(()), Err)
    }

    /// Reserve the parts of the kernel's boot mappings that fall inside
    /// `aspace`, so nothing is ever placed over them.
    ///
    /// A mapping that straddles the bounds of `aspace` has only its overlap
    /// reserved. Temporary mappings are skipped. Returns the number of
    /// reservations.
    pub fn reserve_initial_mappings(&self, aspace: &Aspace) -> Result<usize, VmmError> {
        let table = self.pmm.initial_mappings().ok_or(VmmError::BadState)?;

        let mut reserved = 0;
        for m in table
            .entries()
            .iter()
            .filter(|m| !m.flags().contains(InitialMappingFlags::TEMPORARY))
        {
            if m.size() == 0 {
                continue;
            }
            let m_last = m.virt().as_usize().saturating_add(m.size() - 1);
            let start = m.virt().as_usize().max(aspace.base().as_usize());
            let last = m_last.min(aspace.last().as_usize());
            if start > last {
                continue;
            }
            let size = last - start + 1;
            if start != m.virt().as_usize() || size != m.size() {
                log::info!("vmm: boot mapping '{}' only partly inside '{}'", m.name(), aspace.name());
            }
            match self.reserve_space(aspace, m.name(), size, VirtAddr::new(start)) {
                Ok(()) => reserved += 1,
                Err(VmmError::AlreadyMapped) => {
                    log::warn!("vmm: boot mapping '{}' overlaps a region", m.name());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reserved)
    }

    fn teardown(&self, tree: &mut RegionTree, mut region: Region) -> Result<(), VmmError> {
        let count = region.size >> PAGE_SHIFT;
        match region.kind() {
            RegionKind::Reserved => {}
            RegionKind::Physical => {
                if let Err(e) = self.mmu.unmap(region.base, count) {
                    tree.insert(region);
                    return Err(e.into());
                }
            }
            RegionKind::Anonymous => {
                if let Err(e) = self.mmu.unmap(region.base, count) {
                    tree.insert(region);
                    return Err(e.into());
                }
                self.pmm.free(&mut region.pages)?;
            }
        }
        log::debug!("vmm: freed '{}' at {}", region.name, region.base);
        Ok(())
    }

    fn release(&self, pages: &mut PageList) {
        if let Err(e) = self.pmm.free(pages) {
            log::error!("vmm: rollback could not free pages: {}", e);
        }
    }
}

fn check_size(size: usize) -> Result<(), VmmError> {
    if size == 0 || !is_page_aligned(size) {
        return Err(VmmError::InvalidArgument);
    }
    Ok(())
}

fn check_hint(vaddr: VirtAddr, vmm_flags: VmmFlags) -> Result<(), VmmError> {
    if vmm_flags.contains(VmmFlags::VALLOC_SPECIFIC) && !vaddr.is_aligned() {
        return Err(VmmError::InvalidArgument);
    }
    Ok(())
}

/// Pick the base address for a new region. Does not modify the tree.
fn claim(
    aspace: &Aspace,
    tree: &RegionTree,
    size: usize,
    vaddr: VirtAddr,
    vmm_flags: VmmFlags,
) -> Result<VirtAddr, VmmError> {
    if vmm_flags.contains(VmmFlags::VALLOC_SPECIFIC) {
        if !aspace.contains_range(vaddr, size) {
            return Err(VmmError::OutOfRange);
        }
        if !tree.is_free(vaddr, size) {
            return Err(VmmError::AlreadyMapped);
        }
        return Ok(vaddr);
    }

    if size > aspace.size() {
        return Err(VmmError::OutOfMemory);
    }
    tree.find_gap(aspace.base(), aspace.last(), size)
        .ok_or(VmmError::OutOfMemory)
}
