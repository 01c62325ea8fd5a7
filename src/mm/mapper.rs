//! Page Table Mapper
//!
//! A software walker over ARM64 4-level translation tables that implements
//! [`ArchMmu`]. Intermediate tables are allocated on demand from the PMM's
//! kernel-mapped arenas and reached through the linear window.
//!
//! # Safety Properties
//! - Tables are only ever touched through their linear-window address
//! - A `map` call either installs every translation or none of them
//! - Table pages are owned by the mapper and freed when it is dropped

use spin::Mutex;

use super::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use super::paging::{ArchMmu, ArchMmuFlags, MappingError, PageFlags, PageTable, PageTableEntry};
use super::pmm::{PageList, Pmm};

struct Tables {
    root: PhysAddr,
    /// Every table page, root included.
    pages: PageList,
}

/// Translation tables rooted at one L0 table.
pub struct PageTableMmu<'a> {
    pmm: &'a Pmm,
    tables: Mutex<Tables>,
}

impl<'a> PageTableMmu<'a> {
    /// Allocate an empty root table.
    pub fn new(pmm: &'a Pmm) -> Result<Self, MappingError> {
        let mut pages = PageList::new();
        let root = alloc_table(pmm, &mut pages)?;
        log::debug!("mapper: root table at {}", root);
        Ok(Self {
            pmm,
            tables: Mutex::new(Tables { root, pages }),
        })
    }

    /// Physical address of the L0 table, for TTBR0/TTBR1.
    pub fn root(&self) -> PhysAddr {
        self.tables.lock().root
    }

    /// Pages currently holding translation tables.
    pub fn table_pages(&self) -> usize {
        self.tables.lock().pages.len()
    }

    /// Find the L3 entry for `va`, allocating missing tables when `create`.
    fn leaf<'t>(
        &self,
        tables: &'t mut Tables,
        va: VirtAddr,
        create: bool,
    ) -> Result<Option<&'t mut PageTableEntry>, MappingError> {
        let (l0, l1, l2, l3) = va.page_table_indices();
        let mut table_pa = tables.root;
        for index in [l0, l1, l2] {
            // SAFETY: `table_pa` is a table page owned by this mapper.
            let table = unsafe { self.table(table_pa)? };
            let entry = &mut table[index];
            if !entry.is_valid() {
                if !create {
                    return Ok(None);
                }
                let next = alloc_table(self.pmm, &mut tables.pages)?;
                *entry = PageTableEntry::table(next);
            }
            table_pa = entry.addr();
        }
        // SAFETY: as above, the walk only follows table descriptors it wrote.
        let table = unsafe { self.table(table_pa)? };
        Ok(Some(&mut table[l3]))
    }

    /// # Safety
    /// `pa` must be a table page owned by this mapper, and the caller must
    /// hold the table lock.
    unsafe fn table<'t>(&self, pa: PhysAddr) -> Result<&'t mut PageTable, MappingError> {
        let va = self
            .pmm
            .paddr_to_kvaddr(pa)
            .ok_or(MappingError::InvalidAddress)?;
        // SAFETY: the linear window maps `pa` at `va` and the page is a
        // live, page-aligned table.
        Ok(unsafe { &mut *va.as_mut_ptr::<PageTable>() })
    }

    fn clear_range(&self, tables: &mut Tables, vaddr: VirtAddr, count: usize) -> Result<(), MappingError> {
        for i in 0..count {
            let va = vaddr.add(i * PAGE_SIZE);
            if let Some(entry) = self.leaf(tables, va, false)? {
                if entry.is_valid() {
                    entry.clear();
                    invalidate_tlb(va);
                }
            }
        }
        Ok(())
    }
}

impl ArchMmu for PageTableMmu<'_> {
    fn map(
        &self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        count: usize,
        flags: ArchMmuFlags,
    ) -> Result<(), MappingError> {
        if !vaddr.is_aligned() || !paddr.is_aligned() {
            return Err(MappingError::MisalignedAddress);
        }
        let mut tables = self.tables.lock();

        for i in 0..count {
            if let Some(entry) = self.leaf(&mut tables, vaddr.add(i * PAGE_SIZE), false)? {
                if entry.is_valid() {
                    return Err(MappingError::AlreadyMapped);
                }
            }
        }

        let desc = PageFlags::from_arch(flags);
        for i in 0..count {
            let va = vaddr.add(i * PAGE_SIZE);
            let placed = match self.leaf(&mut tables, va, true) {
                Ok(Some(entry)) => {
                    *entry = PageTableEntry::page(paddr.add(i * PAGE_SIZE), desc);
                    Ok(())
                }
                Ok(None) => Err(MappingError::InvalidAddress),
                Err(e) => Err(e),
            };
            if let Err(e) = placed {
                log::warn!("mapper: map of {} pages at {} failed: {}", count, vaddr, e);
                self.clear_range(&mut tables, vaddr, i)?;
                return Err(e);
            }
        }
        Ok(())
    }

    fn unmap(&self, vaddr: VirtAddr, count: usize) -> Result<(), MappingError> {
        if !vaddr.is_aligned() {
            return Err(MappingError::MisalignedAddress);
        }
        let mut tables = self.tables.lock();
        self.clear_range(&mut tables, vaddr, count)
    }

    fn query(&self, vaddr: VirtAddr) -> Option<(PhysAddr, ArchMmuFlags)> {
        let mut tables = self.tables.lock();
        let entry = self.leaf(&mut tables, vaddr.align_down(), false).ok()??;
        entry
            .is_valid()
            .then(|| (entry.addr(), entry.flags().to_arch()))
    }
}

impl Drop for PageTableMmu<'_> {
    fn drop(&mut self) {
        let tables = self.tables.get_mut();
        if let Err(e) = self.pmm.free(&mut tables.pages) {
            log::error!("mapper: failed to release table pages: {}", e);
        }
    }
}

/// Allocate and zero one table page, recording it in `pages`.
fn alloc_table(pmm: &Pmm, pages: &mut PageList) -> Result<PhysAddr, MappingError> {
    let va = pmm
        .alloc_kpages(1, Some(pages))
        .map_err(|_| MappingError::OutOfMemory)?;
    // SAFETY: `va` is a freshly allocated, kernel-mapped page.
    unsafe { va.as_mut_ptr::<u8>().write_bytes(0, PAGE_SIZE) };
    pmm.kvaddr_to_paddr(va).ok_or(MappingError::InvalidAddress)
}

/// Invalidate TLB entries for a virtual address.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
#[inline]
fn invalidate_tlb(virt: VirtAddr) {
    // SAFETY: TLB maintenance has no memory-safety preconditions.
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vaae1is, {addr}",
            "dsb ish",
            "isb",
            addr = in(reg) virt.as_usize() >> 12,
        );
    }
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
#[inline]
fn invalidate_tlb(_virt: VirtAddr) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::arena::ArenaFlags;
    use crate::mm::testing::SimRam;

    fn ram(pages: usize) -> SimRam {
        let ram = SimRam::new(PhysAddr::new(0x4000_0000), pages);
        ram.pmm()
            .add_arena(ram.arena("ram", 0, ArenaFlags::KMAP))
            .unwrap();
        ram
    }

    #[test]
    fn test_map_query_unmap() {
        let ram = ram(16);
        let mmu = PageTableMmu::new(ram.pmm()).unwrap();
        let va = VirtAddr::new(0x8000_0000);
        let uart = PhysAddr::new(0x0900_0000);

        mmu.map(va, uart, 2, ArchMmuFlags::UNCACHED_DEVICE).unwrap();
        assert_eq!(mmu.query(va), Some((uart, ArchMmuFlags::UNCACHED_DEVICE)));
        assert_eq!(
            mmu.query(va.add(PAGE_SIZE + 0x10)),
            Some((PhysAddr::new(0x0900_1000), ArchMmuFlags::UNCACHED_DEVICE))
        );
        // root plus one table per lower level
        assert_eq!(mmu.table_pages(), 4);

        mmu.unmap(va, 2).unwrap();
        assert_eq!(mmu.query(va), None);
        assert_eq!(mmu.query(va.add(PAGE_SIZE)), None);
    }

    #[test]
    fn test_collision_installs_nothing() {
        let ram = ram(16);
        let mmu = PageTableMmu::new(ram.pmm()).unwrap();
        let va = VirtAddr::new(0x8000_0000);
        mmu.map(va.add(PAGE_SIZE), PhysAddr::new(0x4000_0000), 1, ArchMmuFlags::empty())
            .unwrap();

        assert_eq!(
            mmu.map(va, PhysAddr::new(0x5000_0000), 3, ArchMmuFlags::empty()),
            Err(MappingError::AlreadyMapped)
        );
        assert_eq!(mmu.query(va), None);
        assert_eq!(mmu.query(va.add(2 * PAGE_SIZE)), None);
    }

    #[test]
    fn test_crossing_a_table_boundary() {
        let ram = ram(16);
        let mmu = PageTableMmu::new(ram.pmm()).unwrap();
        // last page of one 2 MiB block and first of the next
        let va = VirtAddr::new(0x8020_0000 - PAGE_SIZE);
        mmu.map(va, PhysAddr::new(0x4800_0000), 2, ArchMmuFlags::PERM_RO)
            .unwrap();
        assert_eq!(mmu.table_pages(), 5);
        assert_eq!(
            mmu.query(va.add(PAGE_SIZE)),
            Some((PhysAddr::new(0x4800_1000), ArchMmuFlags::PERM_RO))
        );
    }

    #[test]
    fn test_table_exhaustion_rolls_back() {
        let ram = ram(3);
        let mmu = PageTableMmu::new(ram.pmm()).unwrap();
        let va = VirtAddr::new(0x8000_0000);
        assert_eq!(
            mmu.map(va, PhysAddr::new(0x5000_0000), 1, ArchMmuFlags::empty()),
            Err(MappingError::OutOfMemory)
        );
        assert_eq!(mmu.query(va), None);
    }

    #[test]
    fn test_exhaustion_midway_unmaps_earlier_pages() {
        let ram = ram(4);
        let mmu = PageTableMmu::new(ram.pmm()).unwrap();
        // the second page needs an L3 table of its own and none is left
        let va = VirtAddr::new(0x8000_0000 + 0x20_0000 - PAGE_SIZE);
        assert_eq!(
            mmu.map(va, PhysAddr::new(0x5000_0000), 2, ArchMmuFlags::empty()),
            Err(MappingError::OutOfMemory)
        );
        assert_eq!(mmu.query(va), None);
        assert_eq!(mmu.table_pages(), 4);
        assert_eq!(ram.pmm().free_pages(), 0);
    }

    #[test]
    fn test_drop_returns_table_pages() {
        let ram = ram(8);
        let free = ram.pmm().free_pages();
        {
            let mmu = PageTableMmu::new(ram.pmm()).unwrap();
            mmu.map(VirtAddr::new(0x8000_0000), PhysAddr::new(0x5000_0000), 1, ArchMmuFlags::empty())
                .unwrap();
            assert_eq!(ram.pmm().free_pages(), free - 4);
        }
        assert_eq!(ram.pmm().free_pages(), free);
    }

    #[test]
    fn test_misaligned_is_rejected() {
        let ram = ram(4);
        let mmu = PageTableMmu::new(ram.pmm()).unwrap();
        assert_eq!(
            mmu.map(VirtAddr::new(0x8000_0010), PhysAddr::new(0x5000_0000), 1, ArchMmuFlags::empty()),
            Err(MappingError::MisalignedAddress)
        );
    }
}
