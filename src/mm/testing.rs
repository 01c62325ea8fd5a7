//! Host-side fixtures for the unit tests.
//!
//! `SimRam` backs a range of "physical" addresses with a page-aligned host
//! buffer and publishes it as the kernel linear window, so descriptor
//! arrays, page tables and heap memory all land in real memory.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use std::alloc::{alloc_zeroed, Layout};

use spin::Mutex;

use super::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use super::arena::{Arena, ArenaFlags};
use super::initial::{InitialMappingFlags, MmuInitialMapping};
use super::paging::{ArchMmu, ArchMmuFlags, MappingError};
use super::pmm::Pmm;

pub(crate) struct SimRam {
    phys: PhysAddr,
    pages: usize,
    pmm: &'static Pmm,
}

impl SimRam {
    pub(crate) fn new(phys: PhysAddr, pages: usize) -> Self {
        let size = pages * PAGE_SIZE;
        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        // SAFETY: non-zero size; the buffer is leaked for the rest of the test.
        let host = unsafe { alloc_zeroed(layout) };
        assert!(!host.is_null());

        let table = vec![MmuInitialMapping::new(
            phys,
            VirtAddr::from_ptr(host),
            size,
            InitialMappingFlags::empty(),
            c"sim-ram",
        )]
        .leak();

        let pmm: &'static Pmm = Box::leak(Box::new(Pmm::new()));
        pmm.set_initial_mappings(table).unwrap();
        Self { phys, pages, pmm }
    }

    pub(crate) fn pmm(&self) -> &'static Pmm {
        self.pmm
    }

    /// An arena covering the whole simulated range.
    pub(crate) fn arena(&self, name: &'static str, priority: u32, flags: ArenaFlags) -> &'static Arena {
        Self::leak_arena(Arena::new(name, self.phys, self.pages * PAGE_SIZE, priority, flags))
    }

    pub(crate) fn leak_arena(arena: Arena) -> &'static Arena {
        Box::leak(Box::new(arena))
    }
}

/// An `ArchMmu` that records translations in a map.
pub(crate) struct RecordingMmu {
    map: Mutex<BTreeMap<VirtAddr, (PhysAddr, ArchMmuFlags)>>,
}

impl RecordingMmu {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn lookup(&self, va: VirtAddr) -> Option<(PhysAddr, ArchMmuFlags)> {
        self.map.lock().get(&va).copied()
    }

    pub(crate) fn mapped_pages(&self) -> usize {
        self.map.lock().len()
    }
}

impl ArchMmu for RecordingMmu {
    fn map(
        &self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        count: usize,
        flags: ArchMmuFlags,
    ) -> Result<(), MappingError> {
        let mut map = self.map.lock();
        if (0..count).any(|i| map.contains_key(&vaddr.add(i * PAGE_SIZE))) {
            return Err(MappingError::AlreadyMapped);
        }
        for i in 0..count {
            map.insert(vaddr.add(i * PAGE_SIZE), (paddr.add(i * PAGE_SIZE), flags));
        }
        Ok(())
    }

    fn unmap(&self, vaddr: VirtAddr, count: usize) -> Result<(), MappingError> {
        let mut map = self.map.lock();
        for i in 0..count {
            map.remove(&vaddr.add(i * PAGE_SIZE));
        }
        Ok(())
    }

    fn query(&self, vaddr: VirtAddr) -> Option<(PhysAddr, ArchMmuFlags)> {
        self.lookup(vaddr.align_down())
    }
}
