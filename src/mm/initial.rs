//! Boot-time Initial Mappings
//!
//! Platform boot code fills an array of [`MmuInitialMapping`] records before
//! any Rust code runs. Early assembly reads the same bytes by numeric offset,
//! so the layout of the record is part of the boot ABI.
//!
//! # Layout
//! ```text
//!   offset   32-bit   64-bit
//!   phys        0        0
//!   virt        4        8
//!   size        8       16
//!   flags      12       24
//!   name       16       32
//!   total      20       40
//! ```
//!
//! The `MMU_INITIAL_MAPPING_*` constants are what the assembly side uses.
//! The const assertions below fail the build if the struct drifts from them.

use core::ffi::{c_char, CStr};
use core::mem::{offset_of, size_of};
use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;

use super::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use super::paging::{ArchMmu, ArchMmuFlags, MappingError};

#[cfg(target_pointer_width = "32")]
mod abi {
    pub const PHYS_OFFSET: usize = 0;
    pub const VIRT_OFFSET: usize = 4;
    pub const SIZE_OFFSET: usize = 8;
    pub const FLAGS_OFFSET: usize = 12;
    pub const NAME_OFFSET: usize = 16;
    pub const SIZE: usize = 20;
}

#[cfg(target_pointer_width = "64")]
mod abi {
    pub const PHYS_OFFSET: usize = 0;
    pub const VIRT_OFFSET: usize = 8;
    pub const SIZE_OFFSET: usize = 16;
    pub const FLAGS_OFFSET: usize = 24;
    pub const NAME_OFFSET: usize = 32;
    pub const SIZE: usize = 40;
}

/// Byte offset of `phys` as seen by boot assembly.
pub const MMU_INITIAL_MAPPING_PHYS_OFFSET: usize = abi::PHYS_OFFSET;
/// Byte offset of `virt` as seen by boot assembly.
pub const MMU_INITIAL_MAPPING_VIRT_OFFSET: usize = abi::VIRT_OFFSET;
/// Byte offset of `size` as seen by boot assembly.
pub const MMU_INITIAL_MAPPING_SIZE_OFFSET: usize = abi::SIZE_OFFSET;
/// Byte offset of `flags` as seen by boot assembly.
pub const MMU_INITIAL_MAPPING_FLAGS_OFFSET: usize = abi::FLAGS_OFFSET;
/// Byte offset of `name` as seen by boot assembly.
pub const MMU_INITIAL_MAPPING_NAME_OFFSET: usize = abi::NAME_OFFSET;
/// Size of one record as seen by boot assembly.
pub const MMU_INITIAL_MAPPING_SIZE: usize = abi::SIZE;

bitflags! {
    /// Flags carried by an initial mapping record.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InitialMappingFlags: u32 {
        /// Unmapped once early boot is over.
        const TEMPORARY = 0x1;
        /// Mapped without caching.
        const UNCACHED = 0x2;
        /// Device memory (strongly ordered).
        const DEVICE = 0x4;
    }
}

/// One boot-time virtual-to-physical mapping.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MmuInitialMapping {
    phys: PhysAddr,
    virt: VirtAddr,
    size: usize,
    flags: InitialMappingFlags,
    name: *const c_char,
}

const _: () = {
    assert!(offset_of!(MmuInitialMapping, phys) == MMU_INITIAL_MAPPING_PHYS_OFFSET);
    assert!(offset_of!(MmuInitialMapping, virt) == MMU_INITIAL_MAPPING_VIRT_OFFSET);
    assert!(offset_of!(MmuInitialMapping, size) == MMU_INITIAL_MAPPING_SIZE_OFFSET);
    assert!(offset_of!(MmuInitialMapping, flags) == MMU_INITIAL_MAPPING_FLAGS_OFFSET);
    assert!(offset_of!(MmuInitialMapping, name) == MMU_INITIAL_MAPPING_NAME_OFFSET);
    assert!(size_of::<MmuInitialMapping>() == MMU_INITIAL_MAPPING_SIZE);
};

// SAFETY: `name` always points at an immutable, 'static, NUL-terminated
// string (see `MmuInitialMapping::new`), so sharing records across cores
// cannot race.
unsafe impl Sync for MmuInitialMapping {}
// SAFETY: see the `Sync` impl above.
unsafe impl Send for MmuInitialMapping {}

impl MmuInitialMapping {
    /// Build a record. Usable in `static` initializers.
    pub const fn new(
        phys: PhysAddr,
        virt: VirtAddr,
        size: usize,
        flags: InitialMappingFlags,
        name: &'static CStr,
    ) -> Self {
        Self {
            phys,
            virt,
            size,
            flags,
            name: name.as_ptr(),
        }
    }

    /// Physical base.
    #[inline]
    pub const fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Virtual base.
    #[inline]
    pub const fn virt(&self) -> VirtAddr {
        self.virt
    }

    /// Length in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Mapping flags.
    #[inline]
    pub const fn flags(&self) -> InitialMappingFlags {
        self.flags
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        if self.name.is_null() {
            return "";
        }
        // SAFETY: non-null names come from a `&'static CStr` in `new`, or from
        // boot code that follows the same contract.
        let name = unsafe { CStr::from_ptr(self.name) };
        name.to_str().unwrap_or("?")
    }

    /// True for mappings that form part of the kernel's linear window.
    ///
    /// Device and temporary mappings never back kernel allocations.
    #[inline]
    pub fn is_linear(&self) -> bool {
        !self
            .flags
            .intersects(InitialMappingFlags::TEMPORARY | InitialMappingFlags::DEVICE)
    }

    /// Translate a physical address covered by this mapping.
    pub fn phys_to_virt(&self, pa: PhysAddr) -> Option<VirtAddr> {
        let offset = pa.as_usize().checked_sub(self.phys.as_usize())?;
        if offset >= self.size {
            return None;
        }
        self.virt.checked_add(offset)
    }

    /// Translate a virtual address covered by this mapping.
    pub fn virt_to_phys(&self, va: VirtAddr) -> Option<PhysAddr> {
        let offset = va.as_usize().checked_sub(self.virt.as_usize())?;
        if offset >= self.size {
            return None;
        }
        self.phys.checked_add(offset)
    }

    /// Architecture mapping flags matching the record's cache policy.
    pub fn arch_mmu_flags(&self) -> ArchMmuFlags {
        if self.flags.contains(InitialMappingFlags::DEVICE) {
            ArchMmuFlags::UNCACHED_DEVICE | ArchMmuFlags::PERM_NO_EXECUTE
        } else if self.flags.contains(InitialMappingFlags::UNCACHED) {
            ArchMmuFlags::UNCACHED
        } else {
            ArchMmuFlags::empty()
        }
    }
}

impl core::fmt::Debug for MmuInitialMapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmuInitialMapping")
            .field("name", &self.name())
            .field("phys", &self.phys)
            .field("virt", &self.virt)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .finish()
    }
}

/// The table handed over by boot code.
///
/// Installation into the MMU happens at most once.
pub struct InitialMappings {
    entries: &'static [MmuInitialMapping],
    installed: AtomicBool,
}

impl InitialMappings {
    /// Wrap the boot table.
    pub const fn new(entries: &'static [MmuInitialMapping]) -> Self {
        Self {
            entries,
            installed: AtomicBool::new(false),
        }
    }

    /// All records, in boot order.
    #[inline]
    pub fn entries(&self) -> &'static [MmuInitialMapping] {
        self.entries
    }

    /// Kernel virtual address for a physical address inside the linear window.
    pub fn paddr_to_kvaddr(&self, pa: PhysAddr) -> Option<VirtAddr> {
        self.entries
            .iter()
            .filter(|m| m.is_linear())
            .find_map(|m| m.phys_to_virt(pa))
    }

    /// Physical address for a kernel virtual address inside the linear window.
    pub fn kvaddr_to_paddr(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.entries
            .iter()
            .filter(|m| m.is_linear())
            .find_map(|m| m.virt_to_phys(va))
    }

    /// Whether [`install`](Self::install) already ran.
    #[inline]
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Program every record into the MMU.
    ///
    /// Returns the number of pages mapped. A second call fails with
    /// [`MappingError::AlreadyMapped`] without touching the MMU.
    pub fn install(&self, mmu: &dyn ArchMmu) -> Result<usize, MappingError> {
        if self
            .installed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MappingError::AlreadyMapped);
        }

        let mut mapped = 0;
        for m in self.entries {
            if !m.phys.is_aligned() || !m.virt.is_aligned() || m.size % PAGE_SIZE != 0 {
                log::warn!("initial mapping '{}' is not page aligned", m.name());
                return Err(MappingError::MisalignedAddress);
            }
            let count = m.size / PAGE_SIZE;
            mmu.map(m.virt, m.phys, count, m.arch_mmu_flags())?;
            log::info!(
                "initial mapping '{}': {} -> {} ({} pages, {:?})",
                m.name(),
                m.virt,
                m.phys,
                count,
                m.flags
            );
            mapped += count;
        }
        Ok(mapped)
    }

    /// Remove the `TEMPORARY` records from the MMU once early boot is done.
    pub fn retire_temporary(&self, mmu: &dyn ArchMmu) -> Result<usize, MappingError> {
        if !self.is_installed() {
            return Err(MappingError::NotMapped);
        }

        let mut unmapped = 0;
        for m in self
            .entries
            .iter()
            .filter(|m| m.flags.contains(InitialMappingFlags::TEMPORARY))
        {
            let count = m.size / PAGE_SIZE;
            mmu.unmap(m.virt, count)?;
            log::debug!("retired temporary mapping '{}'", m.name());
            unmapped += count;
        }
        Ok(unmapped)
    }
}
