//! Architecture MMU Interface and ARM64 Descriptor Format
//!
//! The VMM never touches translation tables directly. It talks to an
//! [`ArchMmu`] implementation given `(virtual, physical, count, flags)`
//! tuples. This module defines that seam, the architecture-neutral
//! [`ArchMmuFlags`], and the ARM64 VMSA descriptor types used by the
//! software table walker in [`super::mapper`].
//!
//! # Page Table Structure (4KB granule)
//! - L0 (PGD): 512 entries, each covers 512GB
//! - L1 (PUD): 512 entries, each covers 1GB
//! - L2 (PMD): 512 entries, each covers 2MB
//! - L3 (PTE): 512 entries, each covers 4KB

use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use super::address::{PhysAddr, VirtAddr, ENTRIES_PER_TABLE};

bitflags! {
    /// Cache policy and permissions requested for a mapping.
    ///
    /// The empty set means cached, kernel read/write, executable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ArchMmuFlags: u32 {
        /// Normal memory, non-cacheable.
        const UNCACHED = 1 << 0;
        /// Device memory.
        const UNCACHED_DEVICE = 1 << 1;
        /// Accessible from EL0.
        const PERM_USER = 1 << 2;
        /// Read-only.
        const PERM_RO = 1 << 3;
        /// Never executable.
        const PERM_NO_EXECUTE = 1 << 4;
    }
}

/// Hooks into the architecture's translation hardware.
///
/// Implementations own the table format and TLB maintenance. All methods
/// operate on whole pages; `count` is a page count.
pub trait ArchMmu: Send + Sync {
    /// Install `count` translations starting at `vaddr` -> `paddr`.
    fn map(
        &self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        count: usize,
        flags: ArchMmuFlags,
    ) -> Result<(), MappingError>;

    /// Remove `count` translations starting at `vaddr`.
    ///
    /// Unmapping a page that is not mapped is not an error.
    fn unmap(&self, vaddr: VirtAddr, count: usize) -> Result<(), MappingError>;

    /// Look up the translation for one page.
    fn query(&self, vaddr: VirtAddr) -> Option<(PhysAddr, ArchMmuFlags)>;
}

/// Page table entry flags for ARM64.
///
/// The layout follows the ARMv8-A architecture reference manual.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageFlags(u64);

impl PageFlags {
    /// Table descriptor (L0/L1/L2) - points to next level table.
    pub const TABLE: Self = Self(0b11);
    /// Page descriptor (L3 only) - maps a 4KB page.
    pub const PAGE: Self = Self(0b11);

    /// MAIR index 0: Normal memory
    pub const ATTR_NORMAL: Self = Self(0 << 2);
    /// MAIR index 1: Device memory
    pub const ATTR_DEVICE: Self = Self(1 << 2);
    /// MAIR index 2: Non-cacheable
    pub const ATTR_NC: Self = Self(2 << 2);
    const ATTR_MASK: u64 = 0b111 << 2;

    /// EL1 R/W, EL0 no access
    pub const AP_RW_EL1: Self = Self(0b00 << 6);
    /// EL1 R/W, EL0 R/W
    pub const AP_RW_ALL: Self = Self(0b01 << 6);
    /// EL1 R/O, EL0 no access
    pub const AP_RO_EL1: Self = Self(0b10 << 6);
    /// EL1 R/O, EL0 R/O
    pub const AP_RO_ALL: Self = Self(0b11 << 6);
    const AP_USER: u64 = 0b01 << 6;
    const AP_RO: u64 = 0b10 << 6;

    /// Inner shareable
    pub const SH_INNER: Self = Self(0b11 << 8);

    /// Access Flag [10]
    pub const AF: Self = Self(1 << 10);

    /// Not Global [11] - use ASID for TLB matching.
    pub const NG: Self = Self(1 << 11);

    /// Privileged Execute Never [53]
    pub const PXN: Self = Self(1 << 53);

    /// User Execute Never [54]
    pub const UXN: Self = Self(1 << 54);

    /// Table entry pointing to next level.
    pub const TABLE_ENTRY: Self = Self(Self::TABLE.0 | Self::AF.0);

    /// Create empty flags (invalid entry).
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Get the raw bits.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Combine two flag sets.
    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Check if flags contain all of another set.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Leaf descriptor bits for an architecture-neutral request.
    pub const fn from_arch(flags: ArchMmuFlags) -> Self {
        let mut bits = Self::PAGE.0 | Self::AF.0;

        bits |= if flags.contains(ArchMmuFlags::UNCACHED_DEVICE) {
            Self::ATTR_DEVICE.0
        } else if flags.contains(ArchMmuFlags::UNCACHED) {
            Self::ATTR_NC.0 | Self::SH_INNER.0
        } else {
            Self::ATTR_NORMAL.0 | Self::SH_INNER.0
        };

        bits |= match (
            flags.contains(ArchMmuFlags::PERM_USER),
            flags.contains(ArchMmuFlags::PERM_RO),
        ) {
            (false, false) => Self::AP_RW_EL1.0,
            (true, false) => Self::AP_RW_ALL.0 | Self::NG.0,
            (false, true) => Self::AP_RO_EL1.0,
            (true, true) => Self::AP_RO_ALL.0 | Self::NG.0,
        };

        if flags.contains(ArchMmuFlags::PERM_NO_EXECUTE) {
            bits |= Self::PXN.0 | Self::UXN.0;
        } else if flags.contains(ArchMmuFlags::PERM_USER) {
            // user code is never executable at EL1
            bits |= Self::PXN.0;
        } else {
            bits |= Self::UXN.0;
        }

        Self(bits)
    }

    /// Recover the architecture-neutral flags from leaf descriptor bits.
    pub const fn to_arch(self) -> ArchMmuFlags {
        let mut flags = ArchMmuFlags::empty();
        let attr = self.0 & Self::ATTR_MASK;
        if attr == Self::ATTR_DEVICE.0 {
            flags = flags.union(ArchMmuFlags::UNCACHED_DEVICE);
        } else if attr == Self::ATTR_NC.0 {
            flags = flags.union(ArchMmuFlags::UNCACHED);
        }
        if self.0 & Self::AP_USER != 0 {
            flags = flags.union(ArchMmuFlags::PERM_USER);
        }
        if self.0 & Self::AP_RO != 0 {
            flags = flags.union(ArchMmuFlags::PERM_RO);
        }
        if self.0 & Self::PXN.0 != 0 && self.0 & Self::UXN.0 != 0 {
            flags = flags.union(ArchMmuFlags::PERM_NO_EXECUTE);
        }
        flags
    }
}

impl core::fmt::Debug for PageFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PageFlags({:#018x})", self.0)
    }
}

/// A single page table entry.
///
/// This is a 64-bit descriptor that either points to a next-level table
/// or maps a physical page to a virtual address.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Address mask for page table entries (bits [47:12]).
    const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

    /// Create an invalid (empty) entry.
    #[inline]
    pub const fn invalid() -> Self {
        Self(0)
    }

    /// Create a table entry pointing to the next level page table.
    #[inline]
    pub const fn table(next_table_phys: PhysAddr) -> Self {
        debug_assert!(next_table_phys.is_aligned());
        Self((next_table_phys.as_u64() & Self::ADDR_MASK) | PageFlags::TABLE_ENTRY.bits())
    }

    /// Create a page entry mapping a physical frame.
    #[inline]
    pub const fn page(phys: PhysAddr, flags: PageFlags) -> Self {
        debug_assert!(phys.is_aligned());
        Self((phys.as_u64() & Self::ADDR_MASK) | flags.bits())
    }

    /// Check if the entry is valid (present).
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 & 0b01 != 0
    }

    /// Get the physical address from this entry.
    #[inline]
    pub const fn addr(self) -> PhysAddr {
        PhysAddr::new((self.0 & Self::ADDR_MASK) as usize)
    }

    /// Get the flags from this entry.
    #[inline]
    pub const fn flags(self) -> PageFlags {
        PageFlags(self.0 & !Self::ADDR_MASK)
    }

    /// Clear the entry (make invalid).
    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_valid() {
            write!(f, "PTE(addr={}, flags={:?})", self.addr(), self.flags())
        } else {
            write!(f, "PTE(invalid)")
        }
    }
}

/// A page table (one level of the 4-level hierarchy).
///
/// Each page table is 4KB and contains 512 entries.
/// The table must be 4KB aligned in physical memory.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Create a new empty page table (all entries invalid).
    pub const fn new() -> Self {
        const INVALID: PageTableEntry = PageTableEntry::invalid();
        Self {
            entries: [INVALID; ENTRIES_PER_TABLE],
        }
    }

    /// Iterate over all valid entries with their indices.
    pub fn iter_valid(&self) -> impl Iterator<Item = (usize, &PageTableEntry)> {
        self.entries.iter().enumerate().filter(|(_, e)| e.is_valid())
    }

    /// True when no entry is valid.
    pub fn is_empty(&self) -> bool {
        self.iter_valid().next().is_none()
    }

    /// Clear all entries.
    pub fn clear(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.clear();
        }
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Error type for page mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// The virtual address is already mapped.
    AlreadyMapped,
    /// The virtual address is not mapped.
    NotMapped,
    /// No physical frames available for page tables.
    OutOfMemory,
    /// The address is not properly aligned.
    MisalignedAddress,
    /// The address cannot be described by this table format.
    InvalidAddress,
}

impl core::fmt::Display for MappingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyMapped => write!(f, "virtual address already mapped"),
            Self::NotMapped => write!(f, "virtual address not mapped"),
            Self::OutOfMemory => write!(f, "out of memory for page tables"),
            Self::MisalignedAddress => write!(f, "address not properly aligned"),
            Self::InvalidAddress => write!(f, "address outside translatable range"),
        }
    }
}
