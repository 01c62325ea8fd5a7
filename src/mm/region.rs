//! Virtual Regions
//!
//! A region is a named, page-aligned span of one address space. Its kind is
//! carried in [`RegionFlags`]:
//!
//! | kind      | flags      | backing                         | on teardown          |
//! |-----------|------------|---------------------------------|----------------------|
//! | reserved  | `RESERVED` | none                            | forgotten            |
//! | physical  | `PHYSICAL` | caller's physical range         | unmapped             |
//! | anonymous | (none)     | pages owned by the region (PMM) | unmapped, pages freed |

use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;

use super::address::{PhysAddr, VirtAddr};
use super::paging::ArchMmuFlags;
use super::pmm::PageList;

/// Longest region or address-space name kept, in bytes.
pub const MAX_NAME_LEN: usize = 31;

bitflags! {
    /// Region kind bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegionFlags: u32 {
        /// Address space carved out, nothing mapped by the VMM.
        const RESERVED = 0x1;
        /// Maps physical memory the PMM does not own.
        const PHYSICAL = 0x2;
    }
}

/// What backs a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// No backing.
    Reserved,
    /// Caller-supplied physical memory.
    Physical,
    /// Pages allocated from the PMM and owned by the region.
    Anonymous,
}

impl From<RegionFlags> for RegionKind {
    fn from(flags: RegionFlags) -> Self {
        if flags.contains(RegionFlags::RESERVED) {
            Self::Reserved
        } else if flags.contains(RegionFlags::PHYSICAL) {
            Self::Physical
        } else {
            Self::Anonymous
        }
    }
}

/// Truncate `name` to [`MAX_NAME_LEN`] bytes on a character boundary.
pub(crate) fn clamp_name(name: &str) -> String {
    let mut end = name.len().min(MAX_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&name[..end])
}

/// A live region inside an address space.
#[derive(Debug)]
pub(crate) struct Region {
    pub(crate) name: String,
    pub(crate) flags: RegionFlags,
    pub(crate) arch_mmu_flags: ArchMmuFlags,
    pub(crate) base: VirtAddr,
    pub(crate) size: usize,
    /// Start of the backing range for physical and contiguous regions.
    pub(crate) phys: Option<PhysAddr>,
    /// Pages owned by an anonymous region.
    pub(crate) pages: PageList,
}

impl Region {
    pub(crate) fn new(
        name: &str,
        flags: RegionFlags,
        arch_mmu_flags: ArchMmuFlags,
        base: VirtAddr,
        size: usize,
    ) -> Self {
        Self {
            name: clamp_name(name),
            flags,
            arch_mmu_flags,
            base,
            size,
            phys: None,
            pages: PageList::new(),
        }
    }

    #[inline]
    pub(crate) fn kind(&self) -> RegionKind {
        self.flags.into()
    }

    /// Last byte covered by the region.
    #[inline]
    pub(crate) fn last(&self) -> VirtAddr {
        self.base.add(self.size - 1)
    }

    #[inline]
    pub(crate) fn contains(&self, va: VirtAddr) -> bool {
        va >= self.base && va <= self.last()
    }

    pub(crate) fn info(&self) -> RegionInfo {
        RegionInfo {
            name: self.name.clone(),
            kind: self.kind(),
            arch_mmu_flags: self.arch_mmu_flags,
            base: self.base,
            size: self.size,
            phys: self.phys,
            pages: self.pages.iter().collect(),
        }
    }
}

/// Snapshot of a region, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    /// Region name.
    pub name: String,
    /// Backing kind.
    pub kind: RegionKind,
    /// Flags the region was mapped with.
    pub arch_mmu_flags: ArchMmuFlags,
    /// First virtual address.
    pub base: VirtAddr,
    /// Length in bytes.
    pub size: usize,
    /// Start of the backing physical range, when it is a single range.
    pub phys: Option<PhysAddr>,
    /// Pages owned by the region (anonymous regions only).
    pub pages: Vec<PhysAddr>,
}

impl RegionInfo {
    /// One past the last byte, saturating at the top of the address space.
    pub fn end(&self) -> usize {
        self.base.as_usize().saturating_add(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_flags() {
        assert_eq!(RegionKind::from(RegionFlags::RESERVED), RegionKind::Reserved);
        assert_eq!(RegionKind::from(RegionFlags::PHYSICAL), RegionKind::Physical);
        assert_eq!(RegionKind::from(RegionFlags::empty()), RegionKind::Anonymous);
    }

    #[test]
    fn test_names_are_clamped_on_char_boundary() {
        assert_eq!(clamp_name("heap"), "heap");
        let long = "a".repeat(40);
        assert_eq!(clamp_name(&long).len(), MAX_NAME_LEN);
        let wide = "é".repeat(20);
        let clamped = clamp_name(&wide);
        assert!(clamped.len() <= MAX_NAME_LEN);
        assert_eq!(clamped.chars().count(), 15);
    }
}
