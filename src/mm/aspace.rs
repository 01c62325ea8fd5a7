//! Address Spaces
//!
//! An address space is a named virtual range plus the set of regions
//! claimed inside it. Unclaimed gaps are implicit and allocatable.
//!
//! # Design
//! - Regions live in a `BTreeMap` keyed by base address, so iteration is in
//!   address order and neighbour lookups are logarithmic
//! - Ranges are handled by their last byte rather than their end, so an
//!   address space may run up to the very top of the address space
//! - Each address space has its own spinlock; unrelated address spaces
//!   never contend
//!
//! The kernel address space is a `static` built by [`Aspace::kernel`].

use alloc::borrow::Cow;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use super::address::{is_page_aligned, VirtAddr};
use super::region::{clamp_name, Region, RegionInfo};
use super::vmm::VmmError;

/// Base of the kernel address space.
pub const KERNEL_ASPACE_BASE: usize = 0x8000_0000;
/// Size of the kernel address space.
pub const KERNEL_ASPACE_SIZE: usize = 0x8000_0000;

bitflags! {
    /// Address space attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AspaceFlags: u32 {
        /// The kernel's own address space.
        const KERNEL = 0x1;
    }
}

/// A virtual address space.
pub struct Aspace {
    name: Cow<'static, str>,
    flags: AspaceFlags,
    base: VirtAddr,
    size: usize,
    regions: Mutex<RegionTree>,
}

impl Aspace {
    /// The kernel address space. Usable in `static` initializers.
    pub const fn kernel() -> Self {
        Self {
            name: Cow::Borrowed("kernel"),
            flags: AspaceFlags::KERNEL,
            base: VirtAddr::new(KERNEL_ASPACE_BASE),
            size: KERNEL_ASPACE_SIZE,
            regions: Mutex::new(RegionTree::new()),
        }
    }

    /// Create an empty address space covering `[base, base + size)`.
    ///
    /// # Errors
    /// `InvalidArgument` if `base` or `size` is misaligned, `size` is zero,
    /// or the range wraps past the top of the address space.
    pub fn new(name: &str, base: VirtAddr, size: usize, flags: AspaceFlags) -> Result<Self, VmmError> {
        if size == 0
            || !base.is_aligned()
            || !is_page_aligned(size)
            || base.as_usize().checked_add(size - 1).is_none()
        {
            return Err(VmmError::InvalidArgument);
        }

        log::info!("vmm: new address space '{}' [{}, +{:#x})", name, base, size);
        Ok(Self {
            name: Cow::Owned(clamp_name(name)),
            flags,
            base,
            size,
            regions: Mutex::new(RegionTree::new()),
        })
    }

    /// Address space name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address space flags.
    #[inline]
    pub fn flags(&self) -> AspaceFlags {
        self.flags
    }

    /// First address of the space.
    #[inline]
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// Length in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Last address of the space.
    #[inline]
    pub fn last(&self) -> VirtAddr {
        self.base.add(self.size - 1)
    }

    /// Check if `[vaddr, vaddr + size)` lies inside the space.
    pub fn contains_range(&self, vaddr: VirtAddr, size: usize) -> bool {
        size != 0
            && vaddr >= self.base
            && vaddr <= self.last()
            && size - 1 <= self.last().as_usize() - vaddr.as_usize()
    }

    /// Snapshots of every region, in address order.
    pub fn regions(&self) -> Vec<RegionInfo> {
        self.regions.lock().iter().map(Region::info).collect()
    }

    /// Number of regions.
    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    /// Snapshot of the region containing `vaddr`.
    pub fn region_at(&self, vaddr: VirtAddr) -> Option<RegionInfo> {
        self.regions.lock().containing(vaddr).map(Region::info)
    }

    /// Verify that no two regions intersect and every region lies inside
    /// the space.
    pub fn check_regions(&self) -> bool {
        let tree = self.regions.lock();
        let mut prev_last: Option<VirtAddr> = None;
        for region in tree.iter() {
            if !self.contains_range(region.base, region.size)
                || !region.base.is_aligned()
                || !is_page_aligned(region.size)
            {
                return false;
            }
            if prev_last.is_some_and(|last| region.base <= last) {
                return false;
            }
            prev_last = Some(region.last());
        }
        true
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegionTree> {
        self.regions.lock()
    }
}

impl core::fmt::Debug for Aspace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Aspace")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("base", &self.base)
            .field("size", &self.size)
            .field("regions", &self.region_count())
            .finish()
    }
}

impl Drop for Aspace {
    fn drop(&mut self) {
        let regions = self.regions.get_mut();
        if !regions.is_empty() {
            log::warn!(
                "vmm: address space '{}' dropped with {} live regions",
                self.name,
                regions.len()
            );
        }
    }
}

/// The region collection of one address space.
pub(crate) struct RegionTree {
    map: BTreeMap<VirtAddr, Region>,
}

impl RegionTree {
    const fn new() -> Self {
        Self { map: BTreeMap::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Region> {
        self.map.values()
    }

    /// Region containing `vaddr`, if any.
    pub(crate) fn containing(&self, vaddr: VirtAddr) -> Option<&Region> {
        self.map
            .range(..=vaddr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(vaddr))
    }

    /// Check that `[vaddr, vaddr + size)` intersects no region.
    ///
    /// Regions are disjoint and sorted, so the one with the greatest base not
    /// above the range's last byte is the only candidate.
    pub(crate) fn is_free(&self, vaddr: VirtAddr, size: usize) -> bool {
        let last = vaddr.add(size - 1);
        match self.map.range(..=last).next_back() {
            Some((_, r)) => r.last() < vaddr,
            None => true,
        }
    }

    /// Lowest-addressed gap of `size` bytes between `base` and `last`.
    pub(crate) fn find_gap(&self, base: VirtAddr, last: VirtAddr, size: usize) -> Option<VirtAddr> {
        let mut cursor = base;
        for region in self.map.values() {
            if region.base > cursor && region.base.as_usize() - cursor.as_usize() >= size {
                return Some(cursor);
            }
            if region.last() >= cursor {
                cursor = region.last().checked_add(1)?;
            }
        }
        if cursor <= last && last.as_usize() - cursor.as_usize() >= size - 1 {
            Some(cursor)
        } else {
            None
        }
    }

    pub(crate) fn insert(&mut self, region: Region) {
        debug_assert!(self.is_free(region.base, region.size));
        self.map.insert(region.base, region);
    }

    /// Detach the region containing `vaddr`.
    pub(crate) fn remove_containing(&mut self, vaddr: VirtAddr) -> Option<Region> {
        let base = self.containing(vaddr)?.base;
        self.map.remove(&base)
    }

    /// Detach every region, lowest address first.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Region> {
        core::mem::take(&mut self.map).into_values()
    }
}
