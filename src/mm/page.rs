//! Page Descriptors
//!
//! One [`VmPage`] exists per physical page frame of every registered arena.
//! Descriptors live in a flat array owned by the arena and are linked into
//! the arena's free list by index, so no descriptor holds a pointer.
//!
//! ```text
//!  VmPage (12 bytes)
//!  ┌────────────┬────────────┬───────────────────────┐
//!  │ prev: u32  │ next: u32  │ flags:8 │ ref_count:24│
//!  └────────────┴────────────┴───────────────────────┘
//! ```

use bitflags::bitflags;

use super::address::PhysAddr;

bitflags! {
    /// Per-page state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmPageFlags: u8 {
        /// Out of circulation: allocated, pinned, or arena metadata.
        const NONFREE = 0x1;
    }
}

/// Free-list terminator.
pub(crate) const NIL: u32 = u32::MAX;

/// Largest reference count a descriptor can hold.
pub const MAX_REF_COUNT: u32 = (1 << 24) - 1;

const FLAGS_SHIFT: u32 = 24;
const REF_MASK: u32 = MAX_REF_COUNT;

/// Per-page metadata.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VmPage {
    prev: u32,
    next: u32,
    state: u32,
}

const _: () = assert!(core::mem::size_of::<VmPage>() == 12);

impl VmPage {
    /// A free descriptor that is not linked anywhere.
    pub(crate) const fn unlinked() -> Self {
        Self {
            prev: NIL,
            next: NIL,
            state: 0,
        }
    }

    /// Current flag bits.
    #[inline]
    pub fn flags(&self) -> VmPageFlags {
        VmPageFlags::from_bits_truncate((self.state >> FLAGS_SHIFT) as u8)
    }

    /// Current reference count.
    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.state & REF_MASK
    }

    /// True while the page sits on a free list.
    #[inline]
    pub fn is_free(&self) -> bool {
        !self.flags().contains(VmPageFlags::NONFREE)
    }

    #[inline]
    pub(crate) fn set_state(&mut self, flags: VmPageFlags, ref_count: u32) {
        debug_assert!(ref_count <= MAX_REF_COUNT);
        self.state = ((flags.bits() as u32) << FLAGS_SHIFT) | (ref_count & REF_MASK);
    }

    #[inline]
    pub(crate) fn prev(&self) -> u32 {
        self.prev
    }

    #[inline]
    pub(crate) fn next(&self) -> u32 {
        self.next
    }

    #[inline]
    pub(crate) fn set_links(&mut self, prev: u32, next: u32) {
        self.prev = prev;
        self.next = next;
    }

    #[inline]
    pub(crate) fn set_prev(&mut self, prev: u32) {
        self.prev = prev;
    }

    #[inline]
    pub(crate) fn set_next(&mut self, next: u32) {
        self.next = next;
    }
}

impl core::fmt::Debug for VmPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "VmPage(flags={:?}, ref={})", self.flags(), self.ref_count())
    }
}

/// Snapshot of a descriptor, tagged with the page it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    /// Physical address of the page.
    pub paddr: PhysAddr,
    /// Descriptor flags.
    pub flags: VmPageFlags,
    /// Descriptor reference count.
    pub ref_count: u32,
}
