//! Physical Memory Manager
//!
//! Keeps the registry of arenas and hands out physical pages.
//!
//! # Design
//! - Arenas are registered once and never removed, so the registry hands
//!   out `&'static Arena` snapshots and releases its lock before any arena
//!   lock is taken
//! - Arenas are kept sorted by priority; lower values are tried first
//! - Descriptor arrays come from an already-registered `KMAP` arena, or from
//!   a static bootstrap pool while no such arena exists
//! - Partial success of [`Pmm::alloc_pages`] is reported through the count,
//!   never hidden
//!
//! # Locking
//! registry lock → arena lock. Never the other way around.

use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr::NonNull;

use spin::{Mutex, Once};

use super::address::{pages_for, PhysAddr, VirtAddr, PAGE_SHIFT, PAGE_SIZE};
use super::arena::{Arena, ArenaFlags};
use super::initial::{InitialMappings, MmuInitialMapping};
use super::page::{PageInfo, VmPage};

/// Maximum number of arenas the registry can hold.
pub const MAX_ARENAS: usize = 16;

/// Size of the static pool used for descriptor arrays before any `KMAP`
/// arena exists. 64 KiB describes a little over 21 MiB of RAM.
pub const BOOT_POOL_SIZE: usize = 64 * 1024;

/// Error type for physical allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// Misaligned address or size, zero count, or a malformed arena.
    InvalidArgument,
    /// The arena intersects one that is already registered.
    Overlap,
    /// A requested page is already out of circulation.
    AlreadyAllocated,
    /// Not enough free pages (or descriptor storage, or registry slots).
    OutOfMemory,
    /// The address is not covered by any registered arena or linear window.
    NotFound,
    /// The page was already free.
    DoubleFree,
}

impl core::fmt::Display for PmmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::Overlap => write!(f, "arena overlaps a registered arena"),
            Self::AlreadyAllocated => write!(f, "page already allocated"),
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::NotFound => write!(f, "address not owned by any arena"),
            Self::DoubleFree => write!(f, "double free of physical page"),
        }
    }
}

/// An owned list of physical pages.
///
/// Pages move into a list when allocated and leave it when freed. The list
/// is deliberately not `Clone`: a page has exactly one owner.
#[derive(Debug, Default)]
pub struct PageList {
    pages: Vec<PhysAddr>,
}

impl PageList {
    /// Create an empty list.
    pub const fn new() -> Self {
        Self { pages: Vec::new() }
    }

    /// Number of pages held.
    #[inline]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// True when no pages are held.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Physical addresses of the held pages, in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = PhysAddr> + '_ {
        self.pages.iter().copied()
    }

    /// First page of the list.
    #[inline]
    pub fn first(&self) -> Option<PhysAddr> {
        self.pages.first().copied()
    }

    /// Check whether `pa` is held.
    pub fn contains(&self, pa: PhysAddr) -> bool {
        self.pages.contains(&pa)
    }

    /// Move every page of `other` to the end of this list.
    pub fn append(&mut self, other: &mut PageList) {
        self.pages.append(&mut other.pages);
    }

    #[inline]
    pub(crate) fn push(&mut self, pa: PhysAddr) {
        self.pages.push(pa);
    }

    pub(crate) fn take(&mut self) -> Vec<PhysAddr> {
        core::mem::take(&mut self.pages)
    }
}

#[repr(C, align(4096))]
struct BootPoolStorage([u8; BOOT_POOL_SIZE]);

/// Bump allocator for descriptor arrays during bootstrap.
struct BootPool {
    storage: UnsafeCell<BootPoolStorage>,
    used: Mutex<usize>,
}

// SAFETY: the bump offset is guarded by `used`; each byte of `storage` is
// handed out at most once, so no two callers ever alias.
unsafe impl Sync for BootPool {}

impl BootPool {
    const fn new() -> Self {
        Self {
            storage: UnsafeCell::new(BootPoolStorage([0; BOOT_POOL_SIZE])),
            used: Mutex::new(0),
        }
    }

    fn alloc_descriptors(&'static self, count: usize) -> Option<&'static mut [VmPage]> {
        let align = core::mem::align_of::<VmPage>();
        let bytes = count.checked_mul(core::mem::size_of::<VmPage>())?;

        let mut used = self.used.lock();
        let start = used.checked_add(align - 1)? & !(align - 1);
        let end = start.checked_add(bytes)?;
        if end > BOOT_POOL_SIZE {
            return None;
        }
        *used = end;

        // SAFETY: [start, end) lies inside the pool, is aligned for VmPage and
        // was never handed out before. The pool lives for 'static.
        unsafe {
            let base = self.storage.get().cast::<u8>().add(start).cast::<VmPage>();
            Some(init_descriptors(NonNull::new_unchecked(base), count))
        }
    }

    fn remaining(&self) -> usize {
        BOOT_POOL_SIZE - *self.used.lock()
    }
}

/// Write `count` fresh descriptors at `base` and return them as a slice.
///
/// # Safety
/// `base` must be valid for writes of `count` descriptors for 'static, be
/// aligned for `VmPage`, and not be reachable through any other reference.
unsafe fn init_descriptors(base: NonNull<VmPage>, count: usize) -> &'static mut [VmPage] {
    let ptr = base.as_ptr();
    for i in 0..count {
        // SAFETY: in bounds per the function contract.
        unsafe { ptr.add(i).write(VmPage::unlinked()) };
    }
    // SAFETY: all `count` elements were initialized above.
    unsafe { core::slice::from_raw_parts_mut(ptr, count) }
}

#[derive(Clone, Copy)]
struct ArenaList {
    slots: [Option<&'static Arena>; MAX_ARENAS],
    len: usize,
}

impl ArenaList {
    const fn new() -> Self {
        Self {
            slots: [None; MAX_ARENAS],
            len: 0,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &'static Arena> + '_ {
        self.slots[..self.len].iter().flatten().copied()
    }

    fn insert_by_priority(&mut self, arena: &'static Arena) {
        let pos = self
            .iter()
            .position(|a| a.priority() > arena.priority())
            .unwrap_or(self.len);
        self.slots.copy_within(pos..self.len, pos + 1);
        self.slots[pos] = Some(arena);
        self.len += 1;
    }
}

/// The physical memory manager.
pub struct Pmm {
    arenas: Mutex<ArenaList>,
    boot_pool: BootPool,
    window: Once<InitialMappings>,
}

impl Pmm {
    /// Create an empty PMM. Usable in `static` initializers.
    pub const fn new() -> Self {
        Self {
            arenas: Mutex::new(ArenaList::new()),
            boot_pool: BootPool::new(),
            window: Once::new(),
        }
    }

    /// Record the boot table describing the kernel's linear windows.
    ///
    /// Publish the table before registering arenas so that later arenas can
    /// keep their descriptors in a `KMAP` arena instead of the boot pool.
    /// Repeating the call with the same table is harmless.
    ///
    /// # Errors
    /// `InvalidArgument` if a different table was already recorded.
    pub fn set_initial_mappings(
        &self,
        table: &'static [MmuInitialMapping],
    ) -> Result<&InitialMappings, PmmError> {
        let window = self.window.call_once(|| InitialMappings::new(table));
        if !core::ptr::eq(window.entries(), table) {
            log::warn!("pmm: a different boot table is already recorded");
            return Err(PmmError::InvalidArgument);
        }
        Ok(window)
    }

    /// The boot table, once recorded.
    pub fn initial_mappings(&self) -> Option<&InitialMappings> {
        self.window.get()
    }

    /// Registered arenas in priority order.
    pub fn arenas(&self) -> impl Iterator<Item = &'static Arena> {
        let snapshot = *self.arenas.lock();
        (0..snapshot.len).filter_map(move |i| snapshot.slots[i])
    }

    /// Register a physical range.
    ///
    /// # Errors
    /// - `InvalidArgument` if base or size is misaligned, the size is zero,
    ///   or the arena is already registered
    /// - `Overlap` if the range intersects a registered arena
    /// - `OutOfMemory` if no descriptor storage or registry slot is left
    pub fn add_arena(&'static self, arena: &'static Arena) -> Result<(), PmmError> {
        let count = arena.page_count();
        if !arena.base().is_aligned()
            || arena.size() % PAGE_SIZE != 0
            || count == 0
            || count >= u32::MAX as usize
            || arena.base().checked_add(arena.size()).is_none()
        {
            return Err(PmmError::InvalidArgument);
        }

        let mut registry = self.arenas.lock();
        if registry.iter().any(|a| core::ptr::eq(a, arena)) || arena.is_registered() {
            return Err(PmmError::InvalidArgument);
        }
        if registry.iter().any(|a| a.overlaps(arena.base(), arena.size())) {
            log::warn!(
                "arena '{}' [{}, +{:#x}) overlaps a registered arena",
                arena.name(),
                arena.base(),
                arena.size()
            );
            return Err(PmmError::Overlap);
        }
        if registry.len == MAX_ARENAS {
            return Err(PmmError::OutOfMemory);
        }

        let descriptors = self
            .descriptors_from_kmap(&registry, count)
            .or_else(|| self.boot_pool.alloc_descriptors(count))
            .ok_or(PmmError::OutOfMemory)?;
        arena.attach(descriptors)?;
        registry.insert_by_priority(arena);

        log::info!(
            "pmm: arena '{}' [{}, +{:#x}) priority {} flags {:?}: {} pages",
            arena.name(),
            arena.base(),
            arena.size(),
            arena.priority(),
            arena.flags(),
            count
        );
        Ok(())
    }

    fn descriptors_from_kmap(
        &self,
        registry: &ArenaList,
        count: usize,
    ) -> Option<&'static mut [VmPage]> {
        let window = self.window.get()?;
        let bytes = count.checked_mul(core::mem::size_of::<VmPage>())?;
        let pages = pages_for(bytes);

        for arena in registry
            .iter()
            .filter(|a| a.flags().contains(ArenaFlags::KMAP))
        {
            let Some(pa) = arena.alloc_contiguous(pages, PAGE_SIZE, None) else {
                continue;
            };
            let Some(va) = window.paddr_to_kvaddr(pa) else {
                for i in 0..pages {
                    let _ = arena.free_page(pa.add(i * PAGE_SIZE));
                }
                continue;
            };
            // The run stays NONFREE: it is the new arena's metadata for good.

            // SAFETY: the run was just pinned for this use, is mapped in the
            // kernel window and is page aligned.
            let base = unsafe { NonNull::new_unchecked(va.as_mut_ptr::<VmPage>()) };
            return Some(unsafe { init_descriptors(base, count) });
        }
        None
    }

    /// Allocate up to `count` pages, appending them to `list`.
    ///
    /// Returns the number of pages obtained, which is less than `count` when
    /// memory runs out.
    pub fn alloc_pages(&self, count: usize, list: &mut PageList) -> usize {
        let mut allocated = 0;
        for arena in self.arenas() {
            if allocated == count {
                break;
            }
            allocated += arena.alloc_pages(count - allocated, list);
        }

        if allocated < count {
            log::warn!("pmm: wanted {} pages, got {}", count, allocated);
        } else {
            log::trace!("pmm: allocated {} pages", allocated);
        }
        allocated
    }

    /// Allocate one page.
    pub fn alloc_page(&self, list: &mut PageList) -> Result<PhysAddr, PmmError> {
        match self.alloc_pages(1, list) {
            1 => list.pages.last().copied().ok_or(PmmError::OutOfMemory),
            _ => Err(PmmError::OutOfMemory),
        }
    }

    /// Pin the exact range `[address, address + count pages)`.
    ///
    /// All or nothing: on error no page changes state.
    pub fn alloc_range(
        &self,
        address: PhysAddr,
        count: usize,
        list: &mut PageList,
    ) -> Result<usize, PmmError> {
        self.pin_range(address, count, Some(list))
    }

    /// Pin a range without recording the pages anywhere.
    ///
    /// Never allocates from the heap, so it is safe to call while feeding
    /// the kernel heap itself. Undo with [`Pmm::free_run`].
    pub(crate) fn pin(&self, address: PhysAddr, count: usize) -> Result<usize, PmmError> {
        self.pin_range(address, count, None)
    }

    fn pin_range(
        &self,
        address: PhysAddr,
        count: usize,
        list: Option<&mut PageList>,
    ) -> Result<usize, PmmError> {
        if !address.is_aligned() || count == 0 {
            return Err(PmmError::InvalidArgument);
        }

        let arena = self
            .arenas()
            .find(|a| a.contains_range(address, count))
            .ok_or(PmmError::NotFound)?;
        arena.alloc_range(address, count, list)?;

        log::debug!("pmm: pinned {} pages at {}", count, address);
        Ok(count)
    }

    /// Allocate `count` physically contiguous pages.
    ///
    /// The run starts on a `1 << alignment_log2` boundary (at least a page)
    /// and is the lowest-addressed fit in the highest-priority arena that
    /// has one.
    pub fn alloc_contiguous(
        &self,
        count: usize,
        alignment_log2: u8,
        list: &mut PageList,
    ) -> Result<PhysAddr, PmmError> {
        self.alloc_contiguous_in(count, alignment_log2, ArenaFlags::empty(), Some(list))
    }

    fn alloc_contiguous_in(
        &self,
        count: usize,
        alignment_log2: u8,
        required: ArenaFlags,
        mut list: Option<&mut PageList>,
    ) -> Result<PhysAddr, PmmError> {
        if count == 0 || alignment_log2 as u32 >= usize::BITS {
            return Err(PmmError::InvalidArgument);
        }
        let align = (1usize << alignment_log2).max(PAGE_SIZE);

        for arena in self.arenas().filter(|a| a.flags().contains(required)) {
            if let Some(pa) = arena.alloc_contiguous(count, align, list.as_deref_mut()) {
                log::debug!("pmm: contiguous run of {} pages at {}", count, pa);
                return Ok(pa);
            }
        }
        log::warn!("pmm: no contiguous run of {} pages", count);
        Err(PmmError::OutOfMemory)
    }

    /// Return every page in `list` to its arena. The list is left empty.
    ///
    /// Every page is processed even if some fail; the first error is
    /// returned.
    ///
    /// # Panics
    /// In debug builds, freeing a page that is already free panics.
    pub fn free(&self, list: &mut PageList) -> Result<usize, PmmError> {
        let mut freed = 0;
        let mut first_err = None;
        for pa in list.take() {
            match self.free_page(pa) {
                Ok(()) => freed += 1,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            None => Ok(freed),
            Some(e) => Err(e),
        }
    }

    /// Return a single page to its arena.
    ///
    /// # Panics
    /// In debug builds, freeing a page that is already free panics.
    pub fn free_page(&self, pa: PhysAddr) -> Result<(), PmmError> {
        let arena = self
            .arenas()
            .find(|a| a.contains(pa))
            .ok_or(PmmError::NotFound)?;
        match arena.free_page(pa) {
            Err(PmmError::DoubleFree) => {
                log::error!("pmm: double free of page {} in '{}'", pa, arena.name());
                debug_assert!(false, "double free of page {}", pa);
                Err(PmmError::DoubleFree)
            }
            other => other,
        }
    }

    /// Free `count` pages starting at `pa`, as pinned by [`Pmm::pin`].
    ///
    /// Every page is processed; the first error is returned.
    pub(crate) fn free_run(&self, pa: PhysAddr, count: usize) -> Result<usize, PmmError> {
        let mut first_err = None;
        for i in 0..count {
            if let Err(e) = self.free_page(pa.add(i * PAGE_SIZE)) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(count),
            Some(e) => Err(e),
        }
    }

    /// Allocate `count` pages from `KMAP` arenas and return their kernel
    /// address.
    ///
    /// More than one page is always a single contiguous run, so the returned
    /// pointer covers the whole allocation. The pages are appended to `list`
    /// when one is given; otherwise the caller keeps them through the
    /// returned address (see [`Pmm::kvaddr_to_paddr`]) and the call does not
    /// touch the heap at all.
    pub fn alloc_kpages(
        &self,
        count: usize,
        list: Option<&mut PageList>,
    ) -> Result<VirtAddr, PmmError> {
        let window = self.window.get().ok_or(PmmError::NotFound)?;

        let pa = self.alloc_contiguous_in(count, PAGE_SHIFT as u8, ArenaFlags::KMAP, None)?;
        let Some(va) = window.paddr_to_kvaddr(pa) else {
            let _ = self.free_run(pa, count);
            return Err(PmmError::NotFound);
        };

        if let Some(list) = list {
            for i in 0..count {
                list.push(pa.add(i * PAGE_SIZE));
            }
        }
        Ok(va)
    }

    /// Allocate one kernel-mapped page.
    pub fn alloc_kpage(&self) -> Result<VirtAddr, PmmError> {
        self.alloc_kpages(1, None)
    }

    /// Kernel virtual address of `pa` if it lies in the linear window.
    pub fn paddr_to_kvaddr(&self, pa: PhysAddr) -> Option<VirtAddr> {
        self.window.get()?.paddr_to_kvaddr(pa)
    }

    /// Physical address of `va` if it lies in the linear window.
    pub fn kvaddr_to_paddr(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.window.get()?.kvaddr_to_paddr(va)
    }

    /// Descriptor snapshot for the page containing `pa`.
    pub fn paddr_to_vm_page(&self, pa: PhysAddr) -> Option<PageInfo> {
        self.arenas()
            .find(|a| a.contains(pa))?
            .page_info(pa.align_down())
    }

    /// Free pages across all arenas.
    pub fn free_pages(&self) -> usize {
        self.arenas().map(Arena::free_count).sum()
    }

    /// Pages under management across all arenas.
    pub fn total_pages(&self) -> usize {
        self.arenas().map(Arena::page_count).sum()
    }

    /// Bytes left in the bootstrap descriptor pool.
    pub fn boot_pool_remaining(&self) -> usize {
        self.boot_pool.remaining()
    }
}

impl Default for Pmm {
    fn default() -> Self {
        Self::new()
    }
}
