//! Physical Memory Arenas
//!
//! An arena is one contiguous, page-aligned range of physical memory with
//! its own descriptor array and free list. Pages inside an arena are
//! fungible; the PMM chooses between arenas by priority.
//!
//! # Design
//! - Descriptors are handed to the arena once, at registration
//! - The free list is doubly linked through descriptor indices, giving
//!   O(1) pop, push and unlink (the last one is needed for range pinning)
//! - `free_count` is maintained alongside the list and always equals its length
//! - Each arena is protected by its own spinlock

use bitflags::bitflags;
use spin::Mutex;

use super::address::{PhysAddr, PAGE_SHIFT, PAGE_SIZE};
use super::page::{PageInfo, VmPage, VmPageFlags, NIL};
use super::pmm::{PageList, PmmError};

bitflags! {
    /// Arena capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ArenaFlags: u32 {
        /// Already mapped in the kernel linear window; usable for kernel
        /// metadata before the VMM exists.
        const KMAP = 0x1;
    }
}

/// A registered (or registrable) physical memory range.
pub struct Arena {
    name: &'static str,
    flags: ArenaFlags,
    priority: u32,
    base: PhysAddr,
    size: usize,
    inner: Mutex<ArenaInner>,
}

struct ArenaInner {
    pages: Option<&'static mut [VmPage]>,
    free_head: u32,
    free_tail: u32,
    free_count: usize,
}

impl Arena {
    /// Describe an arena. Nothing is allocated until the PMM registers it.
    ///
    /// Lower `priority` values are preferred by the allocator.
    pub const fn new(
        name: &'static str,
        base: PhysAddr,
        size: usize,
        priority: u32,
        flags: ArenaFlags,
    ) -> Self {
        Self {
            name,
            flags,
            priority,
            base,
            size,
            inner: Mutex::new(ArenaInner {
                pages: None,
                free_head: NIL,
                free_tail: NIL,
                free_count: 0,
            }),
        }
    }

    /// Arena name.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Arena flags.
    #[inline]
    pub fn flags(&self) -> ArenaFlags {
        self.flags
    }

    /// Allocation priority (lower wins).
    #[inline]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// First physical address of the arena.
    #[inline]
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    /// Length in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of pages (and descriptors) in the arena.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.size >> PAGE_SHIFT
    }

    /// Number of pages currently on the free list.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free_count
    }

    /// Whether descriptors have been attached.
    pub fn is_registered(&self) -> bool {
        self.inner.lock().pages.is_some()
    }

    /// Check if `pa` falls inside the arena.
    #[inline]
    pub fn contains(&self, pa: PhysAddr) -> bool {
        pa >= self.base && pa.as_usize() - self.base.as_usize() < self.size
    }

    /// Check if `count` pages starting at `pa` fall inside the arena.
    pub fn contains_range(&self, pa: PhysAddr, count: usize) -> bool {
        let Some(len) = count.checked_mul(PAGE_SIZE) else {
            return false;
        };
        self.contains(pa) && pa.as_usize() - self.base.as_usize() + len <= self.size
    }

    /// Check if the arena intersects `[base, base + size)`.
    pub fn overlaps(&self, base: PhysAddr, size: usize) -> bool {
        let (a0, a1) = (self.base.as_usize(), self.base.as_usize() + self.size);
        let (b0, b1) = (base.as_usize(), base.as_usize() + size);
        a0 < b1 && b0 < a1
    }

    /// Snapshot the descriptor for `pa`.
    pub fn page_info(&self, pa: PhysAddr) -> Option<PageInfo> {
        if !self.contains(pa) {
            return None;
        }
        let index = self.index_of(pa);
        let inner = self.inner.lock();
        let page = inner.pages.as_ref()?.get(index)?;
        Some(PageInfo {
            paddr: self.paddr_of(index),
            flags: page.flags(),
            ref_count: page.ref_count(),
        })
    }

    #[inline]
    fn index_of(&self, pa: PhysAddr) -> usize {
        (pa.as_usize() - self.base.as_usize()) >> PAGE_SHIFT
    }

    #[inline]
    fn paddr_of(&self, index: usize) -> PhysAddr {
        self.base.add(index << PAGE_SHIFT)
    }

    /// Hand the descriptor array to the arena and put every page on the free list.
    pub(crate) fn attach(&self, pages: &'static mut [VmPage]) -> Result<(), PmmError> {
        if pages.len() != self.page_count() {
            return Err(PmmError::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        if inner.pages.is_some() {
            return Err(PmmError::InvalidArgument);
        }

        for page in pages.iter_mut() {
            *page = VmPage::unlinked();
        }
        inner.pages = Some(pages);
        for index in 0..self.page_count() as u32 {
            inner.push_tail(index);
        }
        Ok(())
    }

    /// Pop up to `count` pages off the free list and append them to `list`.
    ///
    /// Returns the number of pages taken.
    pub(crate) fn alloc_pages(&self, count: usize, list: &mut PageList) -> usize {
        let mut inner = self.inner.lock();
        let mut taken = 0;
        while taken < count {
            let Some(index) = inner.pop_head() else {
                break;
            };
            inner.mark_allocated(index);
            list.push(self.paddr_of(index as usize));
            taken += 1;
        }
        taken
    }

    /// Pin exactly `[pa, pa + count pages)`. All or nothing.
    ///
    /// Without a `list` the pages are only marked allocated, and nothing is
    /// allocated on the heap.
    pub(crate) fn alloc_range(
        &self,
        pa: PhysAddr,
        count: usize,
        mut list: Option<&mut PageList>,
    ) -> Result<(), PmmError> {
        if !self.contains_range(pa, count) {
            return Err(PmmError::NotFound);
        }
        let first = self.index_of(pa);

        let mut inner = self.inner.lock();
        let pages = inner.pages.as_ref().ok_or(PmmError::NotFound)?;
        if pages[first..first + count].iter().any(|p| !p.is_free()) {
            return Err(PmmError::AlreadyAllocated);
        }

        for index in first..first + count {
            inner.unlink(index as u32);
            inner.mark_allocated(index as u32);
            if let Some(list) = list.as_deref_mut() {
                list.push(self.paddr_of(index));
            }
        }
        Ok(())
    }

    /// Find and pin the lowest-addressed run of `count` free pages whose
    /// first page is aligned to `align` bytes.
    pub(crate) fn alloc_contiguous(
        &self,
        count: usize,
        align: usize,
        mut list: Option<&mut PageList>,
    ) -> Option<PhysAddr> {
        let mut inner = self.inner.lock();
        if inner.free_count < count {
            return None;
        }
        let pages = inner.pages.as_ref()?;

        let mut run_start = 0;
        let mut run_len = 0;
        let mut found = None;
        for (index, page) in pages.iter().enumerate() {
            if !page.is_free() {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                if self.paddr_of(index).as_usize() % align != 0 {
                    continue;
                }
                run_start = index;
            }
            run_len += 1;
            if run_len == count {
                found = Some(run_start);
                break;
            }
        }

        let first = found?;
        for index in first..first + count {
            inner.unlink(index as u32);
            inner.mark_allocated(index as u32);
            if let Some(list) = list.as_deref_mut() {
                list.push(self.paddr_of(index));
            }
        }
        Some(self.paddr_of(first))
    }

    /// Return one page to the free list.
    pub(crate) fn free_page(&self, pa: PhysAddr) -> Result<(), PmmError> {
        if !self.contains(pa) || !pa.is_aligned() {
            return Err(PmmError::NotFound);
        }
        let index = self.index_of(pa) as u32;

        let mut inner = self.inner.lock();
        let pages = inner.pages.as_mut().ok_or(PmmError::NotFound)?;
        let page = &mut pages[index as usize];
        if page.is_free() {
            return Err(PmmError::DoubleFree);
        }
        page.set_state(VmPageFlags::empty(), 0);
        inner.push_tail(index);
        Ok(())
    }

    /// Walk the free list and check it against the descriptors.
    ///
    /// Returns `false` if the list length disagrees with `free_count` or a
    /// listed page is marked in use.
    pub fn check_free_list(&self) -> bool {
        let inner = self.inner.lock();
        let Some(pages) = inner.pages.as_ref() else {
            return inner.free_count == 0;
        };

        let mut walked = 0;
        let mut prev = NIL;
        let mut cursor = inner.free_head;
        while cursor != NIL {
            let page = &pages[cursor as usize];
            if !page.is_free() || page.prev() != prev || walked > pages.len() {
                return false;
            }
            walked += 1;
            prev = cursor;
            cursor = page.next();
        }
        prev == inner.free_tail
            && walked == inner.free_count
            && walked == pages.iter().filter(|p| p.is_free()).count()
    }
}

impl core::fmt::Debug for Arena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("size", &self.size)
            .field("priority", &self.priority)
            .field("flags", &self.flags)
            .field("free_count", &self.free_count())
            .finish()
    }
}

impl ArenaInner {
    fn pages_mut(&mut self) -> &mut [VmPage] {
        match self.pages.as_deref_mut() {
            Some(pages) => pages,
            None => &mut [],
        }
    }

    fn push_tail(&mut self, index: u32) {
        let tail = self.free_tail;
        let pages = self.pages_mut();
        pages[index as usize].set_links(tail, NIL);
        if tail != NIL {
            pages[tail as usize].set_next(index);
        }
        if self.free_head == NIL {
            self.free_head = index;
        }
        self.free_tail = index;
        self.free_count += 1;
    }

    fn pop_head(&mut self) -> Option<u32> {
        let head = self.free_head;
        if head == NIL {
            return None;
        }
        self.unlink(head);
        Some(head)
    }

    fn unlink(&mut self, index: u32) {
        let pages = self.pages_mut();
        let (prev, next) = (pages[index as usize].prev(), pages[index as usize].next());
        if prev != NIL {
            pages[prev as usize].set_next(next);
        }
        if next != NIL {
            pages[next as usize].set_prev(prev);
        }
        pages[index as usize].set_links(NIL, NIL);

        if self.free_head == index {
            self.free_head = next;
        }
        if self.free_tail == index {
            self.free_tail = prev;
        }
        self.free_count -= 1;
    }

    fn mark_allocated(&mut self, index: u32) {
        self.pages_mut()[index as usize].set_state(VmPageFlags::NONFREE, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;

    fn registered(base: usize, pages: usize) -> &'static Arena {
        let arena = Box::leak(Box::new(Arena::new(
            "test",
            PhysAddr::new(base),
            pages * PAGE_SIZE,
            0,
            ArenaFlags::empty(),
        )));
        let descriptors = vec![VmPage::unlinked(); pages].leak();
        arena.attach(descriptors).unwrap();
        arena
    }

    #[test]
    fn test_attach_puts_every_page_on_free_list() {
        let arena = registered(0x1000, 16);
        assert_eq!(arena.free_count(), 16);
        assert!(arena.check_free_list());
        assert_eq!(
            arena.attach(vec![VmPage::unlinked(); 16].leak()),
            Err(PmmError::InvalidArgument)
        );
    }

    #[test]
    fn test_alloc_and_free_keep_count_in_sync() {
        let arena = registered(0x1000, 8);
        let mut list = PageList::new();
        assert_eq!(arena.alloc_pages(3, &mut list), 3);
        assert_eq!(arena.free_count(), 5);
        assert!(arena.check_free_list());

        let info = arena.page_info(list.iter().next().unwrap()).unwrap();
        assert_eq!(info.flags, VmPageFlags::NONFREE);
        assert_eq!(info.ref_count, 1);

        for pa in list.iter() {
            arena.free_page(pa).unwrap();
        }
        assert_eq!(arena.free_count(), 8);
        assert!(arena.check_free_list());
    }

    #[test]
    fn test_double_free_is_reported() {
        let arena = registered(0x1000, 2);
        assert_eq!(
            arena.free_page(PhysAddr::new(0x1000)),
            Err(PmmError::DoubleFree)
        );
        assert_eq!(arena.free_count(), 2);
    }

    #[test]
    fn test_range_pinning_is_all_or_nothing() {
        let arena = registered(0x10_0000, 8);
        let mut list = PageList::new();
        arena.alloc_range(PhysAddr::new(0x10_3000), 1, Some(&mut list)).unwrap();

        let mut other = PageList::new();
        assert_eq!(
            arena.alloc_range(PhysAddr::new(0x10_2000), 3, Some(&mut other)),
            Err(PmmError::AlreadyAllocated)
        );
        assert!(other.is_empty());
        assert_eq!(arena.free_count(), 7);

        assert_eq!(
            arena.alloc_range(PhysAddr::new(0x10_6000), 4, Some(&mut other)),
            Err(PmmError::NotFound)
        );
        arena.alloc_range(PhysAddr::new(0x10_4000), 4, Some(&mut other)).unwrap();
        assert_eq!(other.len(), 4);
        assert_eq!(arena.free_count(), 3);
        assert!(arena.check_free_list());
    }

    #[test]
    fn test_contiguous_run_is_lowest_fit() {
        let arena = registered(0x0, 8);
        let mut pinned = PageList::new();
        arena.alloc_range(PhysAddr::new(0x1000), 1, Some(&mut pinned)).unwrap();

        let mut list = PageList::new();
        let run = arena.alloc_contiguous(3, PAGE_SIZE, Some(&mut list)).unwrap();
        assert_eq!(run, PhysAddr::new(0x2000));

        let aligned = arena.alloc_contiguous(2, 4 * PAGE_SIZE, Some(&mut list));
        assert_eq!(aligned, None);
        let any = arena.alloc_contiguous(2, PAGE_SIZE, Some(&mut list)).unwrap();
        assert_eq!(any, PhysAddr::new(0x5000));
        assert!(arena.check_free_list());
    }

    #[test]
    fn test_pinning_without_a_list_marks_pages_only() {
        let arena = registered(0x2_0000, 6);
        arena.alloc_range(PhysAddr::new(0x2_1000), 2, None).unwrap();
        assert_eq!(arena.free_count(), 4);
        assert_eq!(
            arena.alloc_range(PhysAddr::new(0x2_2000), 1, None),
            Err(PmmError::AlreadyAllocated)
        );

        let run = arena.alloc_contiguous(3, PAGE_SIZE, None).unwrap();
        assert_eq!(run, PhysAddr::new(0x2_3000));
        assert_eq!(arena.free_count(), 1);
        assert!(arena.check_free_list());

        for i in 1..6 {
            arena.free_page(PhysAddr::new(0x2_0000 + i * PAGE_SIZE)).unwrap();
        }
        assert_eq!(arena.free_count(), 6);
        assert!(arena.check_free_list());
    }
}
