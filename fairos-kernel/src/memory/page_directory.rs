//! Four-level x86_64 page tables of one user address space.
//!
//! A [`PageDirectory`] is a view over a PML4 frame. It does not own the frame:
//! the handle stored in the thread and in the registry is the root
//! [`PhysFrame`], and a view is opened whenever the tables must be walked.
//! Only the lower (user) half is ever walked or freed; the upper half holds
//! kernel mappings shared by every address space.

use x86_64::structures::paging::{
    Page, PageTable, PageTableFlags, PageTableIndex, PhysFrame, page_table::PageTableEntry,
};

use super::PageAllocator;
use crate::arch::flush_page;

/// PML4 entries covering the user half of the address space.
const USER_PML4_ENTRIES: usize = 256;

/// Flags for intermediate tables. Leaf entries narrow access further.
const TABLE_FLAGS: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::USER_ACCESSIBLE);

/// Errors from mapping a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No frame was available for the root or an intermediate table.
    OutOfFrames,
    /// The page already has a present mapping.
    AlreadyMapped,
    /// A huge page covers the address.
    HugePage,
}

pub struct PageDirectory<'a, A: PageAllocator + ?Sized> {
    root: PhysFrame,
    pages: &'a A,
}

impl<'a, A: PageAllocator + ?Sized> PageDirectory<'a, A> {
    /// Allocate an empty page directory.
    pub fn create(pages: &'a A) -> Result<Self, MapError> {
        let root = pages.allocate_page(true).ok_or(MapError::OutOfFrames)?;
        Ok(Self { root, pages })
    }

    /// Allocate a page directory whose kernel half is copied from `kernel_root`.
    pub fn create_with_kernel(pages: &'a A, kernel_root: PhysFrame) -> Result<Self, MapError> {
        let directory = Self::create(pages)?;
        let template = unsafe { directory.table(kernel_root) };
        let root = unsafe { directory.table(directory.root) };
        for index in USER_PML4_ENTRIES..512 {
            root[index] = template[index].clone();
        }
        Ok(directory)
    }

    /// Open an existing page directory by its root frame.
    pub fn open(root: PhysFrame, pages: &'a A) -> Self {
        Self { root, pages }
    }

    pub fn root(&self) -> PhysFrame {
        self.root
    }

    /// Map `page` to `frame` as a user page.
    pub fn map(&mut self, page: Page, frame: PhysFrame, writable: bool) -> Result<(), MapError> {
        let entry = self.walk_or_create(page)?;
        if entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(MapError::AlreadyMapped);
        }

        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        entry.set_frame(frame, flags);
        flush_page(page.start_address());
        Ok(())
    }

    /// Remove the mapping of `page`, returning the frame it pointed to.
    ///
    /// The frame is not freed.
    pub fn unmap(&mut self, page: Page) -> Option<PhysFrame> {
        let entry = self.walk(page)?;
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        let frame = entry.frame().ok()?;
        entry.set_unused();
        flush_page(page.start_address());
        Some(frame)
    }

    /// Frame and flags of a present mapping.
    pub fn translate(&self, page: Page) -> Option<(PhysFrame, PageTableFlags)> {
        let entry = self.walk(page)?;
        let frame = entry.frame().ok()?;
        Some((frame, entry.flags()))
    }

    pub fn is_present(&self, page: Page) -> bool {
        self.translate(page).is_some()
    }

    pub fn is_writable(&self, page: Page) -> bool {
        self.translate(page)
            .is_some_and(|(_, flags)| flags.contains(PageTableFlags::WRITABLE))
    }

    pub fn is_accessed(&self, page: Page) -> bool {
        self.translate(page)
            .is_some_and(|(_, flags)| flags.contains(PageTableFlags::ACCESSED))
    }

    /// Set or clear the accessed bit of a present mapping.
    ///
    /// The MMU sets the bit on every access; software only clears it, except
    /// when simulating accesses.
    pub fn set_accessed(&mut self, page: Page, accessed: bool) -> bool {
        let Some(entry) = self.walk(page) else {
            return false;
        };
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return false;
        }
        let mut flags = entry.flags();
        flags.set(PageTableFlags::ACCESSED, accessed);
        entry.set_flags(flags);
        flush_page(page.start_address());
        true
    }

    /// Visit resident user pages in ascending address order until `pick`
    /// returns true, and return that page.
    ///
    /// `pick` may edit the entry's flags; the TLB entry is flushed afterwards.
    pub fn find_resident(
        &mut self,
        mut pick: impl FnMut(Page, &mut PageTableEntry) -> bool,
    ) -> Option<Page> {
        let root = unsafe { self.table(self.root) };
        for (i4, e4) in root.iter_mut().enumerate().take(USER_PML4_ENTRIES) {
            let Some(l3) = self.child(e4) else { continue };
            for (i3, e3) in l3.iter_mut().enumerate() {
                let Some(l2) = self.child(e3) else { continue };
                for (i2, e2) in l2.iter_mut().enumerate() {
                    let Some(l1) = self.child(e2) else { continue };
                    for (i1, e1) in l1.iter_mut().enumerate() {
                        if !e1.flags().contains(PageTableFlags::PRESENT) {
                            continue;
                        }
                        let page = Page::from_page_table_indices(
                            index(i4),
                            index(i3),
                            index(i2),
                            index(i1),
                        );
                        let picked = pick(page, e1);
                        flush_page(page.start_address());
                        if picked {
                            return Some(page);
                        }
                    }
                }
            }
        }
        None
    }

    /// Number of present user pages.
    pub fn resident_count(&mut self) -> usize {
        let mut count = 0;
        self.find_resident(|_, _| {
            count += 1;
            false
        });
        count
    }

    /// Free every user frame, every user page table and the root.
    ///
    /// # Safety
    /// The directory must not be active on the CPU and no other view of it
    /// may be used afterwards.
    pub unsafe fn destroy(self) {
        let root = unsafe { self.table(self.root) };
        for entry in root.iter_mut().take(USER_PML4_ENTRIES) {
            if let Some(frame) = table_frame(entry) {
                unsafe { self.free_subtree(frame, 3) };
                entry.set_unused();
            }
        }
        unsafe { self.pages.free_page(self.root) };
    }

    /// Free the table in `frame` at `level`, everything below it, and the
    /// mapped leaf frames.
    unsafe fn free_subtree(&self, frame: PhysFrame, level: u8) {
        let table = unsafe { self.table(frame) };
        for entry in table.iter_mut() {
            if !entry.flags().contains(PageTableFlags::PRESENT) {
                continue;
            }
            if level > 1 {
                if let Some(child) = table_frame(entry) {
                    unsafe { self.free_subtree(child, level - 1) };
                }
            } else if let Ok(leaf) = entry.frame() {
                unsafe { self.pages.free_page(leaf) };
            }
            entry.set_unused();
        }
        unsafe { self.pages.free_page(frame) };
    }

    /// Level-1 entry for `page`, if every table on the way exists.
    fn walk(&self, page: Page) -> Option<&'a mut PageTableEntry> {
        let mut table = unsafe { self.table(self.root) };
        for index in [page.p4_index(), page.p3_index(), page.p2_index()] {
            table = self.child(&mut table[index])?;
        }
        Some(&mut table[page.p1_index()])
    }

    /// Level-1 entry for `page`, allocating missing tables.
    fn walk_or_create(&self, page: Page) -> Result<&'a mut PageTableEntry, MapError> {
        let mut table = unsafe { self.table(self.root) };
        for index in [page.p4_index(), page.p3_index(), page.p2_index()] {
            let entry = &mut table[index];
            if entry.is_unused() {
                let frame = self
                    .pages
                    .allocate_page(true)
                    .ok_or(MapError::OutOfFrames)?;
                entry.set_frame(frame, TABLE_FLAGS);
            }
            let next = table_frame(entry).ok_or(MapError::HugePage)?;
            table = unsafe { self.table(next) };
        }
        Ok(&mut table[page.p1_index()])
    }

    /// Table referenced by a non-leaf entry.
    fn child(&self, entry: &mut PageTableEntry) -> Option<&'a mut PageTable> {
        let frame = table_frame(entry)?;
        Some(unsafe { self.table(frame) })
    }

    /// # Safety
    /// `frame` must hold a page table belonging to this directory (or the
    /// kernel template), and the caller must not create aliasing references.
    unsafe fn table(&self, frame: PhysFrame) -> &'a mut PageTable {
        let virt = self.pages.phys_to_virt(frame.start_address());
        unsafe { &mut *virt.as_mut_ptr::<PageTable>() }
    }
}

/// Frame of the next-level table, or `None` for absent or huge entries.
fn table_frame(entry: &PageTableEntry) -> Option<PhysFrame> {
    let flags = entry.flags();
    if !flags.contains(PageTableFlags::PRESENT) || flags.contains(PageTableFlags::HUGE_PAGE) {
        return None;
    }
    entry.frame().ok()
}

fn index(i: usize) -> PageTableIndex {
    PageTableIndex::new(i as u16)
}
