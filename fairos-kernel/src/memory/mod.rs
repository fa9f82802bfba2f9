//! Virtual memory: page directories, the eviction scan and the swap store.
//!
//! Frames come from a [`PageAllocator`] supplied by the platform. Everything
//! above it (page-table walks, victim selection, swap I/O) is built here and
//! shared through [`VirtualMemory`].

mod page_directory;
mod registry;
mod slot_bitmap;
pub mod swap;
mod victim;
mod vm;

pub use page_directory::{MapError, PageDirectory};
pub use registry::{PageDirEntry, PageDirRegistry};
pub use slot_bitmap::SlotBitmap;
pub use swap::{SwapError, SwapSlot, SwapStats, SwapStore};
pub use victim::{Victim, select_victim};
pub use vm::{FaultOutcome, VirtualMemory, VmError};

use fairos_abi::PAGE_SIZE;
use x86_64::{
    PhysAddr, VirtAddr,
    structures::paging::{Page, PhysFrame},
};

/// Source of 4 KiB physical frames.
pub trait PageAllocator: Send + Sync {
    /// Allocate one frame, zero-filled if `zeroed` is set.
    fn allocate_page(&self, zeroed: bool) -> Option<PhysFrame>;

    /// Return a frame to the allocator.
    ///
    /// # Safety
    /// `frame` must have come from this allocator and must no longer be
    /// mapped or otherwise referenced.
    unsafe fn free_page(&self, frame: PhysFrame);

    /// Kernel virtual address through which physical memory at `phys` is
    /// reachable.
    fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr;
}

/// Byte view of a physical frame.
///
/// # Safety
/// The frame must be owned by the caller for the lifetime of the returned
/// reference, with no other live references to its contents.
pub unsafe fn frame_bytes<A: PageAllocator + ?Sized>(
    pages: &A,
    frame: PhysFrame,
) -> &mut [u8; PAGE_SIZE] {
    let virt = pages.phys_to_virt(frame.start_address());
    unsafe { &mut *virt.as_mut_ptr::<[u8; PAGE_SIZE]>() }
}

/// The page containing `addr`.
pub fn page_of(addr: VirtAddr) -> Page {
    Page::containing_address(addr)
}
