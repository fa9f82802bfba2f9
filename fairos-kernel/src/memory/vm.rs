//! Fault-time virtual memory operations.
//!
//! [`VirtualMemory`] ties the frame allocator, the address-space registry,
//! the victim scan and the swap store together. The page-fault handler and
//! the process loader call into it; nothing here knows about ELF files or
//! system calls.

use alloc::sync::Arc;

use log::{debug, trace, warn};
use x86_64::VirtAddr;
use x86_64::structures::paging::{Page, PhysFrame};

use super::{
    MapError, PageAllocator, PageDirRegistry, PageDirectory, SwapError, SwapStore, Victim,
    select_victim,
};
use crate::devices::block::BlockDevice;
use crate::thread::ThreadId;
use crate::trace::SwapObserver;

/// Page-table levels below the root that a mapping may have to allocate.
const TABLE_LEVELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Bookkeeping storage could not grow.
    OutOfMemory,
    /// No frame is free and no resident page can be evicted.
    NoVictim,
    /// A frame freed by eviction was gone before it could be used.
    OutOfFrames,
    Map(MapError),
    Swap(SwapError),
}

impl From<MapError> for VmError {
    fn from(err: MapError) -> Self {
        VmError::Map(err)
    }
}

impl From<SwapError> for VmError {
    fn from(err: SwapError) -> Self {
        VmError::Swap(err)
    }
}

/// What a page fault turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page was in swap and is mapped again.
    SwappedIn,
    /// The page was never swapped out; the fault is the caller's to handle.
    NotSwapped,
}

pub struct VirtualMemory<D: BlockDevice> {
    pages: Arc<dyn PageAllocator>,
    registry: PageDirRegistry,
    swap: SwapStore<D>,
    kernel_root: Option<PhysFrame>,
}

impl<D: BlockDevice> VirtualMemory<D> {
    pub fn new(device: D, pages: Arc<dyn PageAllocator>) -> Result<Self, VmError> {
        let swap = SwapStore::init(device, pages.clone())?;
        Ok(Self {
            pages,
            registry: PageDirRegistry::new(),
            swap,
            kernel_root: None,
        })
    }

    /// Copy the kernel half of `root` into every address space created from
    /// now on.
    pub fn with_kernel_root(mut self, root: PhysFrame) -> Self {
        self.kernel_root = Some(root);
        self
    }

    pub fn with_swap_observer(mut self, observer: Arc<dyn SwapObserver>) -> Self {
        self.swap = self.swap.with_observer(observer);
        self
    }

    pub fn registry(&self) -> &PageDirRegistry {
        &self.registry
    }

    pub fn swap(&self) -> &SwapStore<D> {
        &self.swap
    }

    pub fn pages(&self) -> &Arc<dyn PageAllocator> {
        &self.pages
    }

    /// A view of the address space rooted at `root`.
    pub fn directory(&self, root: PhysFrame) -> PageDirectory<'_, dyn PageAllocator> {
        PageDirectory::open(root, &*self.pages)
    }

    /// Allocate an empty address space for `owner` and register it for
    /// eviction scanning.
    pub fn create_address_space(&self, owner: ThreadId) -> Result<PhysFrame, VmError> {
        let directory = match self.kernel_root {
            Some(kernel) => PageDirectory::create_with_kernel(&*self.pages, kernel)?,
            None => PageDirectory::create(&*self.pages)?,
        };
        let root = directory.root();
        if let Err(err) = self.registry.register(owner, root) {
            unsafe { directory.destroy() };
            return Err(err);
        }
        debug!("vm: address space {:#x} for thread {owner}", root.start_address().as_u64());
        Ok(root)
    }

    /// Map a zero-filled page at `page`, evicting other pages if no frame
    /// is free for it or for the page tables on the way to it.
    pub fn map_zeroed(
        &self,
        owner: ThreadId,
        root: PhysFrame,
        page: Page,
        writable: bool,
    ) -> Result<PhysFrame, VmError> {
        let frame = self.allocate_frame()?;
        let mut directory = self.directory(root);
        let mut reclaimed = 0;
        loop {
            let err = match directory.map(page, frame, writable) {
                Ok(()) => break,
                Err(err) => err,
            };
            // Tables allocated before the failure stay in place, so each
            // retry needs at most one more frame.
            if err == MapError::OutOfFrames && reclaimed < TABLE_LEVELS {
                reclaimed += 1;
                if let Err(err) = self.reclaim_frame() {
                    unsafe { self.pages.free_page(frame) };
                    return Err(err);
                }
                continue;
            }
            unsafe { self.pages.free_page(frame) };
            return Err(err.into());
        }
        trace!(
            "vm: thread {owner} zero page at {:#x}",
            page.start_address().as_u64()
        );
        Ok(frame)
    }

    /// A zeroed frame, evicting one resident page if the allocator is empty.
    pub fn allocate_frame(&self) -> Result<PhysFrame, VmError> {
        if let Some(frame) = self.pages.allocate_page(true) {
            return Ok(frame);
        }
        self.reclaim_frame()?;
        self.pages.allocate_page(true).ok_or(VmError::OutOfFrames)
    }

    /// Evict one page to swap, freeing its frame.
    ///
    /// The registry lock is held throughout, so the victim's address space
    /// cannot be torn down while its page is being written out. That includes
    /// the sector transfer, so registration and teardown elsewhere spin until
    /// the write completes.
    pub fn reclaim_frame(&self) -> Result<Victim, VmError> {
        let entries = self.registry.lock();
        let Some(victim) = select_victim(&entries, &*self.pages) else {
            warn!("vm: out of frames with nothing to evict");
            return Err(VmError::NoVictim);
        };
        self.swap.evict(victim.owner, victim.root, victim.page)?;
        drop(entries);
        Ok(victim)
    }

    /// Resolve a fault at `addr` in `owner`'s address space.
    pub fn handle_fault(
        &self,
        owner: ThreadId,
        root: PhysFrame,
        addr: VirtAddr,
    ) -> Result<FaultOutcome, VmError> {
        let restored = match self.swap.restore(owner, root, addr) {
            Err(SwapError::ResourceExhausted) => {
                self.reclaim_frame()?;
                self.swap.restore(owner, root, addr)?
            }
            result => result?,
        };
        Ok(if restored {
            FaultOutcome::SwappedIn
        } else {
            FaultOutcome::NotSwapped
        })
    }

    /// Release everything `owner`'s address space holds: its registration,
    /// its swap slots, its frames and its page tables. Returns the number of
    /// swap slots released.
    ///
    /// # Safety
    /// `root` must be `owner`'s address space, it must not be active on the
    /// CPU, and nothing may use it afterwards.
    pub unsafe fn teardown(&self, owner: ThreadId, root: PhysFrame) -> usize {
        self.registry.unregister(owner);
        let released = self.swap.release_all(owner);
        unsafe { self.directory(root).destroy() };
        debug!("vm: tore down address space of thread {owner}, {released} slots released");
        released
    }
}
