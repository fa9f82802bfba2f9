//! Registry of live user address spaces.
//!
//! The eviction scan has to see every address space in the system, so each
//! process registers its page directory when it is created and removes it
//! before the directory is freed. Entries are kept in registration order;
//! that is the order the victim scan visits them.

use alloc::vec::Vec;
use core::ops::Deref;

use spinning_top::Spinlock;
use x86_64::structures::paging::PhysFrame;

use super::{PageAllocator, Victim, VmError, select_victim};
use crate::thread::ThreadId;

/// One registered address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDirEntry {
    pub owner: ThreadId,
    pub root: PhysFrame,
}

#[derive(Default)]
pub struct PageDirRegistry {
    /// Also held by `VirtualMemory::reclaim_frame` across the victim's swap
    /// write. Not for interrupt context.
    entries: Spinlock<Vec<PageDirEntry>>,
}

impl PageDirRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `root` as the address space of `owner`, replacing any earlier
    /// registration of the same owner.
    pub fn register(&self, owner: ThreadId, root: PhysFrame) -> Result<(), VmError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|entry| entry.owner == owner) {
            entry.root = root;
            return Ok(());
        }
        entries
            .try_reserve(1)
            .map_err(|_| VmError::OutOfMemory)?;
        entries.push(PageDirEntry { owner, root });
        Ok(())
    }

    /// Remove the registration of `owner`. Returns false if there was none.
    pub fn unregister(&self, owner: ThreadId) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|entry| entry.owner == owner) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, owner: ThreadId) -> Option<PhysFrame> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.owner == owner)
            .map(|entry| entry.root)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Pick a page to evict from any registered address space.
    pub fn select_victim<A: PageAllocator + ?Sized>(&self, pages: &A) -> Option<Victim> {
        select_victim(&self.entries.lock(), pages)
    }

    /// Hold the registry lock. No address space can be registered or
    /// removed until the guard is dropped.
    pub fn lock(&self) -> impl Deref<Target = Vec<PageDirEntry>> + '_ {
        self.entries.lock()
    }
}
