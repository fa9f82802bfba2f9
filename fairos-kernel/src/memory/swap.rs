//! Disk-backed swap store.
//!
//! The swap device is divided into slots of [`SECTORS_PER_PAGE`] contiguous
//! sectors, one page each. A [`SlotBitmap`] tracks which slots are free and a
//! table of records maps each evicted page, identified by its owner thread
//! and virtual page, to the slot holding its contents.
//!
//! Invariant: free slots plus recorded pages equals the slot count. Every
//! operation that changes one side changes the other under the same lock.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;

use fairos_abi::{SECTOR_SIZE, SECTORS_PER_PAGE};
use log::{debug, info, warn};
use spinning_top::Spinlock;
use x86_64::VirtAddr;
use x86_64::structures::paging::{Page, PageTableFlags, PhysFrame};

use super::{MapError, PageAllocator, PageDirectory, SlotBitmap, frame_bytes, page_of};
use crate::devices::block::{BlockDevice, BlockError};
use crate::thread::ThreadId;
use crate::trace::SwapObserver;

/// Errors from swap operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapError {
    /// The device cannot hold a single page.
    DeviceTooSmall,
    /// Every slot is in use.
    NoFreeSlot,
    /// The record table could not grow.
    NoRecordStorage,
    /// No frame was available to swap a page back into.
    ResourceExhausted,
    /// The page to evict is not resident.
    NotMapped,
    /// Remapping a swapped-in page failed.
    Map(MapError),
    /// The device reported an error.
    Io(BlockError),
}

impl From<BlockError> for SwapError {
    fn from(err: BlockError) -> Self {
        SwapError::Io(err)
    }
}

/// Index of a page-sized region of the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0
    }

    pub fn first_sector(self) -> u64 {
        (self.0 * SECTORS_PER_PAGE) as u64
    }

    /// Sectors backing this slot.
    pub fn sectors(self) -> Range<u64> {
        self.first_sector()..self.first_sector() + SECTORS_PER_PAGE as u64
    }
}

/// Snapshot of swap usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapStats {
    pub total_slots: usize,
    pub free_slots: usize,
    pub used_slots: usize,
    pub swapped_in: u64,
    pub swapped_out: u64,
    /// Slots freed because their owner exited.
    pub released: u64,
}

impl fmt::Display for SwapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Swap: {} of {} slots used, {} swapped out, {} swapped in, {} released",
            self.used_slots, self.total_slots, self.swapped_out, self.swapped_in, self.released
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SwapEntry {
    owner: ThreadId,
    page: Page,
    writable: bool,
    slot: SwapSlot,
}

struct SwapTable {
    slots: SlotBitmap,
    entries: Vec<SwapEntry>,
    swapped_in: u64,
    swapped_out: u64,
    released: u64,
}

pub struct SwapStore<D: BlockDevice> {
    device: D,
    pages: Arc<dyn PageAllocator>,
    /// Held across the sector transfers of `evict` and `restore`, so a slot
    /// is never reused while its page is in flight. A thread contending for
    /// it spins for up to one page of device I/O, and the lock does not mask
    /// interrupts: callers in interrupt context must not take it.
    table: Spinlock<SwapTable>,
    observer: Option<Arc<dyn SwapObserver>>,
}

impl<D: BlockDevice> SwapStore<D> {
    /// Bind `device` as the swap device, with every slot free.
    pub fn init(device: D, pages: Arc<dyn PageAllocator>) -> Result<Self, SwapError> {
        let sectors = device.sector_count();
        let slot_count = (sectors / SECTORS_PER_PAGE as u64) as usize;
        if slot_count == 0 {
            return Err(SwapError::DeviceTooSmall);
        }
        let slots = SlotBitmap::new_all_free(slot_count).map_err(|_| SwapError::NoRecordStorage)?;

        info!("swap: {slot_count} slots on {sectors} sectors");
        Ok(Self {
            device,
            pages,
            table: Spinlock::new(SwapTable {
                slots,
                entries: Vec::new(),
                swapped_in: 0,
                swapped_out: 0,
                released: 0,
            }),
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn SwapObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Write the resident page `page` of `owner`'s address space to swap,
    /// unmap it and free its frame.
    pub fn evict(&self, owner: ThreadId, root: PhysFrame, page: Page) -> Result<SwapSlot, SwapError> {
        let mut directory = PageDirectory::open(root, &*self.pages);
        let (frame, flags) = directory.translate(page).ok_or(SwapError::NotMapped)?;

        let mut table = self.table.lock();
        let slot = table.slots.allocate().map(SwapSlot).ok_or(SwapError::NoFreeSlot)?;
        if table.entries.try_reserve(1).is_err() {
            table.slots.release(slot.0);
            return Err(SwapError::NoRecordStorage);
        }

        // Unmapped first, so the owner cannot write to the page once the copy
        // has started.
        let writable = flags.contains(PageTableFlags::WRITABLE);
        directory.unmap(page);
        let bytes = unsafe { frame_bytes(&*self.pages, frame) };
        if let Err(err) = self.write_slot(slot, &bytes[..]) {
            table.slots.release(slot.0);
            warn!("swap: writing slot {} failed: {err:?}", slot.0);
            directory.map(page, frame, writable).map_err(SwapError::Map)?;
            return Err(err.into());
        }

        table.entries.push(SwapEntry {
            owner,
            page,
            writable,
            slot,
        });
        table.swapped_out += 1;
        drop(table);

        unsafe { self.pages.free_page(frame) };

        debug!(
            "swap: thread {owner} page {:#x} out to slot {}",
            page.start_address().as_u64(),
            slot.0
        );
        if let Some(observer) = &self.observer {
            observer.on_swap_out(owner, page, slot);
        }
        Ok(slot)
    }

    /// Bring the page containing `addr` back from swap if `owner` has it
    /// there.
    ///
    /// Returns `Ok(false)` if the page is not in swap. On success the page
    /// is mapped with its original writability and its slot is free again.
    pub fn restore(&self, owner: ThreadId, root: PhysFrame, addr: VirtAddr) -> Result<bool, SwapError> {
        let page = page_of(addr);
        let mut table = self.table.lock();
        let Some(index) = table
            .entries
            .iter()
            .position(|entry| entry.owner == owner && entry.page == page)
        else {
            return Ok(false);
        };
        let entry = table.entries[index];

        let frame = self
            .pages
            .allocate_page(false)
            .ok_or(SwapError::ResourceExhausted)?;
        let bytes = unsafe { frame_bytes(&*self.pages, frame) };
        if let Err(err) = self.read_slot(entry.slot, &mut bytes[..]) {
            unsafe { self.pages.free_page(frame) };
            warn!("swap: reading slot {} failed: {err:?}", entry.slot.0);
            return Err(err.into());
        }

        let mut directory = PageDirectory::open(root, &*self.pages);
        if let Err(err) = directory.map(page, frame, entry.writable) {
            unsafe { self.pages.free_page(frame) };
            return Err(SwapError::Map(err));
        }

        table.entries.swap_remove(index);
        table.slots.release(entry.slot.0);
        table.swapped_in += 1;
        drop(table);

        debug!(
            "swap: thread {owner} page {:#x} in from slot {}",
            page.start_address().as_u64(),
            entry.slot.0
        );
        if let Some(observer) = &self.observer {
            observer.on_swap_in(owner, page, entry.slot);
        }
        Ok(true)
    }

    /// Drop every record of `owner` and free its slots. Returns how many
    /// there were.
    pub fn release_all(&self, owner: ThreadId) -> usize {
        let mut table = self.table.lock();
        let SwapTable {
            slots,
            entries,
            released,
            ..
        } = &mut *table;

        let before = entries.len();
        entries.retain(|entry| {
            if entry.owner == owner {
                slots.release(entry.slot.0);
                false
            } else {
                true
            }
        });
        let count = before - entries.len();
        *released += count as u64;
        drop(table);

        if count > 0 {
            debug!("swap: released {count} slots of thread {owner}");
        }
        if let Some(observer) = &self.observer {
            observer.on_release(owner, count);
        }
        count
    }

    /// True if the page containing `addr` of `owner` is in swap.
    pub fn contains(&self, owner: ThreadId, addr: VirtAddr) -> bool {
        let page = page_of(addr);
        self.table
            .lock()
            .entries
            .iter()
            .any(|entry| entry.owner == owner && entry.page == page)
    }

    /// Slot holding the page containing `addr` of `owner`.
    pub fn slot_of(&self, owner: ThreadId, addr: VirtAddr) -> Option<SwapSlot> {
        let page = page_of(addr);
        self.table
            .lock()
            .entries
            .iter()
            .find(|entry| entry.owner == owner && entry.page == page)
            .map(|entry| entry.slot)
    }

    pub fn stats(&self) -> SwapStats {
        let table = self.table.lock();
        SwapStats {
            total_slots: table.slots.len(),
            free_slots: table.slots.free_count(),
            used_slots: table.entries.len(),
            swapped_in: table.swapped_in,
            swapped_out: table.swapped_out,
            released: table.released,
        }
    }

    /// Log a one-line usage summary.
    pub fn print_stats(&self) {
        info!("{}", self.stats());
    }

    /// Check that free slots plus recorded pages equals the slot count, and
    /// that no two records share a slot.
    pub fn accounting_holds(&self) -> bool {
        let table = self.table.lock();
        let slots = &table.slots;
        let balanced = slots.free_count() + table.entries.len() == slots.len()
            && slots.count_free_bits() == slots.free_count();

        let mut used: Vec<usize> = table.entries.iter().map(|entry| entry.slot.0).collect();
        used.sort_unstable();
        let distinct = used.windows(2).all(|pair| pair[0] != pair[1]);
        let allocated = used.iter().all(|&slot| !slots.is_free(slot));

        balanced && distinct && allocated
    }

    fn write_slot(&self, slot: SwapSlot, bytes: &[u8]) -> Result<(), BlockError> {
        for (sector, chunk) in slot.sectors().zip(bytes.chunks_exact(SECTOR_SIZE)) {
            self.device.write_sector(sector, chunk)?;
        }
        Ok(())
    }

    fn read_slot(&self, slot: SwapSlot, bytes: &mut [u8]) -> Result<(), BlockError> {
        for (sector, chunk) in slot.sectors().zip(bytes.chunks_exact_mut(SECTOR_SIZE)) {
            self.device.read_sector(sector, chunk)?;
        }
        Ok(())
    }
}
