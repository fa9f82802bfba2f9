//! Software stand-ins for the hardware beneath the scheduler and VM.
//!
//! Compiled for unit tests and with the `testing` feature. None of this runs
//! on bare metal.

use alloc::alloc::{Layout, alloc, alloc_zeroed, dealloc};
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::cell::Cell;

use fairos_abi::{PAGE_SIZE, SECTOR_SIZE};
use spinning_top::Spinlock;
use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr, VirtAddr};

use crate::arch::Cpu;
use crate::devices::block::{BlockDevice, BlockError, check_transfer};
use crate::memory::PageAllocator;
use crate::thread::{SavedContext, Scheduler, ThreadId, read_initial_frame};

/// Return address given to primed stacks. Never executed.
pub const SIM_TRAMPOLINE: u64 = 0xffff_8000_0000_1000;

/// A thread's first dispatch, decoded from its primed stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Launch {
    pub thread: ThreadId,
    pub entry: usize,
    pub arg: usize,
    pub trampoline: u64,
}

/// CPU whose switch primitive returns at once.
///
/// After `switch_context` the caller carries on as the thread it switched
/// to, so a test drives whichever thread the scheduler says is running.
pub struct SimCpu {
    interrupts: Cell<bool>,
    in_handler: Cell<bool>,
    cycles: Cell<u64>,
    cycle_step: Cell<u64>,
    switches: Vec<(ThreadId, ThreadId)>,
    launches: Vec<Launch>,
    address_space: Option<PhysAddr>,
}

impl SimCpu {
    /// Interrupts start masked, as they are at boot.
    pub fn new() -> Self {
        Self {
            interrupts: Cell::new(false),
            in_handler: Cell::new(false),
            cycles: Cell::new(0),
            cycle_step: Cell::new(0),
            switches: Vec::new(),
            launches: Vec::new(),
            address_space: None,
        }
    }

    pub fn set_in_interrupt(&self, in_handler: bool) {
        self.in_handler.set(in_handler);
    }

    /// Set the cycle counter.
    pub fn set_cycles(&self, cycles: u64) {
        self.cycles.set(cycles);
    }

    /// Advance the cycle counter by `step` after every read, so each timed
    /// operation appears to take `step` cycles. Zero (the default) freezes it.
    pub fn set_cycle_step(&self, step: u64) {
        self.cycle_step.set(step);
    }

    /// Every `(prev, next)` pair passed to the switch primitive.
    pub fn switches(&self) -> &[(ThreadId, ThreadId)] {
        &self.switches
    }

    /// First dispatches, in order.
    pub fn launches(&self) -> &[Launch] {
        &self.launches
    }

    /// Root of the active address space, `None` for kernel-only.
    pub fn address_space(&self) -> Option<PhysAddr> {
        self.address_space
    }
}

impl Default for SimCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu for SimCpu {
    fn interrupts_enabled(&self) -> bool {
        self.interrupts.get()
    }

    fn enable_interrupts(&self) {
        self.interrupts.set(true);
    }

    fn disable_interrupts(&self) {
        self.interrupts.set(false);
    }

    fn in_interrupt_context(&self) -> bool {
        self.in_handler.get()
    }

    unsafe fn switch_context(
        &mut self,
        prev: ThreadId,
        save: &mut SavedContext,
        next: ThreadId,
        load: &SavedContext,
    ) -> ThreadId {
        assert!(!self.interrupts.get(), "switch with interrupts enabled");
        self.switches.push((prev, next));

        // A primed stack is resumed exactly once; afterwards the saved
        // context is the zero value written below.
        if load.rsp != 0 {
            let frame = unsafe { read_initial_frame(load) };
            self.launches.push(Launch {
                thread: next,
                entry: frame.entry(),
                arg: frame.arg(),
                trampoline: frame.rip,
            });
        }
        *save = SavedContext::default();
        prev
    }

    fn cycles(&self) -> u64 {
        let now = self.cycles.get();
        self.cycles.set(now.wrapping_add(self.cycle_step.get()));
        now
    }

    fn thread_entry_trampoline(&self) -> u64 {
        SIM_TRAMPOLINE
    }

    fn activate_address_space(&mut self, root: Option<PhysAddr>) {
        self.address_space = root;
    }
}

impl Scheduler<SimCpu> {
    /// Deliver one timer interrupt: tick in interrupt context, then take the
    /// requested yield on the way out. Returns true if the running thread
    /// was preempted.
    pub fn timer_interrupt(&mut self) -> bool {
        let level = self.cpu().mask_interrupts();
        self.cpu().set_in_interrupt(true);
        self.tick();
        self.cpu().set_in_interrupt(false);
        let preempted = self.preempt_if_requested();
        self.cpu().restore_interrupts(level);
        preempted
    }
}

fn page_layout() -> Layout {
    match Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
        Ok(layout) => layout,
        Err(_) => unreachable!("page layout is valid"),
    }
}

struct HeapFrames {
    capacity: usize,
    live: BTreeSet<u64>,
}

/// Frame allocator backed by page-aligned heap blocks.
///
/// Physical and virtual addresses coincide. At most `capacity` frames are
/// live at once; frames still live when the allocator drops are freed.
pub struct HeapPageAllocator {
    frames: Spinlock<HeapFrames>,
}

impl HeapPageAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Spinlock::new(HeapFrames {
                capacity,
                live: BTreeSet::new(),
            }),
        }
    }

    /// Frames currently allocated.
    pub fn in_use(&self) -> usize {
        self.frames.lock().live.len()
    }

    pub fn capacity(&self) -> usize {
        self.frames.lock().capacity
    }

    /// Change the limit. Frames already allocated stay valid.
    pub fn set_capacity(&self, capacity: usize) {
        self.frames.lock().capacity = capacity;
    }

    /// Frames that can still be allocated.
    pub fn available(&self) -> usize {
        let frames = self.frames.lock();
        frames.capacity.saturating_sub(frames.live.len())
    }
}

impl PageAllocator for HeapPageAllocator {
    fn allocate_page(&self, zeroed: bool) -> Option<PhysFrame> {
        let mut frames = self.frames.lock();
        if frames.live.len() >= frames.capacity {
            return None;
        }

        let ptr = unsafe {
            if zeroed {
                alloc_zeroed(page_layout())
            } else {
                let ptr = alloc(page_layout());
                // Garbage, so readers of unzeroed frames notice.
                if !ptr.is_null() {
                    ptr.write_bytes(0xa5, PAGE_SIZE);
                }
                ptr
            }
        };
        if ptr.is_null() {
            return None;
        }

        let addr = ptr as u64;
        frames.live.insert(addr);
        Some(PhysFrame::containing_address(PhysAddr::new(addr)))
    }

    unsafe fn free_page(&self, frame: PhysFrame) {
        let addr = frame.start_address().as_u64();
        let removed = self.frames.lock().live.remove(&addr);
        assert!(removed, "frame {addr:#x} freed twice or never allocated");
        unsafe { dealloc(addr as *mut u8, page_layout()) };
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
        VirtAddr::new(phys.as_u64())
    }
}

impl Drop for HeapPageAllocator {
    fn drop(&mut self) {
        for addr in core::mem::take(&mut self.frames.get_mut().live) {
            unsafe { dealloc(addr as *mut u8, page_layout()) };
        }
    }
}

struct DiskState {
    sectors: BTreeMap<u64, [u8; SECTOR_SIZE]>,
    fail_reads: bool,
    fail_writes: bool,
    reads: u64,
    writes: u64,
}

/// In-memory block device. Unwritten sectors read as zero.
pub struct MemDisk {
    sector_count: u64,
    state: Spinlock<DiskState>,
}

impl MemDisk {
    pub fn new(sector_count: u64) -> Self {
        Self {
            sector_count,
            state: Spinlock::new(DiskState {
                sectors: BTreeMap::new(),
                fail_reads: false,
                fail_writes: false,
                reads: 0,
                writes: 0,
            }),
        }
    }

    /// Make every read fail with [`BlockError::IoError`] until cleared.
    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Make every write fail with [`BlockError::IoError`] until cleared.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Sectors read and written so far.
    pub fn io_counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.reads, state.writes)
    }

    /// Contents of `sector`.
    pub fn sector(&self, sector: u64) -> [u8; SECTOR_SIZE] {
        self.state
            .lock()
            .sectors
            .get(&sector)
            .copied()
            .unwrap_or([0; SECTOR_SIZE])
    }
}

impl BlockDevice for MemDisk {
    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        check_transfer(self, sector, buf.len())?;
        let mut state = self.state.lock();
        if state.fail_reads {
            return Err(BlockError::IoError);
        }
        state.reads += 1;
        match state.sectors.get(&sector) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<(), BlockError> {
        check_transfer(self, sector, buf.len())?;
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(BlockError::IoError);
        }
        state.writes += 1;
        let mut data = [0; SECTOR_SIZE];
        data.copy_from_slice(buf);
        state.sectors.insert(sector, data);
        Ok(())
    }
}
