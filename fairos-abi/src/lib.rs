//! Definitions shared between the kernel and its collaborators.
//!
//! Priority bounds and the thread-name limit are part of the user-visible
//! contract (the priority syscalls validate against them); page and sector
//! geometry is shared with the block-device and loader code.

#![no_std]

// =============================================================================
// Thread priorities
// =============================================================================

/// Lowest priority. Threads at this priority accrue virtual runtime fastest.
pub const PRI_MIN: u8 = 0;
/// Priority given to the initial thread and to most kernel threads.
pub const PRI_DEFAULT: u8 = 31;
/// Highest priority.
pub const PRI_MAX: u8 = 63;

/// Number of distinct priority levels.
pub const PRI_LEVELS: usize = PRI_MAX as usize - PRI_MIN as usize + 1;

/// Returns true if `priority` lies in `PRI_MIN..=PRI_MAX`.
pub const fn is_valid_priority(priority: u8) -> bool {
    matches!(priority, PRI_MIN..=PRI_MAX)
}

/// Maximum number of bytes kept from a thread name.
pub const THREAD_NAME_MAX: usize = 15;

// =============================================================================
// Scheduling
// =============================================================================

/// Timer ticks a thread may run before it is asked to yield.
pub const TIME_SLICE_TICKS: u32 = 4;

// =============================================================================
// Memory geometry
// =============================================================================

/// Size of a page and of a physical frame.
pub const PAGE_SIZE: usize = 4096;

/// Size of a block-device sector.
pub const SECTOR_SIZE: usize = 512;

/// Contiguous sectors that hold one swapped-out page.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;
