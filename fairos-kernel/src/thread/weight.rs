//! Priority-to-weight table.
//!
//! A thread's virtual runtime grows by `elapsed_ticks * weight(priority)`.
//! Weights fall roughly 9% per level, from 2560 at `PRI_MIN` to 10 at
//! `PRI_MAX`, so each step up in priority buys about 10% more CPU relative
//! to the level below.

use fairos_abi::{PRI_LEVELS, PRI_MIN, is_valid_priority};

const PRIORITY_TO_WEIGHT: [u64; PRI_LEVELS] = [
    2560, 2344, 2147, 1966, 1800, 1649, 1510, 1382, //
    1266, 1159, 1062, 972, 890, 815, 747, 684, //
    626, 573, 525, 481, 440, 403, 369, 338, //
    310, 284, 260, 238, 218, 199, 183, 167, //
    153, 140, 128, 118, 108, 99, 90, 83, //
    76, 69, 63, 58, 53, 49, 45, 41, //
    37, 34, 31, 29, 26, 24, 22, 20, //
    19, 17, 16, 14, 13, 12, 11, 10, //
];

/// Weight of `priority`.
///
/// Panics on a priority outside `PRI_MIN..=PRI_MAX`.
pub fn weight(priority: u8) -> u64 {
    assert!(is_valid_priority(priority), "priority {priority} out of range");
    PRIORITY_TO_WEIGHT[(priority - PRI_MIN) as usize]
}

/// CPU share of `priority` relative to a `PRI_MIN` thread.
///
/// Under weighted-fair scheduling a thread's share of the CPU is proportional
/// to this value.
pub fn relative_share(priority: u8) -> f64 {
    weight(PRI_MIN) as f64 / weight(priority) as f64
}
