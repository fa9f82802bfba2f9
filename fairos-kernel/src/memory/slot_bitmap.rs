//! Free-slot bitmap for the swap device.
//!
//! One bit per page-sized group of sectors; a set bit means the slot is free.
//! Allocation is first-fit: words are scanned in order, skipping words with no
//! free bit, and the lowest free bit of the first non-empty word is taken.

use alloc::collections::TryReserveError;
use alloc::vec::Vec;

pub struct SlotBitmap {
    words: Vec<u64>,
    len: usize,
    free: usize,
}

impl SlotBitmap {
    /// A bitmap of `len` slots, all free.
    pub fn new_all_free(len: usize) -> Result<Self, TryReserveError> {
        let word_count = len.div_ceil(64);
        let mut words = Vec::new();
        words.try_reserve_exact(word_count)?;
        words.resize(word_count, u64::MAX);

        // Bits past `len` in the last word are kept clear so they never look free.
        let tail = len % 64;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }

        Ok(Self {
            words,
            len,
            free: len,
        })
    }

    /// Total number of slots.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    pub fn is_free(&self, slot: usize) -> bool {
        slot < self.len && self.words[slot / 64] & (1 << (slot % 64)) != 0
    }

    /// Claim the first free slot.
    pub fn allocate(&mut self) -> Option<usize> {
        let (word_index, word) = self
            .words
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != 0)?;
        let bit = word.trailing_zeros() as usize;
        *word &= !(1 << bit);
        self.free -= 1;
        Some(word_index * 64 + bit)
    }

    /// Mark `slot` free again.
    ///
    /// Panics if the slot is out of range or already free: either means the
    /// swap table and the bitmap disagree.
    pub fn release(&mut self, slot: usize) {
        assert!(slot < self.len, "swap slot {slot} out of range");
        let word = &mut self.words[slot / 64];
        let mask = 1 << (slot % 64);
        assert!(*word & mask == 0, "swap slot {slot} released twice");
        *word |= mask;
        self.free += 1;
    }

    /// Recount set bits. Used to check the cached free count.
    pub fn count_free_bits(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }
}
