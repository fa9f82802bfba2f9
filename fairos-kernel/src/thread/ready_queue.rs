//! Run queue ordered by virtual runtime.

use alloc::collections::BTreeMap;

use super::ThreadId;

/// Position of a thread in the ready queue.
///
/// Ordering is by virtual runtime, then by insertion sequence, so threads with
/// equal virtual runtime leave the queue in the order they entered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReadyKey {
    vruntime: u64,
    seq: u64,
}

impl ReadyKey {
    pub fn vruntime(&self) -> u64 {
        self.vruntime
    }
}

#[derive(Default)]
pub struct ReadyQueue {
    queue: BTreeMap<ReadyKey, ThreadId>,
    next_seq: u64,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `thread` behind every queued thread whose virtual runtime is
    /// less than or equal to `vruntime`. Returns the key, which the caller
    /// needs to remove the thread before it reaches the front.
    pub fn insert(&mut self, thread: ThreadId, vruntime: u64) -> ReadyKey {
        let key = ReadyKey {
            vruntime,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.queue.insert(key, thread);
        key
    }

    /// Remove and return the thread with the least virtual runtime.
    pub fn pop_min(&mut self) -> Option<ThreadId> {
        self.queue.pop_first().map(|(_, thread)| thread)
    }

    pub fn remove(&mut self, key: ReadyKey) -> Option<ThreadId> {
        self.queue.remove(&key)
    }

    /// Least queued virtual runtime.
    pub fn min_vruntime(&self) -> Option<u64> {
        self.queue.first_key_value().map(|(key, _)| key.vruntime)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queued threads, front first, with their virtual runtime.
    pub fn iter(&self) -> impl Iterator<Item = (ThreadId, u64)> + '_ {
        self.queue
            .iter()
            .map(|(key, thread)| (*thread, key.vruntime))
    }

    /// True if every adjacent pair is in non-decreasing virtual runtime order.
    pub fn is_ordered(&self) -> bool {
        let mut previous = 0;
        self.iter().all(|(_, vruntime)| {
            let ordered = previous <= vruntime;
            previous = vruntime;
            ordered
        })
    }

    /// Drop every entry. Used when virtual runtimes are rebased.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
