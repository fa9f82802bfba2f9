//! Optional instrumentation for the scheduler and the swap store.
//!
//! Both subsystems accept an observer at construction time and call it at
//! their decision points. [`Trace`] is the stock collector: it keeps
//! per-thread dispatch and runtime counts, cycle timings of dispatch and
//! ready-queue insertion, ready-queue depth statistics and swap counters. It
//! also follows each thread's ideal weighted-fair runtime as the run goes,
//! recording how far actual runtime strays from it.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spinning_top::Spinlock;
use x86_64::structures::paging::Page;

use crate::memory::SwapSlot;
use crate::thread::{ThreadId, relative_share};

/// Scheduler operations timed in CPU cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedOp {
    /// From the start of a dispatch until the next thread has switched in.
    Schedule,
    /// Inserting a thread into the ready queue.
    ReadyInsert,
}

/// Scheduler events.
pub trait SchedObserver: Send + Sync {
    fn on_create(&self, _thread: ThreadId, _priority: u8) {}

    /// `elapsed` ticks were charged to `thread`, bringing its virtual runtime
    /// to `vruntime`.
    fn on_charge(&self, _thread: ThreadId, _priority: u8, _elapsed: u64, _vruntime: u64) {}

    /// `elapsed` ticks passed with `runnable` (the charged thread first, then
    /// the ready queue front to back, as `(thread, priority)`) competing for
    /// the CPU. Not reported for the idle thread.
    fn on_elapsed(&self, _elapsed: u64, _runnable: &[(ThreadId, u8)]) {}

    /// `op` took `cycles` CPU cycles.
    fn on_timing(&self, _op: TimedOp, _cycles: u64) {}

    /// `thread` entered the ready queue, which now holds `depth` threads.
    fn on_ready_insert(&self, _thread: ThreadId, _depth: usize) {}

    fn on_dispatch(&self, _prev: ThreadId, _next: ThreadId) {}

    fn on_exit(&self, _thread: ThreadId) {}
}

/// Swap store events.
pub trait SwapObserver: Send + Sync {
    fn on_swap_out(&self, _owner: ThreadId, _page: Page, _slot: SwapSlot) {}

    fn on_swap_in(&self, _owner: ThreadId, _page: Page, _slot: SwapSlot) {}

    fn on_release(&self, _owner: ThreadId, _count: usize) {}
}

/// Running total/count/min/max of a sampled quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleStats {
    pub total: u64,
    pub count: u64,
    pub min: u64,
    pub max: u64,
}

impl Default for SampleStats {
    fn default() -> Self {
        Self {
            total: 0,
            count: 0,
            min: u64::MAX,
            max: 0,
        }
    }
}

impl SampleStats {
    pub fn record(&mut self, value: u64) {
        self.total += value;
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total as f64 / self.count as f64)
    }
}

/// Per-thread counters kept by [`Trace`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThreadTrace {
    pub priority: u8,
    pub dispatches: u64,
    pub runtime: u64,
    pub vruntime: u64,
    /// Ticks the thread would have run under ideal weighted sharing of the
    /// periods it was runnable.
    pub ideal_runtime: f64,
    /// Largest and smallest `|ideal_runtime - runtime|` seen at a charge.
    pub max_lag: f64,
    pub min_lag: f64,
    pub lag_samples: u64,
    pub exited: bool,
    pub swapped_out: u64,
    pub swapped_in: u64,
    pub released: u64,
}

impl ThreadTrace {
    /// `ideal_runtime - runtime`; positive when the thread is behind.
    pub fn lag(&self) -> f64 {
        self.ideal_runtime - self.runtime as f64
    }

    fn record_lag(&mut self) {
        let lag = self.lag().abs();
        if self.lag_samples == 0 {
            self.max_lag = lag;
            self.min_lag = lag;
        } else {
            self.max_lag = self.max_lag.max(lag);
            self.min_lag = self.min_lag.min(lag);
        }
        self.lag_samples += 1;
    }
}

/// One line of [`Trace::fairness_report`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FairnessRow {
    pub thread: ThreadId,
    pub priority: u8,
    pub vruntime: u64,
    pub runtime: u64,
    /// Ticks the thread would have received under ideal weighted sharing.
    pub expected: f64,
    /// `expected - runtime`.
    pub error: f64,
}

#[derive(Default)]
struct TraceState {
    threads: BTreeMap<ThreadId, ThreadTrace>,
    ready_depth: SampleStats,
    schedule_cycles: SampleStats,
    insert_cycles: SampleStats,
    dispatches: u64,
    swapped_out: u64,
    swapped_in: u64,
    released: u64,
}

/// Collector for scheduler and swap events.
#[derive(Default)]
pub struct Trace {
    state: Spinlock<TraceState>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread(&self, thread: ThreadId) -> Option<ThreadTrace> {
        self.state.lock().threads.get(&thread).copied()
    }

    /// Ready-queue depth seen at each insertion.
    pub fn ready_depth(&self) -> SampleStats {
        self.state.lock().ready_depth
    }

    /// Cycle timings of `op`.
    pub fn timing(&self, op: TimedOp) -> SampleStats {
        let state = self.state.lock();
        match op {
            TimedOp::Schedule => state.schedule_cycles,
            TimedOp::ReadyInsert => state.insert_cycles,
        }
    }

    /// Context switches observed.
    pub fn dispatches(&self) -> u64 {
        self.state.lock().dispatches
    }

    /// Swap-outs, swap-ins and bulk-released slots observed.
    pub fn swap_counts(&self) -> (u64, u64, u64) {
        let state = self.state.lock();
        (state.swapped_out, state.swapped_in, state.released)
    }

    /// Compare each thread's CPU time over a window of `duration` ticks
    /// against its weighted-fair share among `threads`.
    ///
    /// The expected time of thread i is
    /// `duration * share(p_i) / sum_j share(p_j)`, where `share` is the
    /// priority's CPU share relative to a `PRI_MIN` thread.
    pub fn fairness_report(&self, duration: u64, threads: &[ThreadId]) -> Vec<FairnessRow> {
        let state = self.state.lock();
        let traced: Vec<(ThreadId, ThreadTrace)> = threads
            .iter()
            .filter_map(|id| state.threads.get(id).map(|trace| (*id, *trace)))
            .collect();
        let total_share: f64 = traced
            .iter()
            .map(|(_, trace)| relative_share(trace.priority))
            .sum();

        traced
            .into_iter()
            .map(|(thread, trace)| {
                let expected = duration as f64 * relative_share(trace.priority) / total_share;
                FairnessRow {
                    thread,
                    priority: trace.priority,
                    vruntime: trace.vruntime,
                    runtime: trace.runtime,
                    expected,
                    error: expected - trace.runtime as f64,
                }
            })
            .collect()
    }
}

impl SchedObserver for Trace {
    fn on_create(&self, thread: ThreadId, priority: u8) {
        self.state.lock().threads.insert(
            thread,
            ThreadTrace {
                priority,
                ..ThreadTrace::default()
            },
        );
    }

    fn on_charge(&self, thread: ThreadId, priority: u8, elapsed: u64, vruntime: u64) {
        let mut state = self.state.lock();
        let trace = state.threads.entry(thread).or_default();
        trace.priority = priority;
        trace.runtime += elapsed;
        trace.vruntime = vruntime;
    }

    fn on_elapsed(&self, elapsed: u64, runnable: &[(ThreadId, u8)]) {
        if runnable.is_empty() {
            return;
        }
        let total_share: f64 = runnable
            .iter()
            .map(|&(_, priority)| relative_share(priority))
            .sum();

        let mut state = self.state.lock();
        for &(thread, priority) in runnable {
            let trace = state.threads.entry(thread).or_default();
            trace.ideal_runtime += elapsed as f64 * relative_share(priority) / total_share;
            trace.record_lag();
        }
    }

    fn on_timing(&self, op: TimedOp, cycles: u64) {
        let mut state = self.state.lock();
        match op {
            TimedOp::Schedule => state.schedule_cycles.record(cycles),
            TimedOp::ReadyInsert => state.insert_cycles.record(cycles),
        }
    }

    fn on_ready_insert(&self, _thread: ThreadId, depth: usize) {
        self.state.lock().ready_depth.record(depth as u64);
    }

    fn on_dispatch(&self, _prev: ThreadId, next: ThreadId) {
        let mut state = self.state.lock();
        state.dispatches += 1;
        state.threads.entry(next).or_default().dispatches += 1;
    }

    fn on_exit(&self, thread: ThreadId) {
        self.state.lock().threads.entry(thread).or_default().exited = true;
    }
}

impl SwapObserver for Trace {
    fn on_swap_out(&self, owner: ThreadId, _page: Page, _slot: SwapSlot) {
        let mut state = self.state.lock();
        state.swapped_out += 1;
        state.threads.entry(owner).or_default().swapped_out += 1;
    }

    fn on_swap_in(&self, owner: ThreadId, _page: Page, _slot: SwapSlot) {
        let mut state = self.state.lock();
        state.swapped_in += 1;
        state.threads.entry(owner).or_default().swapped_in += 1;
    }

    fn on_release(&self, owner: ThreadId, count: usize) {
        let mut state = self.state.lock();
        state.released += count as u64;
        state.threads.entry(owner).or_default().released += count as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fairos_abi::{PRI_DEFAULT, PRI_MAX, PRI_MIN};

    #[test]
    fn sample_stats_track_extremes() {
        let mut stats = SampleStats::default();
        assert_eq!(stats.mean(), None);
        for value in [4, 1, 9] {
            stats.record(value);
        }
        assert_eq!((stats.min, stats.max, stats.count, stats.total), (1, 9, 3, 14));
        assert_eq!(stats.mean(), Some(14.0 / 3.0));
    }

    #[test]
    fn fairness_report_splits_by_share() {
        let trace = Trace::new();
        let low = ThreadId::from_raw(1);
        let high = ThreadId::from_raw(2);
        trace.on_create(low, PRI_MIN);
        trace.on_create(high, PRI_MAX);
        trace.on_charge(low, PRI_MIN, 1, 2560);
        trace.on_charge(high, PRI_MAX, 256, 2560);

        let report = trace.fairness_report(257, &[low, high]);
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].expected, 1.0);
        assert_eq!(report[1].expected, 256.0);
        assert_eq!(report[1].error, 0.0);
    }

    #[test]
    fn ideal_runtime_follows_runnable_set() {
        let trace = Trace::new();
        let a = ThreadId::from_raw(1);
        let b = ThreadId::from_raw(2);

        // `a` runs 4 ticks while `b` waits; each was owed 2.
        trace.on_charge(a, PRI_DEFAULT, 4, 668);
        trace.on_elapsed(4, &[(a, PRI_DEFAULT), (b, PRI_DEFAULT)]);
        let ta = trace.thread(a).unwrap();
        let tb = trace.thread(b).unwrap();
        assert_eq!((ta.ideal_runtime, ta.lag()), (2.0, -2.0));
        assert_eq!((tb.ideal_runtime, tb.lag()), (2.0, 2.0));

        // `b` then runs 4 ticks alone and is still 2 behind.
        trace.on_charge(b, PRI_DEFAULT, 4, 668);
        trace.on_elapsed(4, &[(b, PRI_DEFAULT)]);
        let tb = trace.thread(b).unwrap();
        assert_eq!(tb.ideal_runtime, 6.0);
        assert_eq!((tb.max_lag, tb.min_lag, tb.lag_samples), (2.0, 2.0, 2));
    }

    #[test]
    fn ideal_runtime_is_weighted() {
        let trace = Trace::new();
        let low = ThreadId::from_raw(1);
        let high = ThreadId::from_raw(2);
        trace.on_elapsed(257, &[(low, PRI_MIN), (high, PRI_MAX)]);
        assert_eq!(trace.thread(low).unwrap().ideal_runtime, 1.0);
        assert_eq!(trace.thread(high).unwrap().ideal_runtime, 256.0);
        trace.on_elapsed(3, &[]);
    }

    #[test]
    fn timings_are_kept_per_operation() {
        let trace = Trace::new();
        trace.on_timing(TimedOp::Schedule, 120);
        trace.on_timing(TimedOp::Schedule, 80);
        trace.on_timing(TimedOp::ReadyInsert, 15);

        let schedule = trace.timing(TimedOp::Schedule);
        assert_eq!((schedule.count, schedule.min, schedule.max), (2, 80, 120));
        assert_eq!(schedule.mean(), Some(100.0));
        assert_eq!(trace.timing(TimedOp::ReadyInsert).total, 15);
    }
}
