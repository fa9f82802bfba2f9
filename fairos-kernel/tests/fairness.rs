use std::sync::Arc;

use fairos_abi::{PRI_DEFAULT, PRI_MAX, PRI_MIN, TIME_SLICE_TICKS};
use fairos_kernel::Cpu;
use fairos_kernel::hosted::{HeapPageAllocator, SimCpu};
use fairos_kernel::memory::PageAllocator;
use fairos_kernel::thread::{Scheduler, SchedulerConfig, ThreadId, weight};
use fairos_kernel::trace::{TimedOp, Trace};

fn idle_loop(_: usize) {}

fn spin(_: usize) {}

/// Boot, spawn one CPU-bound thread per priority, and park main so only the
/// spawned threads compete.
fn contenders(priorities: &[u8]) -> (Scheduler<SimCpu>, Arc<Trace>, Vec<ThreadId>) {
    let pages: Arc<dyn PageAllocator> = Arc::new(HeapPageAllocator::new(16));
    let mut sched = Scheduler::init(SimCpu::new(), pages, SchedulerConfig::default());
    let trace = Arc::new(Trace::new());
    sched.set_observer(trace.clone());
    sched.start(idle_loop, 0).unwrap();

    let threads = priorities
        .iter()
        .map(|&priority| sched.create("spin", priority, spin, 0).unwrap())
        .collect();

    sched.cpu().disable_interrupts();
    sched.block();
    sched.cpu().enable_interrupts();
    (sched, trace, threads)
}

fn run(sched: &mut Scheduler<SimCpu>, ticks: u64) {
    for _ in 0..ticks {
        sched.timer_interrupt();
        assert!(sched.invariants_hold());
        assert!(sched.ready_queue().is_ordered());
    }
}

#[test]
fn extreme_priorities_over_a_thousand_ticks() {
    let (mut sched, trace, threads) = contenders(&[PRI_MIN, PRI_MAX]);
    let (low, high) = (threads[0], threads[1]);
    run(&mut sched, 1000);

    let low_trace = trace.thread(low).unwrap();
    let high_trace = trace.thread(high).unwrap();

    // `low` runs one slice, then `high` needs 256 slices to catch up.
    assert_eq!(low_trace.runtime, TIME_SLICE_TICKS as u64);
    assert_eq!(high_trace.runtime, 1000 - TIME_SLICE_TICKS as u64);
    assert_eq!(low_trace.vruntime, low_trace.runtime * weight(PRI_MIN));
    assert_eq!(high_trace.vruntime, high_trace.runtime * weight(PRI_MAX));
    assert_eq!(sched.current(), high);

    for row in trace.fairness_report(1000, &threads) {
        assert!(row.error.abs() < 1.0, "{row:?}");
    }
}

#[test]
fn equal_priorities_share_evenly() {
    let (mut sched, trace, threads) = contenders(&[PRI_DEFAULT; 3]);
    run(&mut sched, 1200);

    for id in &threads {
        let thread = trace.thread(*id).unwrap();
        assert_eq!(thread.runtime, 400);
        // Round robin in 4-tick slices never leaves a thread more than two
        // thirds of a slice away from its ideal share.
        assert!((thread.ideal_runtime - 400.0).abs() < 1e-6, "{thread:?}");
        assert!(thread.max_lag < 4.0, "{thread:?}");
        assert!(thread.lag_samples > 0);
    }
}

#[test]
fn runtime_converges_to_weighted_share() {
    let (mut sched, trace, threads) = contenders(&[31, 35, 40]);
    let duration = 4000;
    run(&mut sched, duration);

    let report = trace.fairness_report(duration, &threads);
    let total: u64 = report.iter().map(|row| row.runtime).sum();
    assert_eq!(total, duration);

    // Virtual runtimes never drift more than one slice of the heaviest
    // thread apart, which bounds each thread's lag.
    let bound = TIME_SLICE_TICKS as f64 * weight(31) as f64 / weight(40) as f64;
    for row in &report {
        assert!(row.error.abs() <= bound, "{row:?} exceeds {bound}");
    }
    assert!(report[2].runtime > report[1].runtime);
    assert!(report[1].runtime > report[0].runtime);
}

#[test]
fn ready_depth_is_sampled() {
    let (mut sched, trace, _threads) = contenders(&[PRI_DEFAULT, PRI_DEFAULT]);
    run(&mut sched, 40);

    let depth = trace.ready_depth();
    assert!(depth.count > 0);
    assert_eq!(depth.min, 1);
    assert_eq!(depth.max, 2);
    assert!(trace.dispatches() >= 10);
}

#[test]
fn dispatch_and_insertion_are_timed() {
    let (mut sched, trace, _threads) = contenders(&[PRI_DEFAULT, PRI_DEFAULT]);
    let before = trace.timing(TimedOp::Schedule).count;
    sched.cpu().set_cycle_step(7);
    run(&mut sched, 8);

    // Two slices end, each with one insertion and one dispatch.
    let schedule = trace.timing(TimedOp::Schedule);
    assert_eq!(schedule.count, before + 2);
    assert_eq!(schedule.max, 7);
    let insert = trace.timing(TimedOp::ReadyInsert);
    assert_eq!(insert.max, 7);
    assert!(insert.count >= 2);
}
