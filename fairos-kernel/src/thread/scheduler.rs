//! Weighted-fair scheduler core.
//!
//! Every runnable thread sits in the [`ReadyQueue`] keyed by its virtual
//! runtime. When the running thread gives up the CPU (yield, preemption,
//! block or exit) it is charged `elapsed_ticks * weight(priority)`, and the
//! thread with the least virtual runtime runs next. The idle thread is never
//! queued; it runs only when the queue is empty.
//!
//! All state is protected by masking interrupts. Operations that can be
//! reached from both thread and interrupt context mask and restore; the
//! rest assert the mask state they require.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use fairos_abi::{PRI_DEFAULT, PRI_MIN, TIME_SLICE_TICKS, is_valid_priority};
use log::{debug, info};
use x86_64::structures::paging::PhysFrame;

use super::{
    KernelStack, ReadyQueue, Thread, ThreadError, ThreadFn, ThreadId, ThreadStatus, weight,
};
use crate::arch::{Cpu, IntrLevel};
use crate::memory::PageAllocator;
use crate::trace::{SchedObserver, TimedOp};

/// Virtual runtime given to a newly created thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VruntimeSeed {
    /// Start at the least virtual runtime among the running and ready
    /// threads, so the newcomer neither starves nor monopolizes the CPU.
    #[default]
    InheritMinimum,
    /// Reset every thread's virtual runtime to zero, newcomer included.
    ResetAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Timer ticks a thread may run before it is asked to yield.
    pub time_slice: u32,
    pub vruntime_seed: VruntimeSeed,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            time_slice: TIME_SLICE_TICKS,
            vruntime_seed: VruntimeSeed::default(),
        }
    }
}

/// Timer tick accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Ticks spent in the idle thread.
    pub idle_ticks: u64,
    /// Ticks spent in kernel threads.
    pub kernel_ticks: u64,
    /// Ticks spent in threads with a user address space.
    pub user_ticks: u64,
    /// Context switches performed.
    pub dispatches: u64,
}

impl TickStats {
    pub fn total_ticks(&self) -> u64 {
        self.idle_ticks + self.kernel_ticks + self.user_ticks
    }
}

impl fmt::Display for TickStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Thread: {} idle ticks, {} kernel ticks, {} user ticks",
            self.idle_ticks, self.kernel_ticks, self.user_ticks
        )
    }
}

pub struct Scheduler<C: Cpu> {
    cpu: C,
    pages: Arc<dyn PageAllocator>,
    config: SchedulerConfig,
    /// Every live thread. A thread leaves on exit.
    threads: BTreeMap<ThreadId, Thread>,
    /// Thread that has exited but whose stack is still in use until the
    /// next dispatch completes.
    dying: Option<Thread>,
    ready: ReadyQueue,
    current: ThreadId,
    idle: Option<ThreadId>,
    next_tid: u32,
    /// Ticks since the running thread was dispatched.
    slice_ticks: u32,
    /// Tick count at which the running thread was last charged.
    charged_at: u64,
    yield_on_return: bool,
    /// Cycle count at the start of the dispatch in progress, when observed.
    schedule_started: Option<u64>,
    stats: TickStats,
    observer: Option<Arc<dyn SchedObserver>>,
}

impl<C: Cpu> Scheduler<C> {
    /// Turn the code that is running into the initial thread.
    ///
    /// Interrupts must be masked. Nothing else in this module may be used
    /// before `init`.
    pub fn init(cpu: C, pages: Arc<dyn PageAllocator>, config: SchedulerConfig) -> Self {
        assert_eq!(cpu.interrupt_level(), IntrLevel::Off);
        assert!(config.time_slice > 0, "time slice must be at least one tick");

        let mut scheduler = Self {
            cpu,
            pages,
            config,
            threads: BTreeMap::new(),
            dying: None,
            ready: ReadyQueue::new(),
            current: ThreadId::from_raw(0),
            idle: None,
            next_tid: 1,
            slice_ticks: 0,
            charged_at: 0,
            yield_on_return: false,
            schedule_started: None,
            stats: TickStats::default(),
            observer: None,
        };

        let id = scheduler.allocate_tid();
        let mut initial = Thread::new(id, "main", PRI_DEFAULT, None);
        initial.status = ThreadStatus::Running;
        scheduler.threads.insert(id, initial);
        scheduler.current = id;

        info!("scheduler initialized, time slice {} ticks", config.time_slice);
        scheduler
    }

    /// Attach an observer. Threads that already exist are reported to it
    /// as created.
    pub fn set_observer(&mut self, observer: Arc<dyn SchedObserver>) {
        for thread in self.threads.values() {
            observer.on_create(thread.id, thread.priority);
        }
        self.observer = Some(observer);
    }

    /// Create the idle thread and enable preemption.
    ///
    /// `idle_entry` runs only when nothing else is ready. It should loop
    /// forever, blocking and then waiting for the next interrupt.
    pub fn start(&mut self, idle_entry: ThreadFn, arg: usize) -> Result<ThreadId, ThreadError> {
        let old_level = self.cpu.mask_interrupts();
        let result = self.spawn("idle", PRI_MIN, idle_entry, arg);
        if let Ok(id) = result {
            // Idle stays blocked; dispatch falls back to it explicitly.
            self.idle = Some(id);
        }
        self.cpu.restore_interrupts(old_level);
        let id = result?;

        self.cpu.enable_interrupts();
        info!("idle thread {id} started");
        Ok(id)
    }

    /// Create a kernel thread that runs `entry(arg)` and add it to the
    /// ready queue.
    ///
    /// The new thread may be dispatched before this returns. Panics if
    /// `priority` is out of range.
    pub fn create(
        &mut self,
        name: &str,
        priority: u8,
        entry: ThreadFn,
        arg: usize,
    ) -> Result<ThreadId, ThreadError> {
        let old_level = self.cpu.mask_interrupts();
        let result = self.spawn(name, priority, entry, arg);
        self.cpu.restore_interrupts(old_level);

        let id = result?;
        self.unblock(id);
        Ok(id)
    }

    /// Allocate and register a thread in the Blocked state.
    fn spawn(
        &mut self,
        name: &str,
        priority: u8,
        entry: ThreadFn,
        arg: usize,
    ) -> Result<ThreadId, ThreadError> {
        assert!(
            is_valid_priority(priority),
            "priority {priority} out of range"
        );

        let mut stack = KernelStack::allocate(&self.pages).ok_or(ThreadError::ResourceExhausted)?;
        let context = stack.prime(self.cpu.thread_entry_trampoline(), entry, arg);

        let id = self.allocate_tid();
        let mut thread = Thread::new(id, name, priority, Some(stack));
        thread.context = context;
        thread.vruntime = self.seed_vruntime();
        debug!(
            "created thread {id} ({}) priority {priority} vruntime {}",
            thread.name, thread.vruntime
        );
        self.threads.insert(id, thread);

        if let Some(observer) = &self.observer {
            observer.on_create(id, priority);
        }
        Ok(id)
    }

    fn seed_vruntime(&mut self) -> u64 {
        match self.config.vruntime_seed {
            VruntimeSeed::InheritMinimum => {
                let running = if Some(self.current) == self.idle {
                    None
                } else {
                    self.threads.get(&self.current).map(Thread::vruntime)
                };
                match (self.ready.min_vruntime(), running) {
                    (Some(a), Some(b)) => a.min(b),
                    (a, b) => a.or(b).unwrap_or(0),
                }
            }
            VruntimeSeed::ResetAll => {
                for thread in self.threads.values_mut() {
                    thread.vruntime = 0;
                }
                // Requeue in the current order so ties stay first come, first served.
                let queued: Vec<ThreadId> = self.ready.iter().map(|(id, _)| id).collect();
                self.ready.clear();
                for id in queued {
                    let key = self.ready.insert(id, 0);
                    self.tcb_mut(id).ready_key = Some(key);
                }
                0
            }
        }
    }

    fn allocate_tid(&mut self) -> ThreadId {
        let id = ThreadId::from_raw(self.next_tid);
        self.next_tid += 1;
        id
    }

    /// Move a blocked thread to the ready queue.
    ///
    /// Does not preempt the running thread. Panics unless `id` is Blocked.
    pub fn unblock(&mut self, id: ThreadId) {
        let old_level = self.cpu.mask_interrupts();
        let thread = self.tcb_mut(id);
        assert!(thread.is_thread());
        assert_eq!(thread.status, ThreadStatus::Blocked, "thread {id} is not blocked");
        self.enqueue(id);
        self.cpu.restore_interrupts(old_level);
    }

    /// Put the running thread to sleep until [`Scheduler::unblock`].
    ///
    /// Must be called with interrupts masked and outside interrupt context.
    pub fn block(&mut self) {
        assert!(!self.cpu.in_interrupt_context());
        assert_eq!(self.cpu.interrupt_level(), IntrLevel::Off);

        self.charge_current();
        let current = self.current;
        self.tcb_mut(current).status = ThreadStatus::Blocked;
        self.schedule();
    }

    /// Give up the CPU. The running thread is requeued by its updated
    /// virtual runtime and may be picked again at once.
    pub fn yield_now(&mut self) {
        assert!(!self.cpu.in_interrupt_context());

        let old_level = self.cpu.mask_interrupts();
        self.charge_current();
        let current = self.current;
        if Some(current) == self.idle {
            self.tcb_mut(current).status = ThreadStatus::Blocked;
        } else {
            self.enqueue(current);
        }
        self.schedule();
        self.cpu.restore_interrupts(old_level);
    }

    /// Timer interrupt hook. Runs in interrupt context.
    pub fn tick(&mut self) {
        let current = self.current;
        if Some(current) == self.idle {
            self.stats.idle_ticks += 1;
        } else if self.tcb(current).page_directory.is_some() {
            self.stats.user_ticks += 1;
        } else {
            self.stats.kernel_ticks += 1;
        }

        self.slice_ticks += 1;
        if self.slice_ticks >= self.config.time_slice {
            self.yield_on_return = true;
        }
    }

    /// Whether the running thread's time slice has run out.
    pub fn yield_requested(&self) -> bool {
        self.yield_on_return
    }

    /// Called on the way out of an interrupt, after leaving interrupt
    /// context. Yields if a tick asked for it and reports whether it did.
    pub fn preempt_if_requested(&mut self) -> bool {
        if !self.yield_on_return {
            return false;
        }
        self.yield_on_return = false;
        self.yield_now();
        true
    }

    /// Terminate the running thread.
    ///
    /// On hardware this never returns. The thread's stack is freed once the
    /// next thread has finished switching in.
    pub fn exit(&mut self) {
        assert!(!self.cpu.in_interrupt_context());
        assert_ne!(Some(self.current), self.idle, "idle thread cannot exit");

        self.cpu.disable_interrupts();
        self.charge_current();

        let id = self.current;
        let Some(mut thread) = self.threads.remove(&id) else {
            panic!("running thread {id} is not registered");
        };
        assert!(self.dying.is_none(), "two threads dying at once");
        debug!("thread {id} ({}) exiting", thread.name);
        thread.status = ThreadStatus::Dying;
        self.dying = Some(thread);

        if let Some(observer) = &self.observer {
            observer.on_exit(id);
        }
        self.schedule();
    }

    /// Charge the running thread for the ticks since it was last charged.
    fn charge_current(&mut self) {
        let now = self.stats.total_ticks();
        let elapsed = now - self.charged_at;
        self.charged_at = now;

        let current = self.current;
        let thread = self.tcb_mut(current);
        thread.vruntime += elapsed * weight(thread.priority);
        thread.runtime += elapsed;
        let (priority, vruntime) = (thread.priority, thread.vruntime);

        let Some(observer) = &self.observer else {
            return;
        };
        observer.on_charge(current, priority, elapsed, vruntime);
        if Some(current) != self.idle {
            let runnable: Vec<(ThreadId, u8)> = core::iter::once((current, priority))
                .chain(self.ready.iter().map(|(id, _)| (id, self.tcb(id).priority)))
                .collect();
            observer.on_elapsed(elapsed, &runnable);
        }
    }

    fn enqueue(&mut self, id: ThreadId) {
        let vruntime = self.tcb(id).vruntime;
        let started = self.observer.is_some().then(|| self.cpu.cycles());
        let key = self.ready.insert(id, vruntime);
        self.record_timing(TimedOp::ReadyInsert, started);
        let thread = self.tcb_mut(id);
        thread.status = ThreadStatus::Ready;
        thread.ready_key = Some(key);

        if let Some(observer) = &self.observer {
            observer.on_ready_insert(id, self.ready.len());
        }
    }

    /// Least-vruntime ready thread, or idle if nothing is ready.
    fn next_thread_to_run(&mut self) -> ThreadId {
        match self.ready.pop_min() {
            Some(id) => {
                self.tcb_mut(id).ready_key = None;
                id
            }
            None => self.idle.unwrap_or_else(|| panic!("no thread ready to run")),
        }
    }

    /// Switch to the next thread. The running thread must already have left
    /// the Running state.
    fn schedule(&mut self) {
        assert_eq!(self.cpu.interrupt_level(), IntrLevel::Off);
        self.schedule_started = self.observer.is_some().then(|| self.cpu.cycles());

        let prev = self.current;
        let next = self.next_thread_to_run();
        {
            let prev_tcb = tcb_in(&mut self.threads, &mut self.dying, prev);
            assert_ne!(prev_tcb.status, ThreadStatus::Running);
        }
        assert!(self.tcb(next).is_thread());

        let mut switched_from = prev;
        if next != prev {
            self.current = next;
            let load = self.tcb(next).context;
            let prev_tcb = tcb_in(&mut self.threads, &mut self.dying, prev);
            switched_from =
                unsafe { self.cpu.switch_context(prev, &mut prev_tcb.context, next, &load) };
        }
        self.finish_switch(switched_from);
    }

    /// Complete a switch away from `prev`.
    ///
    /// Runs on the new thread: from [`Scheduler::schedule`] after the switch
    /// primitive returns, or from the entry trampoline on a thread's first
    /// dispatch. Marks the thread Running, starts a new time slice, activates
    /// its address space and frees `prev` if it exited.
    pub fn finish_switch(&mut self, prev: ThreadId) {
        assert_eq!(self.cpu.interrupt_level(), IntrLevel::Off);

        let current = self.current;
        let thread = self.tcb_mut(current);
        thread.status = ThreadStatus::Running;
        let root = thread.page_directory.map(|frame| frame.start_address());

        self.slice_ticks = 0;
        self.yield_on_return = false;
        self.charged_at = self.stats.total_ticks();
        self.cpu.activate_address_space(root);

        if prev != current {
            self.stats.dispatches += 1;
            if let Some(observer) = &self.observer {
                observer.on_dispatch(prev, current);
            }
        }

        // The initial thread has no stack page, so dropping it frees nothing.
        if let Some(dead) = self.dying.take_if(|thread| thread.id == prev && prev != current) {
            debug!("reaped thread {}", dead.id);
        }

        let started = self.schedule_started.take();
        self.record_timing(TimedOp::Schedule, started);
    }

    fn record_timing(&self, op: TimedOp, started: Option<u64>) {
        if let (Some(start), Some(observer)) = (started, &self.observer) {
            observer.on_timing(op, self.cpu.cycles().wrapping_sub(start));
        }
    }

    /// Identifier of the running thread.
    pub fn current(&self) -> ThreadId {
        let thread = self.tcb(self.current);
        assert!(thread.is_thread(), "running thread {} is corrupt", thread.id);
        assert_eq!(thread.status, ThreadStatus::Running);
        thread.id
    }

    pub fn current_thread(&self) -> &Thread {
        self.tcb(self.current())
    }

    pub fn current_name(&self) -> &str {
        self.current_thread().name()
    }

    /// Look up a live thread.
    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(&id)
    }

    pub fn idle_thread(&self) -> Option<ThreadId> {
        self.idle
    }

    pub fn get_priority(&self) -> u8 {
        self.current_thread().priority
    }

    /// Change the running thread's priority. Takes effect the next time it
    /// is charged.
    pub fn set_priority(&mut self, priority: u8) {
        assert!(
            is_valid_priority(priority),
            "priority {priority} out of range"
        );
        let current = self.current();
        self.tcb_mut(current).priority = priority;
    }

    /// Bind a user address space to `id`. Its ticks then count as user time,
    /// and the directory is activated whenever it is dispatched.
    pub fn set_page_directory(&mut self, id: ThreadId, root: Option<PhysFrame>) {
        let old_level = self.cpu.mask_interrupts();
        self.tcb_mut(id).page_directory = root;
        if id == self.current {
            self.cpu
                .activate_address_space(root.map(|frame| frame.start_address()));
        }
        self.cpu.restore_interrupts(old_level);
    }

    /// Call `f` on every live thread. Interrupts must be masked.
    pub fn foreach(&self, mut f: impl FnMut(&Thread)) {
        assert_eq!(self.cpu.interrupt_level(), IntrLevel::Off);
        for thread in self.threads.values() {
            f(thread);
        }
    }

    pub fn nice(&self) -> i32 {
        0
    }

    pub fn set_nice(&mut self, _nice: i32) {}

    pub fn load_avg(&self) -> i32 {
        0
    }

    pub fn recent_cpu(&self) -> i32 {
        0
    }

    pub fn stats(&self) -> TickStats {
        self.stats
    }

    /// Log tick statistics.
    pub fn print_stats(&self) {
        info!("{}", self.stats);
    }

    pub fn ready_queue(&self) -> &ReadyQueue {
        &self.ready
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut C {
        &mut self.cpu
    }

    /// Check the run-state invariants: exactly one thread is Running and it
    /// is the current thread, a thread is queued iff it is Ready, and the
    /// queue is ordered by virtual runtime.
    pub fn invariants_hold(&self) -> bool {
        let running: Vec<ThreadId> = self
            .threads
            .values()
            .filter(|thread| thread.status == ThreadStatus::Running)
            .map(|thread| thread.id)
            .collect();
        if running != [self.current] {
            return false;
        }

        let queued = self.threads.values().all(|thread| {
            (thread.status == ThreadStatus::Ready) == thread.ready_key.is_some()
        });
        let ready = self
            .threads
            .values()
            .filter(|thread| thread.status == ThreadStatus::Ready)
            .count();
        queued && ready == self.ready.len() && self.ready.is_ordered()
    }

    fn tcb(&self, id: ThreadId) -> &Thread {
        match self.threads.get(&id) {
            Some(thread) => thread,
            None => panic!("unknown thread {id}"),
        }
    }

    fn tcb_mut(&mut self, id: ThreadId) -> &mut Thread {
        match self.threads.get_mut(&id) {
            Some(thread) => thread,
            None => panic!("unknown thread {id}"),
        }
    }
}

/// The TCB of `id`, which may be the dying thread.
fn tcb_in<'a>(
    threads: &'a mut BTreeMap<ThreadId, Thread>,
    dying: &'a mut Option<Thread>,
    id: ThreadId,
) -> &'a mut Thread {
    if let Some(thread) = threads.get_mut(&id) {
        return thread;
    }
    match dying {
        Some(thread) if thread.id == id => thread,
        _ => panic!("unknown thread {id}"),
    }
}
