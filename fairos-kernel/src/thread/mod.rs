//! Kernel threads and the weighted-fair scheduler.
//!
//! This module contains:
//! - the thread control block and thread identifiers
//! - kernel stacks and first-dispatch priming
//! - the run queue ordered by virtual runtime
//! - the scheduler core (create, block, unblock, yield, tick, exit)

mod ready_queue;
mod scheduler;
mod stack;
mod weight;

pub use ready_queue::{ReadyKey, ReadyQueue};
pub use scheduler::{Scheduler, SchedulerConfig, TickStats, VruntimeSeed};
pub use stack::{InitialFrame, KernelStack, SavedContext, read_initial_frame};
pub use weight::{relative_share, weight};

use alloc::string::String;
use core::fmt;

use fairos_abi::THREAD_NAME_MAX;
use x86_64::structures::paging::PhysFrame;

/// Identity tag carried by every TCB and written at the bottom of its stack.
pub const THREAD_MAGIC: u32 = 0xcd6a_bf4b;

/// Entry point of a kernel thread.
pub type ThreadFn = fn(usize);

/// Unique thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u32);

impl ThreadId {
    pub const fn from_raw(raw: u32) -> Self {
        ThreadId(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadStatus {
    Blocked,
    Ready,
    Running,
    Dying,
}

/// Errors returned by thread operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadError {
    /// No page was available for the thread's kernel stack.
    ResourceExhausted,
}

/// Thread control block.
pub struct Thread {
    id: ThreadId,
    name: String,
    priority: u8,
    vruntime: u64,
    /// Ticks actually spent running.
    runtime: u64,
    status: ThreadStatus,
    magic: u32,
    /// `None` only for the initial thread, which runs on the boot stack.
    stack: Option<KernelStack>,
    context: SavedContext,
    ready_key: Option<ReadyKey>,
    page_directory: Option<PhysFrame>,
}

impl Thread {
    fn new(id: ThreadId, name: &str, priority: u8, stack: Option<KernelStack>) -> Self {
        Self {
            id,
            name: truncate_name(name),
            priority,
            vruntime: 0,
            runtime: 0,
            status: ThreadStatus::Blocked,
            magic: THREAD_MAGIC,
            stack,
            context: SavedContext::default(),
            ready_key: None,
            page_directory: None,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn vruntime(&self) -> u64 {
        self.vruntime
    }

    pub fn runtime_ticks(&self) -> u64 {
        self.runtime
    }

    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    pub fn page_directory(&self) -> Option<PhysFrame> {
        self.page_directory
    }

    pub fn stack(&self) -> Option<&KernelStack> {
        self.stack.as_ref()
    }

    pub fn context(&self) -> &SavedContext {
        &self.context
    }

    /// True if the identity tag and the stack-bottom tag are both intact.
    pub fn is_thread(&self) -> bool {
        self.magic == THREAD_MAGIC && self.stack.as_ref().is_none_or(KernelStack::is_intact)
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("vruntime", &self.vruntime)
            .field("status", &self.status)
            .finish()
    }
}

fn truncate_name(name: &str) -> String {
    let mut end = name.len().min(THREAD_NAME_MAX);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&name[..end])
}
