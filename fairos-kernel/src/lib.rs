#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod devices;
pub mod logging;
pub mod memory;
pub mod thread;
pub mod trace;

#[cfg(any(test, feature = "testing"))]
pub mod hosted;

pub use arch::{Cpu, IntrLevel};
pub use memory::{FaultOutcome, PageAllocator, VirtualMemory, VmError};
pub use thread::{Scheduler, SchedulerConfig, ThreadError, ThreadId, ThreadStatus};
