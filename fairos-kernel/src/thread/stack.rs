//! Kernel stacks and first-dispatch stack priming.

use alloc::sync::Arc;
use core::mem::size_of;

use fairos_abi::PAGE_SIZE;
use x86_64::{VirtAddr, structures::paging::PhysFrame};

use super::{THREAD_MAGIC, ThreadFn};
use crate::memory::PageAllocator;

/// Register state saved by the switch primitive.
///
/// Everything else lives on the thread's own stack; only the stack pointer
/// has to survive in the TCB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SavedContext {
    pub rsp: u64,
}

/// Frame the switch primitive pops on a thread's first dispatch.
///
/// Matches the push order of the switch stub (callee-saved registers, then
/// the return address). The trampoline finds the entry point in `r12` and
/// its argument in `r13`, enables interrupts, calls `entry(arg)` and exits
/// the thread when it returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct InitialFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rip: u64,
    /// Fake return address; the trampoline never returns.
    pub ret: u64,
}

impl InitialFrame {
    pub fn entry(&self) -> usize {
        self.r12 as usize
    }

    pub fn arg(&self) -> usize {
        self.r13 as usize
    }
}

/// One page of kernel stack, freed when dropped.
///
/// The lowest word of the page holds [`THREAD_MAGIC`]. The stack grows down
/// toward it, so an overflow overwrites the tag before anything else.
pub struct KernelStack {
    frame: PhysFrame,
    pages: Arc<dyn PageAllocator>,
}

impl KernelStack {
    /// Allocate a zeroed stack page and tag it.
    pub fn allocate(pages: &Arc<dyn PageAllocator>) -> Option<Self> {
        let frame = pages.allocate_page(true)?;
        let stack = Self {
            frame,
            pages: pages.clone(),
        };
        unsafe {
            stack
                .bottom()
                .as_mut_ptr::<u32>()
                .write_volatile(THREAD_MAGIC);
        }
        Some(stack)
    }

    pub fn frame(&self) -> PhysFrame {
        self.frame
    }

    /// Lowest address of the stack page.
    pub fn bottom(&self) -> VirtAddr {
        self.pages.phys_to_virt(self.frame.start_address())
    }

    /// One past the highest address of the stack page.
    pub fn top(&self) -> VirtAddr {
        self.bottom() + PAGE_SIZE as u64
    }

    /// False once something has overwritten the tag at the stack bottom.
    pub fn is_intact(&self) -> bool {
        unsafe { self.bottom().as_ptr::<u32>().read_volatile() == THREAD_MAGIC }
    }

    /// Write the first-dispatch frame and return the context that resumes it.
    pub fn prime(&mut self, trampoline: u64, entry: ThreadFn, arg: usize) -> SavedContext {
        let frame_addr = self.top() - size_of::<InitialFrame>() as u64;
        let frame = InitialFrame {
            r12: entry as usize as u64,
            r13: arg as u64,
            rip: trampoline,
            ..InitialFrame::default()
        };
        unsafe { frame_addr.as_mut_ptr::<InitialFrame>().write(frame) };
        SavedContext {
            rsp: frame_addr.as_u64(),
        }
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        unsafe { self.pages.free_page(self.frame) };
    }
}

/// Read back the frame written by [`KernelStack::prime`].
///
/// # Safety
/// `context` must have been returned by `prime` on a stack that is still
/// allocated and has not run yet.
pub unsafe fn read_initial_frame(context: &SavedContext) -> InitialFrame {
    unsafe { (context.rsp as *const InitialFrame).read() }
}
