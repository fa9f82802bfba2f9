//! Hardware primitives the scheduler and VM consume from below.
//!
//! The scheduler never touches the CPU directly. Interrupt masking, the
//! register-state switch and address-space activation all go through [`Cpu`],
//! which the platform layer implements (the bare-metal stubs live outside
//! this crate; `hosted::SimCpu` stands in for them under test).

use x86_64::{PhysAddr, VirtAddr};

use crate::thread::{SavedContext, ThreadId};

/// Interrupt mask state, as returned by [`Cpu::mask_interrupts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrLevel {
    On,
    Off,
}

/// CPU services used by the scheduler core.
pub trait Cpu {
    fn interrupts_enabled(&self) -> bool;

    fn enable_interrupts(&self);

    fn disable_interrupts(&self);

    /// True while an external interrupt handler is executing.
    fn in_interrupt_context(&self) -> bool;

    /// Save the running register state into `save` and resume `next` from
    /// `load`.
    ///
    /// Returns the thread that was running immediately before the caller
    /// resumed. On hardware that is whichever thread later switched back to
    /// `prev`; a hosted implementation resumes the caller at once, acting on
    /// behalf of `next`, and returns `prev`.
    ///
    /// # Safety
    /// Interrupts must be masked, and `load` must hold a context produced by
    /// a previous switch or by stack priming.
    unsafe fn switch_context(
        &mut self,
        prev: ThreadId,
        save: &mut SavedContext,
        next: ThreadId,
        load: &SavedContext,
    ) -> ThreadId;

    /// Address of the routine a newly primed stack returns into on its
    /// first dispatch.
    fn thread_entry_trampoline(&self) -> u64;

    /// Install the page directory of the thread about to run, or the kernel-only
    /// directory for kernel threads.
    fn activate_address_space(&mut self, root: Option<PhysAddr>);

    /// Free-running cycle counter (the TSC on hardware). Read only when an
    /// observer is attached, to time scheduler operations.
    fn cycles(&self) -> u64;

    /// Halt until the next interrupt. Used by the idle thread.
    fn wait_for_interrupt(&self) {}

    /// Mask interrupts, returning the previous level.
    fn mask_interrupts(&self) -> IntrLevel {
        let old = self.interrupt_level();
        self.disable_interrupts();
        old
    }

    /// Restore a level saved by [`Cpu::mask_interrupts`].
    fn restore_interrupts(&self, level: IntrLevel) {
        match level {
            IntrLevel::On => self.enable_interrupts(),
            IntrLevel::Off => self.disable_interrupts(),
        }
    }

    fn interrupt_level(&self) -> IntrLevel {
        if self.interrupts_enabled() {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }
}

/// Invalidate the TLB entry for `addr`.
///
/// Page tables edited off bare metal are never loaded into CR3, so the hosted
/// build has nothing to flush.
#[inline]
pub fn flush_page(addr: VirtAddr) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::tlb::flush(addr);

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = addr;
}
