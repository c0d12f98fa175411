//! The context-switch port.
//!
//! The scheduler and the blocking primitives are architecture-independent;
//! the one thing they cannot express portably is the actual register
//! save/restore that suspends one execution context and resumes another.
//! That boundary is [`ContextPort`]: the dispatch loop and every blocking
//! operation take a port and call through it with no kernel lock held.
//!
//! Two implementations exist:
//!   - [`x86_64::X86Port`] — the hardware port (assembly switch routine),
//!     compiled only on x86_64 targets;
//!   - host-side test ports in the test suites, which model suspension by
//!     blocking the calling OS thread until the descriptor is runnable.

use crate::task::process::Slot;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Saved callee-preserved register state of a suspended execution context,
/// plus the stack pointer and resume address.
///
/// Field order is the layout the switch routine reads and writes; keep it
/// in sync with the assembly in the hardware port.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rip: u64,
}

impl Context {
    /// A zeroed context, as primed for a descriptor that has never run.
    ///
    /// The embedder's dispatch trampoline is responsible for steering the
    /// first entry of a fresh descriptor into its trap-frame return path;
    /// this core never interprets the register values itself.
    pub const fn fresh() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            rsp: 0,
            rip: 0,
        }
    }

    /// Primes a context to resume at `rip` on the stack `rsp`.
    pub fn prime(&mut self, rip: u64, rsp: u64) {
        *self = Self::fresh();
        self.rip = rip;
        self.rsp = rsp;
    }
}

/// Platform boundary for suspending and resuming execution contexts.
///
/// Both methods are handed raw pointers into descriptor (or per-CPU
/// scheduler) context storage. The kernel guarantees the pointers stay
/// valid across the call and that no kernel lock is held when a port
/// method runs — state transitions happen strictly before the switch, so
/// a wakeup arriving mid-switch finds the descriptor already marked
/// asleep and cannot be lost.
pub trait ContextPort {
    /// Suspends the calling context, which owns descriptor `cur`, saving
    /// its state into `save` and resuming the dispatch context in
    /// `resume`. Returns when `cur` is switched back in. For a descriptor
    /// that just became a zombie, the hardware port never returns here;
    /// host ports return so the calling test thread can unwind.
    ///
    /// # Safety
    /// `save` and `resume` must point to live context storage and must not
    /// alias.
    unsafe fn suspend(&self, cur: Slot, save: *mut Context, resume: *const Context);

    /// Enters descriptor `next`'s saved context from the dispatch loop,
    /// saving the loop's own state into `save`. Returns when `next`
    /// switches back out.
    ///
    /// # Safety
    /// Same contract as [`suspend`](Self::suspend).
    unsafe fn dispatch(&self, next: Slot, save: *mut Context, resume: *const Context);
}
