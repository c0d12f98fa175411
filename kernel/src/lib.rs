// =============================================================================
// TicketOS — Kernel Core
// =============================================================================
//
// The process- and memory-management core of a teaching operating system:
//
//   1. Process table & lifecycle   (task/process.rs)
//   2. Lottery scheduler           (task/sched.rs)
//   3. Sleep/wakeup & sync library (sync/)
//   4. Thread lifecycle            (task/thread.rs)
//   5. Paged virtual memory        (memory/)
//
// One mutable process table behind one lock serializes every state
// transition; the architecture-specific context switch is an opaque port
// (arch/). The crate is `no_std` + `alloc` for bare-metal targets and
// builds with `std` under test, where suites drive blocking operations
// from real host threads.
// =============================================================================

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod fs;
pub mod memory;
pub mod sync;
pub mod task;

use core::cell::UnsafeCell;
use core::sync::atomic::AtomicU64;

use spin::{Mutex, Once};

use sync::barrier::BarrierState;
use sync::channel::FIRST_DYNAMIC_CHAN;
use task::process::ProcTable;

pub use arch::{Context, ContextPort};
#[cfg(target_arch = "x86_64")]
pub use arch::x86_64::X86Port;
pub use fs::{Handle, HandleTable, NHANDLE};
pub use memory::vmm::{AddrSpace, Vm, VmError};
pub use memory::{KERNEL_BASE, PAGE_SIZE, USER_LIMIT};
pub use sync::channel::{Chan, BARRIER_CHAN, TIMER_CHAN};
pub use sync::usync::{CondVar, Semaphore, UserLock};
pub use task::process::{Pid, ProcError, ProcState, Slot, TrapFrame, NOFILE, NPROC};
pub use task::pstat::PStat;
pub use task::sched::{Cpu, Lcg};

/// Number of CPUs the dispatch loop supports.
pub const NCPU: usize = 4;

/// Boot-time configuration.
pub struct Config {
    /// Number of 4 KiB frames in the physical arena.
    pub phys_frames: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self { phys_frames: 1024 }
    }
}

/// Per-CPU scheduler-context storage.
struct SchedCtx(UnsafeCell<Context>);

impl SchedCtx {
    const fn new() -> Self {
        Self(UnsafeCell::new(Context::fresh()))
    }
}

// SAFETY: each cell is entered only by its own CPU's dispatch loop; the
// cell exists so the port has somewhere stable to save that loop's state.
unsafe impl Sync for SchedCtx {}

/// The kernel core: every shared structure, each behind its own lock.
pub struct Kernel {
    /// The process table — the single serialization point for all state
    /// transitions, scheduling fields, and parent/child links.
    pub(crate) ptable: Mutex<ProcTable>,
    /// Clock tick counter, read lock-free.
    pub(crate) ticks: AtomicU64,
    /// Held while deciding to sleep on the timer (see sync/channel.rs).
    pub(crate) tick_lock: Mutex<()>,
    /// The built-in barrier.
    pub(crate) barrier: Mutex<BarrierState>,
    /// Next dynamic channel id.
    pub(crate) next_chan: AtomicU64,
    /// The reparenting target for orphans, set by the first spawn.
    pub(crate) root: Once<Slot>,
    /// The root directory handle.
    pub(crate) root_dir: Handle,
    /// Virtual memory: frame arena + page-table heap.
    pub vm: Vm,
    /// File-handle collaborator.
    pub files: HandleTable,
    sched_ctxs: [SchedCtx; NCPU],
}

impl Kernel {
    pub fn new(config: Config) -> Self {
        let files = HandleTable::new();
        let root_dir = files.open().expect("handle table empty at boot");
        Self {
            ptable: Mutex::new(ProcTable::new()),
            ticks: AtomicU64::new(0),
            tick_lock: Mutex::new(()),
            barrier: Mutex::new(BarrierState::new()),
            next_chan: AtomicU64::new(FIRST_DYNAMIC_CHAN),
            root: Once::new(),
            root_dir,
            vm: Vm::new(config.phys_frames),
            files,
            sched_ctxs: [
                SchedCtx::new(),
                SchedCtx::new(),
                SchedCtx::new(),
                SchedCtx::new(),
            ],
        }
    }

    /// Pointer to a CPU's scheduler-context cell, handed to the port as
    /// the save/restore slot for the dispatch loop itself.
    pub(crate) fn sched_ctx_ptr(&self, cpu: usize) -> *mut Context {
        self.sched_ctxs[cpu % NCPU].0.get()
    }
}
