//! Process descriptors, the process table, and lifecycle operations.
//!
//! One fixed-size table of descriptors, guarded by a single lock, is the
//! serialization point for every state transition in the kernel: lifecycle
//! changes, scheduling-field updates, and parent/child links all happen
//! under `Kernel::ptable`. Lifecycle operations are the only mutators —
//! nothing outside this crate touches descriptor fields directly.
//!
//! Cross-descriptor references (parent, thread main, sleep channel) are
//! slot indices, never pointers: a reused slot can't leave a dangling
//! reference behind, only a stale index that lookups reject by pid.

use alloc::boxed::Box;
use alloc::string::String;
use spin::MutexGuard;

use crate::arch::{Context, ContextPort};
use crate::fs::Handle;
use crate::memory::vmm::AddrSpace;
use crate::memory::pmm::Frame;
use crate::memory::{PAGE_SIZE, USER_LIMIT};
use crate::sync::channel::Chan;
use crate::Kernel;

/// Number of slots in the process table.
pub const NPROC: usize = 64;

/// Open-file handles per descriptor.
pub const NOFILE: usize = 16;

/// Process identifier. Monotonically increasing; 0 means "none".
pub type Pid = u64;

/// Index of a descriptor slot in the process table.
///
/// Slots are stable for the lifetime of the kernel; the descriptor in a
/// slot is not — a reaped slot is cleared and reused with a fresh pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(pub(crate) usize);

impl Slot {
    /// Raw table index of this slot.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Iterator over every slot in table order.
pub(crate) fn slots() -> impl Iterator<Item = Slot> {
    (0..NPROC).map(Slot)
}

/// Lifecycle state of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Slot is free.
    Unused,
    /// Allocated but not yet fully initialized.
    Embryo,
    /// Blocked on a channel.
    Sleeping,
    /// Ready to be scheduled.
    Runnable,
    /// Currently executing on a CPU.
    Running,
    /// Terminated, awaiting reaping by wait()/join().
    Zombie,
}

impl ProcState {
    /// Short name for process listings.
    pub fn name(self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Sleeping => "sleeping",
            ProcState::Runnable => "runnable",
            ProcState::Running => "running",
            ProcState::Zombie => "zombie",
        }
    }
}

/// Trap frame for resuming user execution: the register subset this core
/// actually manipulates. `rax` carries system-call return values, `rdi`
/// the first argument.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TrapFrame {
    pub rax: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl TrapFrame {
    /// Frame for a fresh user entry at `pc` with stack top `sp`.
    /// RFLAGS has the interrupt flag set so the clock can preempt.
    pub fn user_entry(pc: u64, sp: u64) -> Self {
        Self {
            rip: pc,
            rsp: sp,
            rflags: 0x202,
            ..Self::default()
        }
    }
}

/// A process (or thread) descriptor: everything the kernel needs to
/// schedule and manage one unit of execution.
pub(crate) struct Proc {
    // ── identity & lifecycle ────────────────────────────────────
    pub state: ProcState,
    pub pid: Pid,
    pub name: String,
    pub parent: Option<Slot>,
    pub killed: bool,

    // ── execution state ─────────────────────────────────────────
    pub context: Context,
    pub tf: TrapFrame,
    pub kstack: Option<Frame>,
    /// CPU currently running this descriptor, while `Running`.
    pub cpu: Option<usize>,

    // ── address space ───────────────────────────────────────────
    /// Page-table root. Owned by a main descriptor; a thread holds a
    /// non-owning copy of its main's root and must never free it.
    pub space: Option<AddrSpace>,
    pub sz: usize,

    // ── files ───────────────────────────────────────────────────
    pub files: [Option<Handle>; NOFILE],
    pub cwd: Option<Handle>,

    // ── scheduling ──────────────────────────────────────────────
    pub tickets: u32,
    pub runticks: u64,
    /// Remaining fairness-boost credits; effective tickets double while
    /// this is positive.
    pub boostsleft: u64,
    /// Requested duration of the current timed sleep, in ticks.
    pub sleepticks: u64,
    /// Absolute tick at which the current timed sleep may end.
    pub sleeptarget: u64,
    /// Channel this descriptor sleeps on; valid only while `Sleeping`.
    pub chan: Option<Chan>,

    // ── threads ─────────────────────────────────────────────────
    pub is_thread: bool,
    /// Main descriptor of this thread's group; `None` for a main process.
    pub main: Option<Slot>,
    /// Base of the thread's private stack page in the shared space.
    pub ustack_base: Option<usize>,

    // ── accounting ──────────────────────────────────────────────
    pub syscalls: u64,
}

impl Proc {
    fn unused() -> Self {
        Self {
            state: ProcState::Unused,
            pid: 0,
            name: String::new(),
            parent: None,
            killed: false,
            context: Context::fresh(),
            tf: TrapFrame::default(),
            kstack: None,
            cpu: None,
            space: None,
            sz: 0,
            files: [None; NOFILE],
            cwd: None,
            tickets: 0,
            runticks: 0,
            boostsleft: 0,
            sleepticks: 0,
            sleeptarget: 0,
            chan: None,
            is_thread: false,
            main: None,
            ustack_base: None,
            syscalls: 0,
        }
    }

    /// Returns the slot to the unused pool, clearing every field.
    ///
    /// Owned resources (kernel stack, address space) must be taken out
    /// before the reset; the reset itself frees nothing.
    pub(crate) fn reset(&mut self) {
        debug_assert!(self.kstack.is_none(), "reset with live kernel stack");
        *self = Proc::unused();
    }
}

/// The process table: descriptor slots plus the pid counter, all guarded
/// by one lock on the `Kernel`.
pub(crate) struct ProcTable {
    procs: Box<[Proc]>,
    next_pid: Pid,
}

impl ProcTable {
    pub(crate) fn new() -> Self {
        Self {
            procs: (0..NPROC).map(|_| Proc::unused()).collect(),
            next_pid: 1,
        }
    }
}

impl core::ops::Index<Slot> for ProcTable {
    type Output = Proc;
    fn index(&self, slot: Slot) -> &Proc {
        &self.procs[slot.0]
    }
}

impl core::ops::IndexMut<Slot> for ProcTable {
    fn index_mut(&mut self, slot: Slot) -> &mut Proc {
        &mut self.procs[slot.0]
    }
}

/// Errors from lifecycle and scheduling operations. All recoverable; any
/// partially completed operation has been rolled back when one of these
/// is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    /// No free descriptor slot.
    NoFreeSlot,
    /// A required frame allocation failed.
    OutOfMemory,
    /// The descriptor has no address space attached.
    NoAddressSpace,
    /// wait() with nothing to wait for.
    NoChildren,
    /// thread_join() target does not exist or is not ours.
    NoSuchThread,
    /// No descriptor with that pid.
    NotFound,
    /// The caller has been marked killed.
    Killed,
    /// Rejected argument (non-positive tickets, bad size delta).
    BadArgument,
    /// A copy into user memory hit an unmapped page.
    BadAddress,
}

impl Kernel {
    /// Finds an unused slot, marks it `Embryo`, assigns the next pid, and
    /// allocates its kernel stack (outside the table lock). The saved
    /// context is primed fresh, to be entered through the port's
    /// first-return path on first dispatch.
    ///
    /// The descriptor inherits `caller`'s ticket count; the first process
    /// starts with one ticket.
    pub(crate) fn allocate(&self, caller: Option<Slot>) -> Result<Slot, ProcError> {
        let slot = {
            let mut table = self.ptable.lock();
            let Some(slot) = slots().find(|&s| table[s].state == ProcState::Unused) else {
                return Err(ProcError::NoFreeSlot);
            };
            let pid = table.next_pid;
            table.next_pid += 1;
            let tickets = caller.map(|c| table[c].tickets).filter(|&n| n > 0).unwrap_or(1);

            let p = &mut table[slot];
            p.state = ProcState::Embryo;
            p.pid = pid;
            p.tickets = tickets;
            p.boostsleft = 0;
            p.runticks = 0;
            slot
        };

        match self.vm.alloc_frame() {
            Some(frame) => {
                let mut table = self.ptable.lock();
                let p = &mut table[slot];
                p.kstack = Some(frame);
                p.context = Context::fresh();
                Ok(slot)
            }
            None => {
                self.ptable.lock()[slot].reset();
                Err(ProcError::OutOfMemory)
            }
        }
    }

    /// Rolls an `Embryo` descriptor back to `Unused`, returning its kernel
    /// stack to the arena.
    pub(crate) fn release_embryo(&self, slot: Slot) {
        let kstack = {
            let mut table = self.ptable.lock();
            let kstack = table[slot].kstack.take();
            table[slot].reset();
            kstack
        };
        if let Some(frame) = kstack {
            self.vm.free_frame(frame);
        }
    }

    /// Hand-crafts the first process: one page of address space, a trap
    /// frame entering user address 0, and the root directory as working
    /// directory. The first successfully spawned process becomes the
    /// reparenting target for orphans.
    pub fn spawn_init(&self, name: &str) -> Result<Slot, ProcError> {
        let slot = self.allocate(None)?;

        let space = self.vm.create_space();
        if self.vm.alloc_range(space, 0, PAGE_SIZE).is_err() {
            self.vm.free_space(space);
            self.release_embryo(slot);
            return Err(ProcError::OutOfMemory);
        }

        {
            let mut table = self.ptable.lock();
            let p = &mut table[slot];
            p.space = Some(space);
            p.sz = PAGE_SIZE;
            p.tf = TrapFrame::user_entry(0, PAGE_SIZE as u64);
            p.name = String::from(name);
            p.cwd = Some(self.files.dup(self.root_dir));
            p.state = ProcState::Runnable;
        }
        self.root.call_once(|| slot);
        Ok(slot)
    }

    /// Creates a child of `cur`: eagerly duplicated address space,
    /// duplicated file handles and working directory, trap frame copied
    /// with the return-value register zeroed so the child observes zero.
    /// Returns the child's pid; the caller is left untouched on failure.
    pub fn fork(&self, cur: Slot) -> Result<Pid, ProcError> {
        self.count_syscall(cur);
        let child = self.allocate(Some(cur))?;

        let (parent_space, parent_sz, tf, name, files, cwd) = {
            let table = self.ptable.lock();
            let p = &table[cur];
            (p.space, p.sz, p.tf, p.name.clone(), p.files, p.cwd)
        };
        let Some(parent_space) = parent_space else {
            self.release_embryo(child);
            return Err(ProcError::NoAddressSpace);
        };

        let child_space = match self.vm.duplicate(parent_space, parent_sz) {
            Ok(space) => space,
            Err(_) => {
                self.release_embryo(child);
                return Err(ProcError::OutOfMemory);
            }
        };

        let mut table = self.ptable.lock();
        let c = &mut table[child];
        c.space = Some(child_space);
        c.sz = parent_sz;
        c.tf = tf;
        c.tf.rax = 0; // the child sees fork() return zero
        c.parent = Some(cur);
        c.name = name;
        for (i, handle) in files.iter().enumerate() {
            if let Some(handle) = handle {
                c.files[i] = Some(self.files.dup(*handle));
            }
        }
        c.cwd = cwd.map(|handle| self.files.dup(handle));
        let pid = c.pid;
        c.state = ProcState::Runnable;
        Ok(pid)
    }

    /// Terminates `cur`: closes its files, releases its working directory,
    /// reparents its children to the root process (waking the root when an
    /// orphan is already a zombie), wakes the parent, and yields as a
    /// zombie. On a hardware port this never returns; host ports return so
    /// the calling context can unwind.
    ///
    /// # Panics
    /// Exiting the root process is a fatal invariant violation.
    pub fn exit(&self, cur: Slot, port: &impl ContextPort) {
        self.count_syscall(cur);
        let root = *self.root.get().expect("exit before the first process was spawned");
        if cur == root {
            panic!("init exiting");
        }

        let (files, cwd) = {
            let mut table = self.ptable.lock();
            let p = &mut table[cur];
            (core::mem::replace(&mut p.files, [None; NOFILE]), p.cwd.take())
        };
        for handle in files.into_iter().flatten() {
            self.files.close(handle);
        }
        if let Some(handle) = cwd {
            self.files.close(handle);
        }

        let mut table = self.ptable.lock();

        // The parent might be sleeping in wait().
        if let Some(parent) = table[cur].parent {
            self.wakeup_locked(&mut table, Chan::of_slot(parent));
        }

        // Pass abandoned children to the root process.
        for s in slots() {
            if s != cur && table[s].parent == Some(cur) {
                table[s].parent = Some(root);
                if table[s].state == ProcState::Zombie {
                    self.wakeup_locked(&mut table, Chan::of_slot(root));
                }
            }
        }

        table[cur].state = ProcState::Zombie;
        self.switch_out(table, cur, port);
    }

    /// Blocks until a non-thread child of `cur` is a zombie, then reclaims
    /// its kernel stack, address space, and slot, and returns its pid.
    /// Fails immediately when there are no eligible children or the caller
    /// has been killed.
    pub fn wait(&self, cur: Slot, port: &impl ContextPort) -> Result<Pid, ProcError> {
        self.count_syscall(cur);
        let mut table = self.ptable.lock();
        loop {
            let mut have_kids = false;
            let mut zombie = None;
            for s in slots() {
                let p = &table[s];
                if p.parent != Some(cur) || p.is_thread {
                    continue;
                }
                have_kids = true;
                if p.state == ProcState::Zombie {
                    zombie = Some(s);
                    break;
                }
            }

            if let Some(s) = zombie {
                let pid = table[s].pid;
                let kstack = table[s].kstack.take();
                let space = table[s].space.take();
                table[s].reset();
                drop(table);
                if let Some(frame) = kstack {
                    self.vm.free_frame(frame);
                }
                if let Some(space) = space {
                    self.vm.free_space(space);
                }
                return Ok(pid);
            }

            if !have_kids {
                return Err(ProcError::NoChildren);
            }
            if table[cur].killed {
                return Err(ProcError::Killed);
            }

            // Wait for a child to exit (see the wakeup in exit()).
            table = self.sleep_locked(table, cur, Chan::of_slot(cur), port);
        }
    }

    /// Marks the descriptor with `pid` as killed. A sleeping target is
    /// made runnable so it observes the flag at its next checkpoint; a
    /// running one is never torn down forcibly.
    pub fn kill(&self, pid: Pid) -> Result<(), ProcError> {
        let mut table = self.ptable.lock();
        for s in slots() {
            if table[s].pid == pid && table[s].state != ProcState::Unused {
                table[s].killed = true;
                if table[s].state == ProcState::Sleeping {
                    table[s].state = ProcState::Runnable;
                }
                return Ok(());
            }
        }
        Err(ProcError::NotFound)
    }

    /// Pid of the calling descriptor.
    pub fn getpid(&self, cur: Slot) -> Pid {
        self.count_syscall(cur);
        self.ptable.lock()[cur].pid
    }

    /// Grows (lazily) or shrinks (eagerly) `cur`'s address space by
    /// `delta` bytes. Returns the old size. Grown pages are mapped on
    /// demand by the page-fault path; shrinking unmaps and frees whole
    /// pages immediately.
    pub fn sbrk(&self, cur: Slot, delta: isize) -> Result<usize, ProcError> {
        self.count_syscall(cur);
        let (space, oldsz) = {
            let table = self.ptable.lock();
            (table[cur].space, table[cur].sz)
        };
        let Some(space) = space else {
            return Err(ProcError::NoAddressSpace);
        };

        if delta >= 0 {
            let newsz = oldsz + delta as usize;
            if newsz > USER_LIMIT {
                return Err(ProcError::OutOfMemory);
            }
            self.ptable.lock()[cur].sz = newsz;
            Ok(oldsz)
        } else {
            let Some(target) = oldsz.checked_sub(delta.unsigned_abs()) else {
                return Err(ProcError::BadArgument);
            };
            let newsz = self.vm.dealloc_range(space, oldsz, target);
            self.ptable.lock()[cur].sz = newsz;
            Ok(oldsz)
        }
    }

    /// Suspends `cur` through the port. The caller must have set the next
    /// state already; the table lock is handed in, the context pointers
    /// are extracted, and the lock is dropped before the switch so the
    /// incoming context can take it.
    ///
    /// # Panics
    /// Switching out while still marked `Running` is a fatal error.
    pub(crate) fn switch_out(
        &self,
        mut table: MutexGuard<'_, ProcTable>,
        cur: Slot,
        port: &impl ContextPort,
    ) {
        let (save, resume) = {
            let p = &mut table[cur];
            assert!(
                p.state != ProcState::Running,
                "switch_out: descriptor still marked running"
            );
            let cpu = p.cpu.take().unwrap_or(0);
            (&mut p.context as *mut Context, self.sched_ctx_ptr(cpu) as *const Context)
        };
        drop(table);
        // SAFETY: descriptor storage is boxed and lives as long as the
        // kernel; the state transition above happened under the lock, so a
        // concurrent wakeup cannot miss this sleeper.
        unsafe { port.suspend(cur, save, resume) };
    }

    /// Bumps the caller's system-call counter.
    pub(crate) fn count_syscall(&self, cur: Slot) {
        self.ptable.lock()[cur].syscalls += 1;
    }

    // ── introspection ───────────────────────────────────────────

    /// Lifecycle state of a slot.
    pub fn state_of(&self, slot: Slot) -> ProcState {
        self.ptable.lock()[slot].state
    }

    /// Pid in a slot (0 when unused).
    pub fn pid_of(&self, slot: Slot) -> Pid {
        self.ptable.lock()[slot].pid
    }

    /// Finds the slot holding a live descriptor with `pid`.
    pub fn slot_of(&self, pid: Pid) -> Option<Slot> {
        let table = self.ptable.lock();
        slots().find(|&s| table[s].pid == pid && table[s].state != ProcState::Unused)
    }

    /// Whether a slot has been marked killed.
    pub fn is_killed(&self, slot: Slot) -> bool {
        self.ptable.lock()[slot].killed
    }

    /// Address-space root attached to a slot.
    pub fn space_of(&self, slot: Slot) -> Option<AddrSpace> {
        self.ptable.lock()[slot].space
    }

    /// Current address-space size of a slot, in bytes.
    pub fn size_of(&self, slot: Slot) -> usize {
        self.ptable.lock()[slot].sz
    }

    /// Working-directory handle of a slot.
    pub fn cwd_of(&self, slot: Slot) -> Option<Handle> {
        self.ptable.lock()[slot].cwd
    }

    /// The root process's slot, once spawned.
    pub fn root_slot(&self) -> Option<Slot> {
        self.root.get().copied()
    }

    /// The root directory handle.
    pub fn root_dir(&self) -> Handle {
        self.root_dir
    }
}
