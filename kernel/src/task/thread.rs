//! Thread lifecycle.
//!
//! A thread is a descriptor that shares its main descriptor's page-table
//! root (a non-owning copy — the root is freed only when the main process
//! is reaped) and duplicates its open-file handles, but owns one private
//! stack page appended at the current end of the shared address space.
//! The stack base is recorded in the descriptor so join can unmap it.

use crate::arch::ContextPort;
use crate::memory::{page_align_up, PAGE_SIZE};
use crate::sync::channel::Chan;
use crate::task::process::{slots, Pid, ProcError, ProcState, NOFILE};
use crate::task::process::Slot;
use crate::Kernel;

impl Kernel {
    /// Spawns a thread of `cur`'s group: shared address space, a fresh
    /// private stack page, trap frame primed to start at `entry` with
    /// `arg` in the first-argument register, and the new thread's id
    /// written back to `out_ptr` in the caller's address space. Returns
    /// the thread id; on any failure every intermediate allocation is
    /// rolled back and the caller is left unchanged.
    pub fn thread_create(
        &self,
        cur: Slot,
        out_ptr: usize,
        entry: usize,
        arg: usize,
    ) -> Result<Pid, ProcError> {
        self.count_syscall(cur);
        let child = self.allocate(Some(cur))?;

        let (space, sz, tf, name, files, cwd, main) = {
            let table = self.ptable.lock();
            let p = &table[cur];
            let main = if p.is_thread { p.main } else { Some(cur) };
            (p.space, p.sz, p.tf, p.name.clone(), p.files, p.cwd, main)
        };
        let Some(space) = space else {
            self.release_embryo(child);
            return Err(ProcError::NoAddressSpace);
        };

        // One eagerly mapped page at the current end of the shared space
        // becomes the thread's private stack.
        let stack_base = page_align_up(sz);
        if self
            .vm
            .alloc_range(space, stack_base, stack_base + PAGE_SIZE)
            .is_err()
        {
            self.release_embryo(child);
            return Err(ProcError::OutOfMemory);
        }
        let newsz = stack_base + PAGE_SIZE;

        let rollback = |kernel: &Kernel| {
            kernel.vm.dealloc_range(space, newsz, stack_base);
            kernel.release_embryo(child);
        };

        // Park the argument at the top of the new stack as well, so entry
        // code that expects it in memory finds it there.
        let sp = newsz - core::mem::size_of::<u64>();
        if self
            .vm
            .copy_out(space, sp, &(arg as u64).to_le_bytes())
            .is_err()
        {
            rollback(self);
            return Err(ProcError::BadAddress);
        }

        // Publish the thread id into the caller's address space before the
        // thread can run.
        let tid = self.pid_of(child);
        if self.vm.copy_out(space, out_ptr, &tid.to_le_bytes()).is_err() {
            rollback(self);
            return Err(ProcError::BadAddress);
        }

        let mut table = self.ptable.lock();
        table[cur].sz = newsz; // the creator's view of the shared space grows too
        let c = &mut table[child];
        c.space = Some(space);
        c.sz = newsz;
        c.is_thread = true;
        c.main = main;
        c.parent = Some(cur);
        c.name = name;
        c.ustack_base = Some(stack_base);
        c.tf = tf;
        c.tf.rip = entry as u64;
        c.tf.rsp = sp as u64;
        c.tf.rdi = arg as u64;
        for (i, handle) in files.iter().enumerate() {
            if let Some(handle) = handle {
                c.files[i] = Some(self.files.dup(*handle));
            }
        }
        c.cwd = cwd.map(|handle| self.files.dup(handle));
        c.state = ProcState::Runnable;
        Ok(tid)
    }

    /// Terminates the calling thread: closes its file handles, wakes its
    /// main descriptor (which may be blocked in join), and yields as a
    /// zombie. A plain process calling this is a no-op — processes exit
    /// through `exit()`.
    pub fn thread_exit(&self, cur: Slot, port: &impl ContextPort) {
        self.count_syscall(cur);
        {
            let table = self.ptable.lock();
            if !table[cur].is_thread {
                return;
            }
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
        if let Some(main) = table[cur].main {
            self.wakeup_locked(&mut table, Chan::of_slot(main));
        }
        table[cur].state = ProcState::Zombie;
        self.switch_out(table, cur, port);
    }

    /// Blocks until the thread with id `tid` — which must belong to the
    /// caller's group — becomes a zombie, then unmaps its private stack
    /// page from the shared space, frees its kernel stack, and clears its
    /// slot. Returns the joined id.
    pub fn thread_join(
        &self,
        cur: Slot,
        tid: Pid,
        port: &impl ContextPort,
    ) -> Result<Pid, ProcError> {
        self.count_syscall(cur);
        let mut table = self.ptable.lock();
        loop {
            let mut found = None;
            for s in slots() {
                let p = &table[s];
                if p.pid == tid && p.is_thread && p.main == Some(cur) {
                    found = Some(s);
                    break;
                }
            }
            let Some(s) = found else {
                return Err(ProcError::NoSuchThread);
            };

            if table[s].state == ProcState::Zombie {
                let ustack = table[s].ustack_base;
                let kstack = table[s].kstack.take();
                // The space reference is non-owning; drop it, never free it.
                let _shared: Option<_> = table[s].space.take();
                let joiner_space = table[cur].space;
                table[s].reset();
                drop(table);

                if let (Some(base), Some(space)) = (ustack, joiner_space) {
                    self.vm.dealloc_range(space, base + PAGE_SIZE, base);
                }
                if let Some(frame) = kstack {
                    self.vm.free_frame(frame);
                }
                return Ok(tid);
            }

            if table[cur].killed {
                return Err(ProcError::Killed);
            }
            table = self.sleep_locked(table, cur, Chan::of_slot(cur), port);
        }
    }
}
