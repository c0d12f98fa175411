//! Sleep/wakeup channels.
//!
//! A channel is an opaque value used purely as an equality key — it has no
//! storage of its own, and any number of descriptors may sleep on the same
//! channel at once. Wakeup is a broadcast over the table; a single-target
//! variant wakes the first match in table order (semaphores want exactly
//! one waiter released per signal — the tie-break is part of the contract,
//! not an accident).
//!
//! The timer channel is special on the wakeup side: a sleeper is released
//! only once the tick count reaches its recorded target, and is credited
//! fairness boost equal to the duration it asked to sleep. That credit is
//! what the scheduler consumes to double a freshly woken sleeper's tickets.

use core::sync::atomic::Ordering;

use spin::{Mutex, MutexGuard};

use crate::arch::ContextPort;
use crate::task::process::{slots, ProcError, ProcState, ProcTable, Slot};
use crate::Kernel;

/// An opaque sleep/wakeup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chan(u64);

/// Channel the clock broadcasts on every tick.
pub const TIMER_CHAN: Chan = Chan(1);

/// Channel the built-in barrier blocks on.
pub const BARRIER_CHAN: Chan = Chan(2);

/// First dynamically allocated channel id.
pub(crate) const FIRST_DYNAMIC_CHAN: u64 = 3;

/// Slot-derived channels live in their own range so they can never
/// collide with allocated ids.
const SLOT_CHAN_BASE: u64 = 1 << 32;

impl Chan {
    /// The channel a descriptor's slot implies — what wait() and join()
    /// sleep on, and what exit paths wake.
    pub(crate) fn of_slot(slot: Slot) -> Self {
        Chan(SLOT_CHAN_BASE + slot.index() as u64)
    }

    /// Raw id, for diagnostics.
    pub fn id(self) -> u64 {
        self.0
    }
}

impl Kernel {
    /// Allocates a fresh channel id (always >= 3; ids 1 and 2 are the
    /// timer and barrier channels).
    pub fn get_channel(&self) -> Chan {
        Chan(self.next_chan.fetch_add(1, Ordering::Relaxed))
    }

    /// Sleeps `cur` on `chan`. The degenerate form of the sleep protocol
    /// where the caller holds no lock of its own: the table lock alone
    /// covers the transition.
    pub fn sleep_on(&self, cur: Slot, chan: Chan, port: &impl ContextPort) {
        self.count_syscall(cur);
        let table = self.ptable.lock();
        let _ = self.sleep_locked(table, cur, chan, port);
    }

    /// Core sleep step, entered with the table lock held: record the
    /// channel, mark `Sleeping`, switch out, and on resumption clear the
    /// channel and hand back a freshly acquired table lock.
    pub(crate) fn sleep_locked<'a>(
        &'a self,
        mut table: MutexGuard<'a, ProcTable>,
        cur: Slot,
        chan: Chan,
        port: &impl ContextPort,
    ) -> MutexGuard<'a, ProcTable> {
        {
            let p = &mut table[cur];
            p.chan = Some(chan);
            p.state = ProcState::Sleeping;
        }
        self.switch_out(table, cur, port);

        // Awake again; tidy up.
        let mut table = self.ptable.lock();
        table[cur].chan = None;
        table
    }

    /// Sleeps `cur` on `chan` while the caller holds `lock`.
    ///
    /// The table lock is acquired *before* the caller's guard is dropped —
    /// a wakeup runs with the table lock held, so nothing can fire in the
    /// gap between the decision to sleep and the descriptor being marked
    /// asleep. On return the caller's lock has been reacquired.
    pub fn sleep_holding<'a, T>(
        &self,
        cur: Slot,
        chan: Chan,
        lock: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
        port: &impl ContextPort,
    ) -> MutexGuard<'a, T> {
        let table = self.ptable.lock();
        drop(guard);

        let table = self.sleep_locked(table, cur, chan, port);
        drop(table);

        lock.lock()
    }

    /// Broadcast wakeup: every descriptor sleeping on `chan` becomes
    /// runnable. Timer-channel sleepers are released only at or past their
    /// recorded target tick, and are credited boost equal to the sleep
    /// duration they requested.
    pub fn wakeup(&self, chan: Chan) {
        let mut table = self.ptable.lock();
        self.wakeup_locked(&mut table, chan);
    }

    pub(crate) fn wakeup_locked(&self, table: &mut ProcTable, chan: Chan) {
        let now = self.ticks.load(Ordering::Relaxed);
        for s in slots() {
            let p = &mut table[s];
            if p.state != ProcState::Sleeping || p.chan != Some(chan) {
                continue;
            }
            if chan == TIMER_CHAN {
                // Release only once the requested sleep time has elapsed,
                // compensating the sleeper with boost credits.
                if now >= p.sleeptarget {
                    p.boostsleft += p.sleepticks;
                    p.state = ProcState::Runnable;
                    p.sleepticks = 0;
                    p.sleeptarget = 0;
                }
            } else {
                p.state = ProcState::Runnable;
            }
        }
    }

    /// Wakes at most one descriptor sleeping on `chan`: the first match in
    /// table order, whose channel is cleared so a following broadcast
    /// cannot double-release it.
    pub fn wakeup_one(&self, chan: Chan) {
        let mut table = self.ptable.lock();
        for s in slots() {
            let p = &mut table[s];
            if p.state == ProcState::Sleeping && p.chan == Some(chan) {
                p.state = ProcState::Runnable;
                p.chan = None;
                break;
            }
        }
    }

    /// Blocks `cur` for `n` clock ticks.
    ///
    /// Records the requested duration and absolute wake target, then
    /// sleeps on the timer channel until the clock has advanced by `n`
    /// ticks, re-checking the kill flag at every wakeup. The boost credit
    /// for the elapsed sleep is granted by the timer-channel wakeup path.
    pub fn sleep_ticks(
        &self,
        cur: Slot,
        n: u64,
        port: &impl ContextPort,
    ) -> Result<(), ProcError> {
        self.count_syscall(cur);
        if n == 0 {
            return Ok(());
        }

        let mut guard = self.tick_lock.lock();
        let start = self.ticks.load(Ordering::Relaxed);
        {
            let mut table = self.ptable.lock();
            let p = &mut table[cur];
            p.sleepticks = n;
            p.sleeptarget = start + n;
        }

        while self.ticks.load(Ordering::Relaxed).wrapping_sub(start) < n {
            if self.ptable.lock()[cur].killed {
                return Err(ProcError::Killed);
            }
            guard = self.sleep_holding(cur, TIMER_CHAN, &self.tick_lock, guard, port);
        }
        drop(guard);
        Ok(())
    }

}
