//! User-facing synchronization library: spin lock, condition variable,
//! counting semaphore.
//!
//! The lock is a busy-wait over an atomic exchange — deliberately so. The
//! condition-variable design assumes spin semantics for the lock itself
//! (release, sleep on the channel, reacquire), and swapping in a blocking
//! mutex would change the protocol. Condition variables carry no state
//! beyond a kernel channel id; lost wakeups are prevented by the kernel's
//! sleep protocol as long as signalers follow the hold-the-lock-while-
//! signaling convention, and spurious wakeups cannot occur by
//! construction.

use core::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use crate::arch::ContextPort;
use crate::sync::channel::Chan;
use crate::task::process::Slot;
use crate::Kernel;

/// Mutual exclusion by atomic exchange: spin until the previous value of
/// the lock word was zero.
pub struct UserLock {
    word: AtomicU32,
}

impl UserLock {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    /// Busy-waits until the lock is taken.
    pub fn acquire(&self) {
        while self.word.swap(1, Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }
    }

    /// Releases the lock.
    pub fn release(&self) {
        self.word.swap(0, Ordering::Release);
    }
}

impl Default for UserLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A condition variable: a fresh kernel channel plus the monitor
/// discipline around it.
pub struct CondVar {
    chan: Chan,
}

impl CondVar {
    /// Allocates a condition variable backed by a fresh channel id.
    pub fn new(kernel: &Kernel) -> Self {
        Self {
            chan: kernel.get_channel(),
        }
    }

    /// Releases `lock`, sleeps on this variable's channel, and reacquires
    /// `lock` before returning. The caller must hold `lock`.
    pub fn wait(&self, kernel: &Kernel, cur: Slot, lock: &UserLock, port: &impl ContextPort) {
        lock.release();
        kernel.sleep_on(cur, self.chan, port);
        lock.acquire();
    }

    /// Wakes exactly one waiter (first match in table order).
    pub fn signal(&self, kernel: &Kernel) {
        kernel.wakeup_one(self.chan);
    }

    /// Wakes every waiter.
    pub fn broadcast(&self, kernel: &Kernel) {
        kernel.wakeup(self.chan);
    }
}

/// Counting semaphore built from the lock and condition variable. `up`
/// releases exactly one waiter per call — the single-wake primitive is
/// what makes that guarantee possible.
pub struct Semaphore {
    count: AtomicI64,
    lock: UserLock,
    cv: CondVar,
}

impl Semaphore {
    pub fn new(kernel: &Kernel, initial: i64) -> Self {
        Self {
            count: AtomicI64::new(initial),
            lock: UserLock::new(),
            cv: CondVar::new(kernel),
        }
    }

    /// Takes one unit, blocking while the count is exhausted.
    pub fn down(&self, kernel: &Kernel, cur: Slot, port: &impl ContextPort) {
        self.lock.acquire();
        let value = self.count.fetch_sub(1, Ordering::AcqRel) - 1;
        if value < 0 {
            self.cv.wait(kernel, cur, &self.lock, port);
        }
        self.lock.release();
    }

    /// Returns one unit, releasing a single waiter when any are blocked.
    pub fn up(&self, kernel: &Kernel) {
        self.lock.acquire();
        let value = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if value <= 0 {
            self.cv.signal(kernel);
        }
        self.lock.release();
    }

    /// Current count (negative while waiters are queued).
    pub fn value(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }
}
