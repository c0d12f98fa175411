//! Kernel tick counter.
//!
//! Monotonically increasing count of timer interrupts, read without the
//! tick lock; the lock exists for the timed-sleep protocol, which must
//! hold it while deciding to sleep (see `sync/channel.rs`).

use core::sync::atomic::Ordering;

use crate::sync::channel::TIMER_CHAN;
use crate::Kernel;

impl Kernel {
    /// Advances the clock by one tick and broadcasts the timer channel,
    /// releasing any timed sleeper whose target has arrived. Called by the
    /// embedder's timer interrupt handler.
    pub fn clock_tick(&self) {
        let _guard = self.tick_lock.lock();
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.wakeup(TIMER_CHAN);
    }

    /// Clock ticks since boot.
    pub fn uptime(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}
