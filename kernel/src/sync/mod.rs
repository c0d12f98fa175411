// =============================================================================
// TicketOS — Synchronization Core
// =============================================================================
//
// channel.rs — race-free sleep/wakeup on opaque channels, the timed sleep
//              with fairness-boost crediting, and the channel-id allocator.
// barrier.rs — the built-in single-generation barrier.
// usync.rs   — the user-facing lock / condition variable / semaphore
//              library layered on the channel primitives.
//
// LOCK ORDERING:
//   Level 1 (innermost): frame arena
//   Level 2: page-table heap
//   Level 3: process table
//   Level 4 (outermost): any caller-side lock handed to sleep (tick
//            counter lock, barrier lock)
//
// NEVER acquire a lower-level lock while holding a higher-level one.
// The sleep protocol depends on level 3 < level 4: the table lock is
// acquired *before* the caller's lock is released, which closes the
// window where a wakeup could slip between "decide to sleep" and
// "marked sleeping".
// =============================================================================

pub mod barrier;
pub mod channel;
pub mod usync;
