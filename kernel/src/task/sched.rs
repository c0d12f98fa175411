//! The lottery scheduler.
//!
//! Each dispatch round draws a weighted-random winner from the runnable
//! descriptors: a descriptor holding k times the tickets of another wins
//! k times as often in the long run, with no per-round ordering guarantee.
//! A descriptor with fairness-boost credits counts double for the round
//! and pays one credit when it wins — the compensation mechanism for time
//! spent blocked on the timer channel (see `sync/channel.rs`).
//!
//! The dispatch loop never holds the table lock across the switch: the
//! winner is marked `Running` and its context pointer extracted under the
//! lock, then the lock is dropped and the port entered. The switched-to
//! code path takes the lock itself when it needs it.

use crate::arch::{Context, ContextPort};
use crate::task::process::{slots, Proc, ProcState, Slot};
use crate::Kernel;

/// The pseudo-random source for lottery draws: a 31-bit linear
/// congruential generator, cheap enough to run under the table lock.
pub struct Lcg {
    seed: u32,
}

impl Lcg {
    pub const fn new(seed: u32) -> Self {
        Self { seed }
    }

    /// Reseeds the generator (reproducible scheduling runs).
    pub fn reseed(&mut self, seed: u32) {
        self.seed = seed;
    }

    /// Next draw in `[0, 2^31)`.
    pub fn next(&mut self) -> u32 {
        self.seed = self.seed.wrapping_mul(1_103_515_245).wrapping_add(12_345) & 0x7fff_ffff;
        self.seed
    }
}

/// Per-CPU dispatch state: which descriptor is in, plus this CPU's own
/// draw source. One `Cpu` per dispatch loop; never shared.
pub struct Cpu {
    pub id: usize,
    /// Descriptor currently switched in, if any.
    pub current: Option<Slot>,
    /// Address space installed for the current descriptor.
    pub active_space: Option<crate::memory::vmm::AddrSpace>,
    rng: Lcg,
}

impl Cpu {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            current: None,
            active_space: None,
            rng: Lcg::new(id as u32 + 1),
        }
    }

    /// Reseeds this CPU's lottery draws.
    pub fn srand(&mut self, seed: u32) {
        self.rng.reseed(seed);
    }
}

/// Effective tickets for one round: base count, doubled while a fairness
/// boost is active.
fn effective_tickets(p: &Proc) -> u64 {
    let base = p.tickets as u64;
    if p.boostsleft > 0 {
        base * 2
    } else {
        base
    }
}

impl Kernel {
    /// Runs one dispatch round on `cpu`: draw a winner by lottery, mark it
    /// `Running`, install its address space, charge the round, and switch
    /// into it through the port. Returns the winner's slot once it has
    /// switched back out, or `None` when nothing was runnable (idle round).
    pub fn dispatch_round(&self, cpu: &mut Cpu, port: &impl ContextPort) -> Option<Slot> {
        let winner;
        let resume;
        let save;
        {
            let mut table = self.ptable.lock();

            let total: u64 = slots()
                .filter(|&s| table[s].state == ProcState::Runnable)
                .map(|s| effective_tickets(&table[s]))
                .sum();
            if total == 0 {
                return None;
            }

            let draw = (cpu.rng.next() as u64) % total;
            let mut acc = 0;
            let mut chosen = None;
            for s in slots() {
                if table[s].state != ProcState::Runnable {
                    continue;
                }
                acc += effective_tickets(&table[s]);
                if acc > draw {
                    chosen = Some(s);
                    break;
                }
            }
            winner = chosen.expect("ticket sum positive but no winner found");

            let p = &mut table[winner];
            p.state = ProcState::Running;
            p.runticks += 1;
            if p.boostsleft > 0 {
                p.boostsleft -= 1;
            }
            p.cpu = Some(cpu.id);
            cpu.current = Some(winner);
            cpu.active_space = p.space;

            resume = &p.context as *const Context;
            save = self.sched_ctx_ptr(cpu.id);
        }
        // SAFETY: pointers extracted under the lock target pinned storage;
        // the lock is released so the entered context can take it.
        unsafe { port.dispatch(winner, save, resume) };

        // The descriptor yielded, blocked, or exited.
        cpu.current = None;
        cpu.active_space = None;
        Some(winner)
    }

    /// The per-CPU scheduler loop: dispatch forever, spinning through idle
    /// rounds until a descriptor becomes runnable.
    pub fn scheduler(&self, cpu: &mut Cpu, port: &impl ContextPort) -> ! {
        loop {
            if self.dispatch_round(cpu, port).is_none() {
                core::hint::spin_loop();
            }
        }
    }

    /// Gives up the CPU for one scheduling round (the timer-preemption
    /// path): back to `Runnable`, then out through the port.
    pub fn yield_now(&self, cur: Slot, port: &impl ContextPort) {
        let mut table = self.ptable.lock();
        table[cur].state = ProcState::Runnable;
        self.switch_out(table, cur, port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lcg_is_deterministic() {
        let mut a = Lcg::new(42);
        let mut b = Lcg::new(42);
        for _ in 0..32 {
            assert_eq!(a.next(), b.next());
        }
    }

    #[test]
    fn lcg_stays_in_31_bits() {
        let mut rng = Lcg::new(0xdead_beef);
        for _ in 0..1000 {
            assert!(rng.next() < 1 << 31);
        }
    }

    #[test]
    fn reseed_restarts_the_sequence() {
        let mut a = Lcg::new(7);
        let first = a.next();
        a.next();
        a.reseed(7);
        assert_eq!(a.next(), first);
    }
}
