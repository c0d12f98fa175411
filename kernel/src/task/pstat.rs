//! Scheduling introspection and process listings.

use core::fmt;

use crate::task::process::{slots, Pid, ProcError, ProcState, NPROC};
use crate::Kernel;

/// Per-slot scheduling statistics, one entry per table slot including
/// unused ones, parallel-array style.
pub struct PStat {
    pub inuse: [bool; NPROC],
    pub pid: [Pid; NPROC],
    pub tickets: [u32; NPROC],
    pub runticks: [u64; NPROC],
    pub boostsleft: [u64; NPROC],
}

impl Default for PStat {
    fn default() -> Self {
        Self {
            inuse: [false; NPROC],
            pid: [0; NPROC],
            tickets: [0; NPROC],
            runticks: [0; NPROC],
            boostsleft: [0; NPROC],
        }
    }
}

impl Kernel {
    /// Sets the ticket count of the descriptor with `pid`.
    ///
    /// A non-positive count is rejected without touching the target.
    pub fn settickets(&self, pid: Pid, n: i32) -> Result<(), ProcError> {
        if n <= 0 {
            return Err(ProcError::BadArgument);
        }
        let mut table = self.ptable.lock();
        for s in slots() {
            if table[s].pid == pid && table[s].state != ProcState::Unused {
                table[s].tickets = n as u32;
                return Ok(());
            }
        }
        Err(ProcError::NotFound)
    }

    /// Fills `ps` with the scheduling statistics of every table slot.
    pub fn getpinfo(&self, ps: &mut PStat) {
        let table = self.ptable.lock();
        for s in slots() {
            let i = s.index();
            let p = &table[s];
            ps.inuse[i] = p.state != ProcState::Unused;
            ps.pid[i] = p.pid;
            ps.tickets[i] = p.tickets;
            ps.runticks[i] = p.runticks;
            ps.boostsleft[i] = p.boostsleft;
        }
    }

    /// Writes a `(pid, state, name)` line for every non-unused slot.
    pub fn procdump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let table = self.ptable.lock();
        for s in slots() {
            let p = &table[s];
            if p.state == ProcState::Unused {
                continue;
            }
            writeln!(out, "{} {} {}", p.pid, p.state.name(), p.name)?;
        }
        Ok(())
    }

    /// Extended listing: adds parent pid and per-process system-call count.
    pub fn ps(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let table = self.ptable.lock();
        writeln!(out, "PID\tPPID\tNAME\tSTATE\tSYSCALLS")?;
        for s in slots() {
            let p = &table[s];
            if p.state == ProcState::Unused {
                continue;
            }
            let ppid = p.parent.map(|ps| table[ps].pid).unwrap_or(0);
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}",
                p.pid,
                ppid,
                p.name,
                p.state.name(),
                p.syscalls
            )?;
        }
        Ok(())
    }
}
