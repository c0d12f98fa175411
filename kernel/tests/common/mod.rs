//! Shared test harness: host-side ports for the context-switch seam and
//! small helpers for building kernels and processes.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use ticketos_kernel::{Config, Context, ContextPort, Kernel, Pid, ProcState, Slot};

/// How long a test will wait for a state change before declaring the
/// kernel stuck.
pub const STUCK: Duration = Duration::from_secs(5);

/// Port for multi-threaded tests: each simulated execution context is a
/// host thread, and suspension blocks the thread until its descriptor
/// leaves the `Sleeping` state. A zombie's suspension returns immediately
/// so the thread can unwind.
pub struct HostPort {
    pub kernel: Arc<Kernel>,
}

impl ContextPort for HostPort {
    unsafe fn suspend(&self, cur: Slot, _save: *mut Context, _resume: *const Context) {
        let deadline = Instant::now() + STUCK;
        while self.kernel.state_of(cur) == ProcState::Sleeping {
            assert!(
                Instant::now() < deadline,
                "descriptor {cur:?} stuck sleeping"
            );
            std::thread::park_timeout(Duration::from_micros(100));
        }
    }

    unsafe fn dispatch(&self, _next: Slot, _save: *mut Context, _resume: *const Context) {}
}

/// Port for single-threaded state-machine tests: every switch returns
/// immediately, leaving states exactly as the kernel set them.
pub struct NullPort;

impl ContextPort for NullPort {
    unsafe fn suspend(&self, _cur: Slot, _save: *mut Context, _resume: *const Context) {}
    unsafe fn dispatch(&self, _next: Slot, _save: *mut Context, _resume: *const Context) {}
}

/// A kernel with the default arena and an `init` process spawned.
pub fn boot() -> (Arc<Kernel>, Slot) {
    boot_with_frames(1024)
}

pub fn boot_with_frames(frames: usize) -> (Arc<Kernel>, Slot) {
    let kernel = Arc::new(Kernel::new(Config {
        phys_frames: frames,
    }));
    let init = kernel.spawn_init("init").expect("spawn init");
    (kernel, init)
}

/// Forks from `parent` and returns the child's (pid, slot).
pub fn fork_child(kernel: &Kernel, parent: Slot) -> (Pid, Slot) {
    let pid = kernel.fork(parent).expect("fork");
    let slot = kernel.slot_of(pid).expect("child slot");
    (pid, slot)
}

/// Polls `cond` until it holds, panicking with `what` after the stuck
/// timeout.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + STUCK;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_micros(200));
    }
}

/// Waits until `slot` is sleeping (blocked in the kernel).
pub fn wait_sleeping(kernel: &Kernel, slot: Slot) {
    wait_until("descriptor to block", || {
        kernel.state_of(slot) == ProcState::Sleeping
    });
}
