//! Sleep/wakeup: the no-missed-wakeup guarantee, channel matching,
//! single-target wakeup order, and timed sleep.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{boot, fork_child, wait_sleeping, HostPort};
use ticketos_kernel::{ProcError, ProcState};

#[test]
fn wakeup_after_sleep_always_lands() {
    let (kernel, init) = boot();
    let (_, slot) = fork_child(&kernel, init);
    let chan = kernel.get_channel();

    let sleeper = {
        let kernel = Arc::clone(&kernel);
        thread::spawn(move || {
            let port = HostPort {
                kernel: Arc::clone(&kernel),
            };
            kernel.sleep_on(slot, chan, &port);
        })
    };

    // Strictly after the sleeper has recorded itself sleeping.
    wait_sleeping(&kernel, slot);
    kernel.wakeup(chan);
    sleeper.join().unwrap();
    assert_eq!(kernel.state_of(slot), ProcState::Runnable);
}

#[test]
fn wakeup_on_a_different_channel_does_not_wake() {
    let (kernel, init) = boot();
    let (_, slot) = fork_child(&kernel, init);
    let chan = kernel.get_channel();
    let other = kernel.get_channel();
    assert_ne!(chan, other);

    let sleeper = {
        let kernel = Arc::clone(&kernel);
        thread::spawn(move || {
            let port = HostPort {
                kernel: Arc::clone(&kernel),
            };
            kernel.sleep_on(slot, chan, &port);
        })
    };
    wait_sleeping(&kernel, slot);

    kernel.wakeup(other);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(kernel.state_of(slot), ProcState::Sleeping);

    kernel.wakeup(chan);
    sleeper.join().unwrap();
}

#[test]
fn broadcast_wakes_every_sleeper() {
    let (kernel, init) = boot();
    let (_, a) = fork_child(&kernel, init);
    let (_, b) = fork_child(&kernel, init);
    let chan = kernel.get_channel();

    let spawn_sleeper = |slot| {
        let kernel = Arc::clone(&kernel);
        thread::spawn(move || {
            let port = HostPort {
                kernel: Arc::clone(&kernel),
            };
            kernel.sleep_on(slot, chan, &port);
        })
    };
    let ta = spawn_sleeper(a);
    let tb = spawn_sleeper(b);
    wait_sleeping(&kernel, a);
    wait_sleeping(&kernel, b);

    kernel.wakeup(chan);
    ta.join().unwrap();
    tb.join().unwrap();
}

#[test]
fn single_wake_releases_first_match_in_table_order() {
    let (kernel, init) = boot();
    let (_, a) = fork_child(&kernel, init);
    let (_, b) = fork_child(&kernel, init);
    assert!(a < b);
    let chan = kernel.get_channel();

    let spawn_sleeper = |slot| {
        let kernel = Arc::clone(&kernel);
        thread::spawn(move || {
            let port = HostPort {
                kernel: Arc::clone(&kernel),
            };
            kernel.sleep_on(slot, chan, &port);
        })
    };
    let ta = spawn_sleeper(a);
    let tb = spawn_sleeper(b);
    wait_sleeping(&kernel, a);
    wait_sleeping(&kernel, b);

    // The lower slot wakes first; the other stays blocked.
    kernel.wakeup_one(chan);
    ta.join().unwrap();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(kernel.state_of(b), ProcState::Sleeping);

    kernel.wakeup_one(chan);
    tb.join().unwrap();
}

#[test]
fn timed_sleep_waits_for_the_full_duration() {
    let (kernel, init) = boot();
    let (_, slot) = fork_child(&kernel, init);

    let sleeper = {
        let kernel = Arc::clone(&kernel);
        thread::spawn(move || {
            let port = HostPort {
                kernel: Arc::clone(&kernel),
            };
            kernel.sleep_ticks(slot, 10, &port)
        })
    };
    wait_sleeping(&kernel, slot);

    // Nine ticks are not enough.
    for _ in 0..9 {
        kernel.clock_tick();
    }
    thread::sleep(Duration::from_millis(20));
    assert_eq!(kernel.state_of(slot), ProcState::Sleeping);

    kernel.clock_tick();
    assert_eq!(sleeper.join().unwrap(), Ok(()));
    assert_eq!(kernel.uptime(), 10);
}

#[test]
fn killed_timed_sleeper_returns_an_error() {
    let (kernel, init) = boot();
    let (pid, slot) = fork_child(&kernel, init);

    let sleeper = {
        let kernel = Arc::clone(&kernel);
        thread::spawn(move || {
            let port = HostPort {
                kernel: Arc::clone(&kernel),
            };
            kernel.sleep_ticks(slot, 1_000_000, &port)
        })
    };
    wait_sleeping(&kernel, slot);

    kernel.kill(pid).unwrap();
    assert_eq!(sleeper.join().unwrap(), Err(ProcError::Killed));
}

#[test]
fn channel_ids_start_at_three_and_increase() {
    let (kernel, _init) = boot();
    let first = kernel.get_channel();
    let second = kernel.get_channel();
    assert_eq!(first.id(), 3);
    assert_eq!(second.id(), 4);
}
