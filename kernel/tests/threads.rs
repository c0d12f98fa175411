//! Thread lifecycle: creation into a shared address space, private stack
//! pages, exit/join, and handle duplication.

mod common;

use std::sync::Arc;
use std::thread;

use common::{boot, boot_with_frames, fork_child, wait_sleeping, HostPort, NullPort};
use ticketos_kernel::{ProcError, ProcState, PAGE_SIZE};

const OUT_PTR: usize = 64;
const ENTRY: usize = 0x100;
const ARG: usize = 0xAB;

#[test]
fn thread_shares_space_and_gets_a_private_stack() {
    let (kernel, init) = boot();
    let old_sz = kernel.size_of(init);

    let tid = kernel.thread_create(init, OUT_PTR, ENTRY, ARG).unwrap();
    let slot = kernel.slot_of(tid).unwrap();

    // Same page-table root, one page larger, both views in sync.
    assert_eq!(kernel.space_of(slot), kernel.space_of(init));
    assert_eq!(kernel.size_of(init), old_sz + PAGE_SIZE);
    assert_eq!(kernel.size_of(slot), old_sz + PAGE_SIZE);
    assert_eq!(kernel.state_of(slot), ProcState::Runnable);

    // The stack page is eagerly mapped at the old end of the space.
    let space = kernel.space_of(init).unwrap();
    assert!(kernel.vm.pte_of(space, old_sz).unwrap() & 1 != 0);

    // The thread id was written back into the caller's address space.
    let mut buf = [0u8; 8];
    kernel.vm.copy_in(space, OUT_PTR, &mut buf).unwrap();
    assert_eq!(u64::from_le_bytes(buf), tid);
}

#[test]
fn join_reclaims_the_stack_page_and_slot() {
    let (kernel, init) = boot();
    let old_sz = kernel.size_of(init);
    let frames_before = kernel.vm.frames_free();

    let tid = kernel.thread_create(init, OUT_PTR, ENTRY, ARG).unwrap();
    let slot = kernel.slot_of(tid).unwrap();

    kernel.thread_exit(slot, &NullPort);
    assert_eq!(kernel.state_of(slot), ProcState::Zombie);

    assert_eq!(kernel.thread_join(init, tid, &NullPort), Ok(tid));
    assert_eq!(kernel.state_of(slot), ProcState::Unused);

    // The private stack page is unmapped from the shared space and every
    // frame (stack page + kernel stack) is back in the arena.
    let space = kernel.space_of(init).unwrap();
    assert!(kernel.vm.pte_of(space, old_sz).map_or(true, |e| e & 1 == 0));
    assert_eq!(kernel.vm.frames_free(), frames_before);
}

#[test]
fn join_blocks_until_the_thread_exits() {
    let (kernel, init) = boot();
    let tid = kernel.thread_create(init, OUT_PTR, ENTRY, ARG).unwrap();
    let slot = kernel.slot_of(tid).unwrap();

    let joiner = {
        let kernel = Arc::clone(&kernel);
        thread::spawn(move || {
            let port = HostPort {
                kernel: Arc::clone(&kernel),
            };
            kernel.thread_join(init, tid, &port)
        })
    };
    wait_sleeping(&kernel, init);

    kernel.thread_exit(slot, &NullPort);
    assert_eq!(joiner.join().unwrap(), Ok(tid));
}

#[test]
fn join_rejects_foreign_or_missing_threads() {
    let (kernel, init) = boot();
    assert_eq!(
        kernel.thread_join(init, 999, &NullPort),
        Err(ProcError::NoSuchThread)
    );

    // A plain child process is not joinable.
    let (pid, _) = fork_child(&kernel, init);
    assert_eq!(
        kernel.thread_join(init, pid, &NullPort),
        Err(ProcError::NoSuchThread)
    );

    // Another process cannot join somebody else's thread.
    let (_, stranger) = fork_child(&kernel, init);
    let tid = kernel.thread_create(init, OUT_PTR, ENTRY, ARG).unwrap();
    assert_eq!(
        kernel.thread_join(stranger, tid, &NullPort),
        Err(ProcError::NoSuchThread)
    );
}

#[test]
fn thread_exit_of_a_plain_process_is_a_noop() {
    let (kernel, init) = boot();
    kernel.thread_exit(init, &NullPort);
    assert_eq!(kernel.state_of(init), ProcState::Runnable);
}

#[test]
fn threads_are_invisible_to_wait() {
    let (kernel, init) = boot();
    let tid = kernel.thread_create(init, OUT_PTR, ENTRY, ARG).unwrap();
    let slot = kernel.slot_of(tid).unwrap();
    kernel.thread_exit(slot, &NullPort);

    // wait() skips thread descriptors even as zombies.
    assert_eq!(kernel.wait(init, &NullPort), Err(ProcError::NoChildren));
    assert_eq!(kernel.thread_join(init, tid, &NullPort), Ok(tid));
}

#[test]
fn thread_dups_file_handles_and_exit_closes_them() {
    let (kernel, init) = boot();
    let root = kernel.root_dir();
    let base = kernel.files.ref_count(root);

    let tid = kernel.thread_create(init, OUT_PTR, ENTRY, ARG).unwrap();
    assert_eq!(kernel.files.ref_count(root), base + 1);

    let slot = kernel.slot_of(tid).unwrap();
    kernel.thread_exit(slot, &NullPort);
    assert_eq!(kernel.files.ref_count(root), base);
    kernel.thread_join(init, tid, &NullPort).unwrap();
}

#[test]
fn nested_threads_share_one_main_descriptor() {
    let (kernel, init) = boot();
    let tid_a = kernel.thread_create(init, OUT_PTR, ENTRY, ARG).unwrap();
    let slot_a = kernel.slot_of(tid_a).unwrap();

    // A thread spawning a thread attaches the grandchild to the same main.
    let tid_b = kernel.thread_create(slot_a, OUT_PTR, ENTRY, ARG).unwrap();

    // Only the main descriptor can join it.
    assert_eq!(
        kernel.thread_join(slot_a, tid_b, &NullPort),
        Err(ProcError::NoSuchThread)
    );
    let slot_b = kernel.slot_of(tid_b).unwrap();
    kernel.thread_exit(slot_b, &NullPort);
    assert_eq!(kernel.thread_join(init, tid_b, &NullPort), Ok(tid_b));
}

#[test]
fn thread_creation_rolls_back_on_stack_exhaustion() {
    // Enough for init (kernel stack + 1 page) and the thread's kernel
    // stack, but not for the thread's stack page.
    let (kernel, init) = boot_with_frames(3);
    let frames_before = kernel.vm.frames_free();
    let sz_before = kernel.size_of(init);

    assert_eq!(
        kernel.thread_create(init, OUT_PTR, ENTRY, ARG),
        Err(ProcError::OutOfMemory)
    );
    assert_eq!(kernel.vm.frames_free(), frames_before);
    assert_eq!(kernel.size_of(init), sz_before);
}

#[test]
fn thread_create_rejects_an_unmapped_out_pointer() {
    let (kernel, init) = boot();
    let frames_before = kernel.vm.frames_free();
    let sz_before = kernel.size_of(init);

    // Far beyond the mapped first page (and the lazily grown region).
    let bad_ptr = 16 * PAGE_SIZE;
    assert_eq!(
        kernel.thread_create(init, bad_ptr, ENTRY, ARG),
        Err(ProcError::BadAddress)
    );
    assert_eq!(kernel.vm.frames_free(), frames_before);
    assert_eq!(kernel.size_of(init), sz_before);
}
