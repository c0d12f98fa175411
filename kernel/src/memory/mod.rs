// =============================================================================
// TicketOS — Memory Management
// =============================================================================
//
// Three layers, bottom up:
//
//   pmm.rs    — the physical frame arena: fixed-size 4 KiB frames handed out
//               by a bitmap allocator. Everything page-sized comes from here:
//               user pages and per-process kernel stacks alike.
//   paging.rs — software page tables: a two-level mapping from virtual page
//               number to (frame, permissions, present). Page-table-sized
//               blocks come from a dedicated freelist, NOT from the frame
//               arena, so frequent small table allocations never fragment it.
//   vmm.rs    — address-space operations built on the two: grow, shrink,
//               eager duplication for fork, byte copies into a foreign
//               space, and demand-fault service.
//
// An address space is exclusively owned by its main process descriptor.
// Thread descriptors carry a non-owning copy of the root id and must never
// free it — teardown goes through the owner's reap path only.
// =============================================================================

pub mod paging;
pub mod pmm;
pub mod vmm;

/// Size of one page / one physical frame.
pub const PAGE_SIZE: usize = 4096;

/// Log2 of `PAGE_SIZE`.
pub const PAGE_SHIFT: usize = 12;

/// First address belonging to the kernel. User mappings live strictly below.
pub const KERNEL_BASE: usize = 0x8000_0000;

/// Upper bound on the size of a single user address space (4 MiB).
///
/// Growth past this limit is a recoverable error, never a panic.
pub const USER_LIMIT: usize = 0x40_0000;

/// Round `addr` down to a page boundary.
#[inline]
pub const fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Round `addr` up to a page boundary.
#[inline]
pub const fn page_align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
