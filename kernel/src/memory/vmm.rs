// =============================================================================
// TicketOS — Virtual Memory Manager
// =============================================================================
//
// Address-space operations built on the frame arena and the page-table
// heap: grow, shrink, eager duplication for fork, byte copies into a
// foreign address space, and demand-fault service.
//
// Duplication is a full copy — every mapped source page gets a freshly
// allocated frame in the child. There is no copy-on-write; fork cost is
// O(address-space size).
//
// LOCK ORDER (see also sync/mod.rs): table heap before frame arena.
// Every operation here takes both in that order and holds them for the
// whole operation.
// =============================================================================

use spin::{Mutex, MutexGuard};

use crate::memory::paging::{self, PteFlags, TableHeap, TableId, DIR_SPAN};
use crate::memory::pmm::{Frame, FrameArena};
use crate::memory::{page_align_down, page_align_up, KERNEL_BASE, PAGE_SIZE, USER_LIMIT};
use crate::task::process::Slot;
use crate::Kernel;

/// Errors from address-space operations.
///
/// Every variant is recoverable: the operation rolls back whatever it
/// allocated before reporting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The frame arena is exhausted.
    OutOfMemory,
    /// The requested size exceeds the per-process address-space limit.
    LimitExceeded,
    /// The address is outside the faulting process's valid range, or the
    /// target of a copy is not mapped.
    BadAddress,
}

/// A user address space: the root of its two-level page table.
///
/// The value is a plain id — cheap to copy, and meaningless without the
/// [`Vm`] that owns the backing tables. The main descriptor owns the space;
/// thread descriptors carry the same id non-owningly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrSpace {
    root: TableId,
}

/// The virtual memory manager: the page-table heap and the frame arena,
/// each behind its own lock.
pub struct Vm {
    tables: Mutex<TableHeap>,
    phys: Mutex<FrameArena>,
}

impl Vm {
    pub fn new(total_frames: usize) -> Self {
        Self {
            tables: Mutex::new(TableHeap::new()),
            phys: Mutex::new(FrameArena::new(total_frames)),
        }
    }

    fn lock_both(&self) -> (MutexGuard<'_, TableHeap>, MutexGuard<'_, FrameArena>) {
        (self.tables.lock(), self.phys.lock())
    }

    /// Creates an empty address space.
    pub fn create_space(&self) -> AddrSpace {
        AddrSpace {
            root: self.tables.lock().alloc(),
        }
    }

    /// Grows a space by eagerly mapping zeroed pages over `[oldsz, newsz)`.
    ///
    /// Returns the new size. On frame exhaustion every page mapped by this
    /// call is unmapped and freed again before the error is reported.
    /// Shrinking is not done here; a `newsz` below `oldsz` is a no-op.
    pub fn alloc_range(&self, space: AddrSpace, oldsz: usize, newsz: usize) -> Result<usize, VmError> {
        let (mut heap, mut phys) = self.lock_both();
        alloc_locked(&mut heap, &mut phys, space.root, oldsz, newsz)
    }

    /// Shrinks a space by unmapping and freeing whole pages in
    /// `[newsz, oldsz)`. Returns the new size.
    ///
    /// The start is rounded up to a page boundary so a partially used page
    /// survives; directory spans with no leaf table are skipped whole.
    pub fn dealloc_range(&self, space: AddrSpace, oldsz: usize, newsz: usize) -> usize {
        let (mut heap, mut phys) = self.lock_both();
        dealloc_locked(&mut heap, &mut phys, space.root, oldsz, newsz)
    }

    /// Eagerly duplicates the first `sz` bytes of `space` into a fresh
    /// address space: every mapped page is copied into a newly allocated
    /// frame with the same permissions. Unmapped pages (never faulted in)
    /// stay unmapped in the copy.
    pub fn duplicate(&self, space: AddrSpace, sz: usize) -> Result<AddrSpace, VmError> {
        let (mut heap, mut phys) = self.lock_both();
        let new_root = heap.alloc();

        let mut va = 0;
        while va < sz {
            let Some(entry) = paging::entry_at(&heap, space.root, va) else {
                // No leaf table for this span in the source.
                va = (va / DIR_SPAN + 1) * DIR_SPAN;
                continue;
            };
            if entry.is_present() {
                let src = entry.frame();
                let Some(dst) = phys.alloc() else {
                    log::warn!("duplicate: out of frames at {va:#x}");
                    dealloc_locked(&mut heap, &mut phys, new_root, va, 0);
                    paging::free_tables(&mut heap, new_root);
                    return Err(VmError::OutOfMemory);
                };
                phys.copy_frame(dst, src);
                paging::map_page(&mut heap, new_root, va, dst, entry.flags());
            }
            va += PAGE_SIZE;
        }

        Ok(AddrSpace { root: new_root })
    }

    /// Releases a space: frees every mapped frame, then returns all of its
    /// table blocks to the freelist. Only the owning descriptor's teardown
    /// path may call this.
    pub fn free_space(&self, space: AddrSpace) {
        let (mut heap, mut phys) = self.lock_both();
        dealloc_locked(&mut heap, &mut phys, space.root, USER_LIMIT, 0);
        paging::free_tables(&mut heap, space.root);
    }

    /// Copies `bytes` into `space` at virtual address `va`, page by page.
    ///
    /// Fails without side effects on the first unmapped page.
    pub fn copy_out(&self, space: AddrSpace, va: usize, bytes: &[u8]) -> Result<(), VmError> {
        let (heap, mut phys) = self.lock_both();
        // Probe the whole range first so a fault mid-copy can't leave a
        // partial write behind.
        probe_range(&heap, space.root, va, bytes.len())?;
        let mut va = va;
        let mut src = bytes;
        while !src.is_empty() {
            let page = page_align_down(va);
            let frame = paging::translate(&heap, space.root, page).ok_or(VmError::BadAddress)?;
            let off = va - page;
            let n = (PAGE_SIZE - off).min(src.len());
            phys.bytes_mut(frame)[off..off + n].copy_from_slice(&src[..n]);
            src = &src[n..];
            va = page + PAGE_SIZE;
        }
        Ok(())
    }

    /// Copies bytes out of `space` at `va` into `buf`.
    pub fn copy_in(&self, space: AddrSpace, va: usize, buf: &mut [u8]) -> Result<(), VmError> {
        let (heap, phys) = self.lock_both();
        let mut va = va;
        let mut remaining: &mut [u8] = buf;
        while !remaining.is_empty() {
            let page = page_align_down(va);
            let frame = paging::translate(&heap, space.root, page).ok_or(VmError::BadAddress)?;
            let off = va - page;
            let n = (PAGE_SIZE - off).min(remaining.len());
            let (head, tail) = core::mem::take(&mut remaining).split_at_mut(n);
            head.copy_from_slice(&phys.bytes(frame)[off..off + n]);
            remaining = tail;
            va = page + PAGE_SIZE;
        }
        Ok(())
    }

    /// Maps one zeroed frame at the page-aligned address `va` unless a
    /// mapping already exists. Returns whether a fresh page was mapped —
    /// faulting twice on the same page maps it once.
    pub fn map_on_demand(&self, space: AddrSpace, va: usize) -> Result<bool, VmError> {
        let (mut heap, mut phys) = self.lock_both();
        if let Some(entry) = paging::entry_at(&heap, space.root, va) {
            if entry.is_present() {
                return Ok(false);
            }
        }
        let Some(frame) = phys.alloc_zeroed() else {
            log::warn!("map_on_demand: out of frames for {va:#x}");
            return Err(VmError::OutOfMemory);
        };
        paging::map_page(&mut heap, space.root, va, frame, PteFlags::USER_DATA);
        Ok(true)
    }

    /// Raw leaf entry for `va`, for debugging and tests. `None` when even
    /// the intermediate table is absent.
    pub fn pte_of(&self, space: AddrSpace, va: usize) -> Option<u64> {
        let heap = self.tables.lock();
        paging::entry_at(&heap, space.root, va).map(|e| e.raw())
    }

    /// Allocates one zeroed frame directly (kernel-stack allocation path).
    pub(crate) fn alloc_frame(&self) -> Option<Frame> {
        self.phys.lock().alloc_zeroed()
    }

    /// Returns a directly allocated frame.
    pub(crate) fn free_frame(&self, frame: Frame) {
        self.phys.lock().free(frame);
    }

    /// Number of free frames in the arena.
    pub fn frames_free(&self) -> usize {
        self.phys.lock().free_frames()
    }

    /// Number of page-table blocks currently handed out.
    pub fn tables_in_use(&self) -> usize {
        self.tables.lock().in_use()
    }
}

fn alloc_locked(
    heap: &mut TableHeap,
    phys: &mut FrameArena,
    root: TableId,
    oldsz: usize,
    newsz: usize,
) -> Result<usize, VmError> {
    if newsz > USER_LIMIT {
        return Err(VmError::LimitExceeded);
    }
    if newsz < oldsz {
        return Ok(oldsz);
    }

    let mut va = page_align_up(oldsz);
    while va < newsz {
        let Some(frame) = phys.alloc_zeroed() else {
            log::warn!("alloc_range: out of frames at {va:#x}");
            dealloc_locked(heap, phys, root, va, oldsz);
            return Err(VmError::OutOfMemory);
        };
        paging::map_page(heap, root, va, frame, PteFlags::USER_DATA);
        va += PAGE_SIZE;
    }
    Ok(newsz)
}

fn dealloc_locked(
    heap: &mut TableHeap,
    phys: &mut FrameArena,
    root: TableId,
    oldsz: usize,
    newsz: usize,
) -> usize {
    if newsz >= oldsz {
        return oldsz;
    }

    let mut va = page_align_up(newsz);
    while va < oldsz {
        match paging::entry_at(heap, root, va) {
            None => {
                // No leaf table covers this span; skip to the next one.
                va = (va / DIR_SPAN + 1) * DIR_SPAN;
            }
            Some(entry) => {
                if entry.is_present() {
                    let frame = paging::unmap_page(heap, root, va)
                        .expect("present entry must unmap");
                    phys.free(frame);
                }
                va += PAGE_SIZE;
            }
        }
    }
    newsz
}

/// Verifies every page touched by `[va, va + len)` is mapped.
fn probe_range(heap: &TableHeap, root: TableId, va: usize, len: usize) -> Result<(), VmError> {
    if len == 0 {
        return Ok(());
    }
    let mut page = page_align_down(va);
    let end = va + len;
    while page < end {
        if paging::translate(heap, root, page).is_none() {
            return Err(VmError::BadAddress);
        }
        page += PAGE_SIZE;
    }
    Ok(())
}

impl Kernel {
    /// Services a page fault at `addr` raised by the descriptor `cur`.
    ///
    /// A fault below the kernel boundary and within the process's current
    /// size is satisfied by mapping one zeroed page at the aligned address;
    /// a second fault on the same page is a successful no-op. Anything else
    /// is an error the trap layer reports as fatal to the faulting process
    /// — it is not retried.
    pub fn handle_page_fault(&self, cur: Slot, addr: usize) -> Result<(), VmError> {
        let va = page_align_down(addr);
        if va >= KERNEL_BASE {
            log::warn!("page fault in kernel range at {addr:#x}");
            return Err(VmError::BadAddress);
        }

        let (space, sz) = {
            let table = self.ptable.lock();
            (table[cur].space, table[cur].sz)
        };
        let Some(space) = space else {
            return Err(VmError::BadAddress);
        };
        if va >= sz {
            log::warn!("page fault beyond process size: {addr:#x} >= {sz:#x}");
            return Err(VmError::BadAddress);
        }

        self.vm.map_on_demand(space, va).map(|_| ())
    }
}
