//! File-handle collaborator interface.
//!
//! The file system proper lives outside this core. Process lifecycle code
//! needs exactly three things from it: duplicate a handle (fork, thread
//! creation), close a handle (exit, reaping), and look up the root
//! directory (the first process's working directory). [`HandleTable`]
//! provides those three operations over plain reference counts; an
//! embedder with a real file system substitutes its own table behind the
//! same surface.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

/// Capacity of the global handle table.
pub const NHANDLE: usize = 256;

/// An open file handle: an index into the handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Handle(u32);

/// Reference-counted handle table.
///
/// A slot's count is 0 when free. All operations are lock-free; lifecycle
/// code calls them while holding the process table lock without ordering
/// concerns.
pub struct HandleTable {
    refs: Vec<AtomicU32>,
}

impl HandleTable {
    pub fn new() -> Self {
        let mut refs = Vec::with_capacity(NHANDLE);
        refs.resize_with(NHANDLE, || AtomicU32::new(0));
        Self { refs }
    }

    /// Opens a fresh handle with a reference count of one.
    pub fn open(&self) -> Option<Handle> {
        for (i, slot) in self.refs.iter().enumerate() {
            if slot
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(Handle(i as u32));
            }
        }
        None
    }

    /// Duplicates `handle`: one more reference to the same open file.
    pub fn dup(&self, handle: Handle) -> Handle {
        let prev = self.refs[handle.0 as usize].fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "dup of a closed handle");
        handle
    }

    /// Drops one reference to `handle`; the slot frees when the count
    /// reaches zero.
    pub fn close(&self, handle: Handle) {
        let prev = self.refs[handle.0 as usize].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "close of a closed handle");
    }

    /// Current reference count of `handle`.
    pub fn ref_count(&self, handle: Handle) -> u32 {
        self.refs[handle.0 as usize].load(Ordering::Acquire)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_dup_close() {
        let table = HandleTable::new();
        let h = table.open().unwrap();
        assert_eq!(table.ref_count(h), 1);

        let d = table.dup(h);
        assert_eq!(d, h);
        assert_eq!(table.ref_count(h), 2);

        table.close(h);
        table.close(h);
        assert_eq!(table.ref_count(h), 0);

        // The slot is reusable once fully closed.
        let again = table.open().unwrap();
        assert_eq!(again, h);
    }
}
