use std::sync::atomic::{AtomicU64, Ordering};

use crate::{EntityId, EntryRef, MemoryUsage};

// pagetable hands out zeroed pages lazily, in chunks of
// this many slots. Used to approximate allocated bytes.
const APPROX_PAGE_SPAN: u64 = 4096;

/// Densely packed entity id -> entry reference table.
///
/// Backed by a wait-free, grow-only pagetable, so growth
/// never relocates existing slots and never retires memory.
/// Each slot is an atomically replaceable word: `store` uses
/// release ordering so a reader that observes a reference
/// also observes the fully written array slot it names.
#[derive(Default)]
pub(crate) struct IndexTable {
    table: pagetable::PageTable<AtomicU64>,
    len: AtomicU64,
}

impl IndexTable {
    /// Grows the table so ids `0..n` are addressable. New
    /// slots read as the null reference. Never shrinks.
    pub fn ensure_size(&self, n: u64) {
        if n > self.len.load(Ordering::Acquire) {
            self.len.store(n, Ordering::Release);
        }
    }

    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn load(&self, id: EntityId) -> Option<EntryRef> {
        let len = self.len();
        assert!(
            u64::from(id) < len,
            "entity id {} out of range for index table of length {}",
            id,
            len,
        );
        EntryRef::from_raw(self.table.get(u64::from(id)).load(Ordering::Acquire))
    }

    pub fn store(&self, id: EntityId, entry: Option<EntryRef>) {
        let len = self.len();
        assert!(
            u64::from(id) < len,
            "entity id {} out of range for index table of length {}",
            id,
            len,
        );
        self.table
            .get(u64::from(id))
            .store(EntryRef::opt_to_raw(entry), Ordering::Release);
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let len = self.len();
        let allocated_slots = len.div_ceil(APPROX_PAGE_SPAN) * APPROX_PAGE_SPAN;
        MemoryUsage {
            allocated_bytes: allocated_slots as usize * std::mem::size_of::<AtomicU64>(),
            used_bytes: len as usize * std::mem::size_of::<AtomicU64>(),
            dead_bytes: 0,
            hold_bytes: 0,
        }
    }
}
