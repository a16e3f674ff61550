//! # Scree
//!
//! Scree is a size-classed array store for holding many
//! small, immutable value sequences behind a dense,
//! mutable, integer-indexed lookup table. It is the storage
//! engine you would put underneath a multi-valued attribute
//! field in a columnar document store: one writer replaces
//! whole sequences, unboundedly many readers traverse them
//! without locks, and retired memory is reclaimed through
//! an epoch ("generation") scheme rather than being freed
//! eagerly.
//!
//! At a high level it supports `set`/`get` of `&[T]` runs
//! keyed by a dense `u32` entity id. Replaced arrays are
//! retired, not freed: the writer advances a generation
//! after each mutation batch, readers pin the current
//! generation with a guard while traversing, and the host
//! periodically tells the store which generations are
//! provably unobservable so their retired memory can be
//! reclaimed. Garbage collection of fragmented buffers is
//! manual: `compact_worst` relocates live arrays out of the
//! worst buffers and rewrites every index entry that named
//! them. Scree does not create any threads or call
//! `compact_worst` automatically under any conditions.
//!
//! Allocation is bump-pointer into per-size-class buffers,
//! with optional free lists for slot reuse; arrays larger
//! than the biggest size class get a dedicated allocation.
//! Nothing in the store blocks: writer/reader coordination
//! is a release-ordered store of a packed entry reference
//! and an acquire load on the other side.
//!
//! # Examples
//!
//! ```
//! use scree::{CompactionStrategy, Scree};
//!
//! let mut store: Scree<u64> = Scree::new();
//!
//! store.set(0, &[1, 2, 3]);
//! store.set(4, &[7]);
//! assert_eq!(store.get(0), &[1, 2, 3]);
//! assert_eq!(store.get(4), &[7]);
//!
//! // overwriting retires the old array ...
//! store.set(0, &[9]);
//! assert_eq!(store.get(0), &[9]);
//!
//! // ... which is freed once the writer advances the
//! // generation and no reader can still observe it
//! store.on_generation_change(1);
//! let first_used = store.update_first_used_generation();
//! store.remove_old_generations(first_used);
//!
//! // relocate live arrays out of fragmented buffers
//! let relocated = store.compact_worst(&CompactionStrategy::default());
//! assert_eq!(store.get(0), &[9]);
//!
//! // print out system statistics
//! dbg!(store.stats());
//! # let _ = relocated;
//! ```
//!
//! Concurrent readers hold a cheap cloneable handle and pin
//! a generation for the duration of a traversal:
//!
//! ```
//! # use scree::Scree;
//! let mut store: Scree<u32> = Scree::new();
//! store.set(1, &[10, 20]);
//!
//! let reader = store.reader();
//! let guard = reader.pin();
//! assert_eq!(guard.get(1), &[10, 20]);
//! ```
//!
//! If you want to customize the settings, you may specify
//! your own `Config`:
//!
//! ```
//! let config = scree::Config {
//!     min_entries_per_buffer: 64,
//!     enable_free_lists: false,
//!     ..Default::default()
//! };
//!
//! let store = config.build::<i64>().unwrap();
//! # drop(store);
//! ```
use std::sync::{
    atomic::{AtomicPtr, Ordering::Acquire},
    Arc,
};

mod buffer;
mod config;
mod debug_delay;
mod entry_ref;
mod gc;
mod generation;
mod index_table;
mod readpath;
mod writepath;

pub use config::{CompactionStrategy, Config, InvalidConfig};
pub use readpath::{ReadGuard, ScreeReader};

use buffer::Buffer;
use debug_delay::debug_delay;
use entry_ref::{EntryRef, NUM_BUFFERS};
use gc::{RetiredBuffer, RetiredRef};
use generation::GenerationHandler;
use index_table::IndexTable;

/// Dense entity (document/row) identity. The index table
/// grows to cover the maximum id ever passed to
/// [`Scree::ensure_size`] or [`Scree::set`].
pub type EntityId = u32;

/// Aggregated byte counts for a store, in the shape
/// compaction decisions are made from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Bytes backing buffers and the index table, whether
    /// or not they hold live data.
    pub allocated_bytes: usize,
    /// Bytes of slots that have been handed out, live or
    /// not.
    pub used_bytes: usize,
    /// Bytes of reclaimed slots awaiting reuse or
    /// compaction.
    pub dead_bytes: usize,
    /// Bytes retired but not yet proven unobservable.
    pub hold_bytes: usize,
}

impl MemoryUsage {
    pub fn merge(&mut self, other: MemoryUsage) {
        self.allocated_bytes += other.allocated_bytes;
        self.used_bytes += other.used_bytes;
        self.dead_bytes += other.dead_bytes;
        self.hold_bytes += other.hold_bytes;
    }
}

/// Consumption of the packed entry reference encoding's
/// buffer-id space. `usage()` approaching 1.0 means the
/// store is running out of encodable buffers and the host
/// should force compaction or stop admitting writes; the
/// store panics rather than ever wrapping silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    /// Buffer ids currently live (published or on hold).
    pub used: usize,
    /// Total encodable buffer ids.
    pub limit: usize,
}

impl AddressSpace {
    pub fn usage(&self) -> f64 {
        self.used as f64 / self.limit as f64
    }
}

/// Statistics for store contents, to base decisions around
/// calls to `compact_worst` and `remove_old_generations`.
#[derive(Debug)]
pub struct Stats {
    /// Array slots handed out across all buffers,
    /// including retired and reclaimed ones.
    pub stored_arrays: u64,
    /// Slots whose retiring generation has been reclaimed;
    /// these are fragmentation until reused or compacted.
    pub dead_arrays: u64,
    /// Slots retired but still possibly observable by a
    /// reader.
    pub on_hold_arrays: u64,
    /// The ratio of live slots to all handed-out slots.
    /// This is another way of expressing fragmentation.
    pub live_ratio: f32,
    /// Published buffers currently backing the store.
    pub buffers: usize,
    /// Sum of the lengths of all currently-live sequences.
    pub total_values: u64,
    /// The writer's current generation.
    pub current_generation: u64,
    /// Oldest generation a reader may still observe.
    pub first_used_generation: u64,
}

/// State shared between the writer and all reader handles.
pub(crate) struct Inner<T: Copy> {
    /// Published buffers, indexed by the buffer id packed
    /// into entry references. A null slot is an unallocated
    /// or freed id.
    buffers: Box<[AtomicPtr<Buffer<T>>]>,
    indices: IndexTable,
    gen: GenerationHandler,
}

// Safety: buffers are reached only through the
// acquire/release publication protocol; `T` crosses threads
// inside them.
unsafe impl<T: Copy + Send + Sync> Send for Inner<T> {}
unsafe impl<T: Copy + Send + Sync> Sync for Inner<T> {}

impl<T: Copy> Inner<T> {
    fn buffer(&self, buffer_id: u32) -> &Buffer<T> {
        let ptr = self.buffers[buffer_id as usize].load(Acquire);
        assert!(
            !ptr.is_null(),
            "entry reference names buffer {} which is not live",
            buffer_id,
        );
        unsafe { &*ptr }
    }

    fn get(&self, entry: EntryRef) -> &[T] {
        let buf = self.buffer(entry.buffer_id());
        // Safety: the reference was published with release
        // ordering after the slot was written, and the
        // caller's position (writer, or reader holding a
        // generation guard) keeps the slot from being
        // reclaimed.
        unsafe { buf.read(entry.offset(), entry.size_tag()) }
    }
}

impl<T: Copy> Drop for Inner<T> {
    fn drop(&mut self) {
        for slot in self.buffers.iter() {
            let ptr = slot.load(Acquire);
            if !ptr.is_null() {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

/// Generation-reclaimed, size-classed array store. A nice
/// solution to back multi-valued attribute fields, for
/// people building their own column stores.
///
/// All mutation goes through exactly one `Scree` value (the
/// `&mut self` receivers are the single-writer rule made
/// compile-time); reads may additionally happen through any
/// number of [`ScreeReader`] clones on other threads.
pub struct Scree<T: Copy> {
    inner: Arc<Inner<T>>,
    config: Config,
    /// Logical array length -> size class index.
    class_by_len: Vec<u32>,
    /// Active (allocating) buffer per size class; the last
    /// entry is the dedicated large-array class.
    active: Vec<Option<u32>>,
    /// Reusable reclaimed slots per size class.
    free_lists: Vec<Vec<EntryRef>>,
    /// Slot count for the next buffer of each size class.
    next_entries: Vec<usize>,
    /// Buffer ids recovered from freed buffers.
    free_ids: Vec<u32>,
    next_id: u32,
    buffer_seq: u64,
    retired_refs: std::collections::VecDeque<RetiredRef>,
    retired_buffers: std::collections::VecDeque<RetiredBuffer>,
    /// Running count of live stored elements. Plain field:
    /// only the writer reads or writes it, which resolves
    /// any question of transient miscounts under concurrency.
    total_values: usize,
}

impl<T: Copy> Default for Scree<T> {
    fn default() -> Scree<T> {
        Scree::new()
    }
}

impl<T: Copy> Scree<T> {
    /// A store with default configuration.
    pub fn new() -> Scree<T> {
        Config::default().build().unwrap()
    }

    pub(crate) fn from_config(config: Config) -> Scree<T> {
        assert!(
            std::mem::size_of::<T>() != 0,
            "zero-sized element types are not supported",
        );

        let max_small = *config.size_classes.last().unwrap();
        let mut class_by_len = vec![0; max_small + 1];
        for (len, slot) in class_by_len.iter_mut().enumerate().skip(1) {
            *slot = config.size_classes.partition_point(|&c| c < len) as u32;
        }

        // one allocation context per size class, plus the
        // large-array class at the end
        let classes = config.size_classes.len() + 1;

        let buffers = (0..NUM_BUFFERS)
            .map(|_| AtomicPtr::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Scree {
            inner: Arc::new(Inner {
                buffers,
                indices: IndexTable::default(),
                gen: GenerationHandler::new(),
            }),
            class_by_len,
            active: vec![None; classes],
            free_lists: vec![vec![]; classes],
            next_entries: vec![config.min_entries_per_buffer; classes],
            free_ids: vec![],
            next_id: 0,
            buffer_seq: 0,
            retired_refs: Default::default(),
            retired_buffers: Default::default(),
            total_values: 0,
            config,
        }
    }

    /// A cheap cloneable handle for concurrent readers.
    pub fn reader(&self) -> ScreeReader<T> {
        readpath::reader(&self.inner)
    }

    /// Grows the index table so ids `0..n` are addressable;
    /// new ids read as empty sequences.
    pub fn ensure_size(&mut self, n: u64) {
        self.inner.indices.ensure_size(n);
    }

    /// Sum of the lengths of all currently-live sequences.
    pub fn total_values(&self) -> usize {
        self.total_values
    }

    pub fn current_generation(&self) -> u64 {
        self.inner.gen.current_generation()
    }

    pub fn first_used_generation(&self) -> u64 {
        self.inner.gen.first_used_generation()
    }

    /// Statistics about current buffers, intended to inform
    /// decisions about when to call `compact_worst` based on
    /// desired space amplification characteristics.
    #[doc(alias = "statistics")]
    #[doc(alias = "metrics")]
    #[doc(alias = "info")]
    pub fn stats(&self) -> Stats {
        let mut stored_arrays = 0;
        let mut dead_arrays = 0;
        let mut on_hold_arrays = 0;
        let mut buffers = 0;

        for buffer_id in 0..self.next_id {
            let ptr = self.inner.buffers[buffer_id as usize].load(Acquire);
            if ptr.is_null() {
                continue;
            }
            let buf = unsafe { &*ptr };
            buffers += 1;
            stored_arrays += buf.used.load(std::sync::atomic::Ordering::Relaxed) as u64;
            dead_arrays += buf.dead.load(std::sync::atomic::Ordering::Relaxed) as u64;
            on_hold_arrays += buf.holds.load(std::sync::atomic::Ordering::Relaxed) as u64;
        }

        let live_arrays = stored_arrays - dead_arrays - on_hold_arrays;
        let live_ratio = live_arrays as f32 / stored_arrays.max(1) as f32;

        Stats {
            stored_arrays,
            dead_arrays,
            on_hold_arrays,
            live_ratio,
            buffers,
            total_values: self.total_values as u64,
            current_generation: self.current_generation(),
            first_used_generation: self.first_used_generation(),
        }
    }
}

impl<T: Copy> std::fmt::Debug for Scree<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scree").field("stats", &self.stats()).finish()
    }
}
