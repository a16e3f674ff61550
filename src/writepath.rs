use std::sync::atomic::Ordering::{Relaxed, Release};

use crate::buffer::Buffer;
use crate::gc::RetiredRef;
use crate::{debug_delay, EntityId, EntryRef, Scree, NUM_BUFFERS};

/// Fixed fraction of the buffer-id space past which every
/// further id allocation logs a warning. Independent of any
/// `CompactionStrategy`, which only shapes compaction.
const ADDRESS_SPACE_WARN_THRESHOLD: f64 = 0.9;

impl<T: Copy> Scree<T> {
    /// Replace the value sequence for an entity id, growing
    /// the index table to cover it if needed.
    ///
    /// The new sequence is allocated and fully written
    /// before its reference is release-stored into the
    /// index, and only then is the old reference retired:
    /// a concurrent reader sees either the old or the new
    /// sequence, never neither and never a mix. The old
    /// array's memory is handed to the generation hold
    /// queue, not freed.
    pub fn set(&mut self, id: EntityId, values: &[T]) {
        self.ensure_size(u64::from(id) + 1);

        let old = self.inner.indices.load(id);
        let old_len = match old {
            Some(entry) => self.inner.get(entry).len(),
            None => 0,
        };

        let new = self.add(values);
        debug_delay();
        self.inner.indices.store(id, new);

        self.total_values = self.total_values - old_len + values.len();

        if let Some(entry) = old {
            self.remove(entry);
        }
    }

    /// Allocates a slot fitted to `values`, copies them in,
    /// and returns the packed reference. Empty sequences
    /// are represented as the null reference and consume no
    /// storage.
    pub(crate) fn add(&mut self, values: &[T]) -> Option<EntryRef> {
        if values.is_empty() {
            return None;
        }

        let max_small = *self.config.size_classes.last().unwrap();
        if values.len() > max_small {
            Some(self.add_large(values))
        } else {
            Some(self.add_small(values))
        }
    }

    fn add_small(&mut self, values: &[T]) -> EntryRef {
        let class = self.class_by_len[values.len()] as usize;

        if let Some(slot) = self.free_lists[class].pop() {
            let buf = self.inner.buffer(slot.buffer_id());
            // Safety: the slot came off the free list, so
            // its previous occupant was reclaimed and no
            // reader can still observe it.
            unsafe { buf.write_small(slot.offset(), values) };
            buf.dead.fetch_sub(1, Relaxed);
            return EntryRef::new(slot.buffer_id(), slot.offset(), values.len() as u32);
        }

        let buffer_id = self.active_buffer(class);
        let buf = self.inner.buffer(buffer_id);
        let offset = buf.used.load(Relaxed);
        // Safety: `offset` is past the bump index, so the
        // slot has never been published.
        unsafe { buf.write_small(offset as u32, values) };
        buf.used.store(offset + 1, Relaxed);

        EntryRef::new(buffer_id, offset as u32, values.len() as u32)
    }

    fn add_large(&mut self, values: &[T]) -> EntryRef {
        let boxed: Box<[T]> = values.to_vec().into_boxed_slice();
        let class = self.config.size_classes.len();

        if let Some(slot) = self.free_lists[class].pop() {
            let buf = self.inner.buffer(slot.buffer_id());
            // Safety: free-listed slot; the old box's
            // retiring generation was reclaimed.
            unsafe { buf.write_large(slot.offset(), boxed, true) };
            buf.dead.fetch_sub(1, Relaxed);
            return EntryRef::new(slot.buffer_id(), slot.offset(), 0);
        }

        let buffer_id = self.active_buffer(class);
        let buf = self.inner.buffer(buffer_id);
        let offset = buf.used.load(Relaxed);
        // Safety: past the bump index, never published.
        unsafe { buf.write_large(offset as u32, boxed, false) };
        buf.used.store(offset + 1, Relaxed);

        EntryRef::new(buffer_id, offset as u32, 0)
    }

    /// Retires a reference: the slot is handed to the
    /// generation hold queue and will not be overwritten or
    /// reused until its retiring generation is provably
    /// unobservable.
    pub(crate) fn remove(&mut self, entry: EntryRef) {
        let buf = self.inner.buffer(entry.buffer_id());
        buf.holds.fetch_add(1, Relaxed);

        self.retired_refs.push_back(RetiredRef {
            generation: self.inner.gen.current_generation(),
            buffer_seq: buf.seq,
            entry,
        });
    }

    fn active_buffer(&mut self, class: usize) -> u32 {
        if let Some(buffer_id) = self.active[class] {
            if !self.inner.buffer(buffer_id).is_full() {
                return buffer_id;
            }
        }
        self.rotate_buffer(class)
    }

    /// Publishes a fresh buffer for a size class and makes
    /// it the allocation target. The previous active buffer
    /// stays live until its slots die and it is reclaimed
    /// or compacted.
    fn rotate_buffer(&mut self, class: usize) -> u32 {
        let buffer_id = self.allocate_buffer_id();

        let large = class == self.config.size_classes.len();
        let stride = if large {
            1
        } else {
            self.config.size_classes[class]
        };
        let slot_bytes = if large {
            std::mem::size_of::<Box<[T]>>()
        } else {
            stride * std::mem::size_of::<T>()
        };

        let max_entries = (self.config.max_buffer_bytes / slot_bytes)
            .max(self.config.min_entries_per_buffer)
            .min(u32::MAX as usize);
        let capacity = self.next_entries[class].min(max_entries);
        self.next_entries[class] = ((capacity as f64 * self.config.alloc_grow_factor) as usize)
            .clamp(capacity, max_entries);

        self.buffer_seq += 1;
        let buf = if large {
            Buffer::new_large(class, capacity, self.buffer_seq)
        } else {
            Buffer::new_small(class, stride, capacity, self.buffer_seq)
        };

        log::trace!(
            "rotating in buffer {} for size class {} with capacity {}",
            buffer_id,
            class,
            capacity,
        );

        debug_delay();
        self.inner.buffers[buffer_id as usize].store(Box::into_raw(Box::new(buf)), Release);
        self.active[class] = Some(buffer_id);

        buffer_id
    }

    fn allocate_buffer_id(&mut self) -> u32 {
        if let Some(buffer_id) = self.free_ids.pop() {
            return buffer_id;
        }

        assert!(
            (self.next_id as usize) < NUM_BUFFERS,
            "entry reference address space exhausted: all {} buffer ids are live",
            NUM_BUFFERS,
        );

        let buffer_id = self.next_id;
        self.next_id += 1;

        let usage = self.address_space_usage().usage();
        if usage >= ADDRESS_SPACE_WARN_THRESHOLD {
            log::warn!(
                "entry reference address space is {:.0}% consumed - compact or stop \
                 admitting writes before it is exhausted",
                usage * 100.0,
            );
        }

        buffer_id
    }
}
