use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::buffer::BufferKind;
use crate::{AddressSpace, CompactionStrategy, EntryRef, MemoryUsage, Scree, NUM_BUFFERS};

/// A replaced array awaiting reclamation. `buffer_seq`
/// disambiguates buffer incarnations: if the buffer id was
/// freed and reused before this entry drains, the slot it
/// names no longer exists and reclamation must not touch
/// the new occupant.
pub(crate) struct RetiredRef {
    pub generation: u64,
    pub buffer_seq: u64,
    pub entry: EntryRef,
}

/// A compacted buffer awaiting wholesale free.
pub(crate) struct RetiredBuffer {
    pub generation: u64,
    pub id: u32,
}

impl<T: Copy> Scree<T> {
    /// Writer-only: marks the start of a new generation.
    /// Everything retired from here on is tagged with
    /// `new_generation` and stays resident until a
    /// [`Scree::remove_old_generations`] call proves no
    /// reader can still observe it.
    pub fn on_generation_change(&mut self, new_generation: u64) {
        self.inner.gen.on_generation_change(new_generation);
    }

    /// Recomputes the oldest generation any reader may still
    /// observe and returns it. The host typically feeds this
    /// straight into [`Scree::remove_old_generations`].
    pub fn update_first_used_generation(&mut self) -> u64 {
        self.inner.gen.update_first_used_generation()
    }

    /// Reclaims everything retired before `first_used`.
    ///
    /// The argument is clamped to the handler's own view of
    /// the oldest pinned generation, so a stale or
    /// over-eager value can never free memory a guard still
    /// protects. Reclaimed slots go onto free lists (or, per
    /// configuration, trigger wholesale buffer frees), and
    /// compacted buffers whose retiring generation has
    /// drained are deallocated.
    pub fn remove_old_generations(&mut self, first_used: u64) {
        let safe = self.inner.gen.update_first_used_generation().min(first_used);

        while let Some(front) = self.retired_refs.front() {
            if front.generation >= safe {
                break;
            }
            let retired = self.retired_refs.pop_front().unwrap();
            self.reclaim_ref(retired);
        }

        while let Some(front) = self.retired_buffers.front() {
            if front.generation >= safe {
                break;
            }
            let retired = self.retired_buffers.pop_front().unwrap();
            log::trace!(
                "freeing compacted buffer {} retired at generation {}",
                retired.id,
                retired.generation,
            );
            self.free_buffer(retired.id);
        }
    }

    fn reclaim_ref(&mut self, retired: RetiredRef) {
        let buffer_id = retired.entry.buffer_id();
        let ptr = self.inner.buffers[buffer_id as usize].load(Acquire);
        if ptr.is_null() {
            // the buffer was freed wholesale while this entry
            // was queued
            return;
        }
        let buf = unsafe { &*ptr };
        if buf.seq != retired.buffer_seq {
            // the id was reused for a fresh buffer
            return;
        }

        buf.holds.fetch_sub(1, Relaxed);
        buf.dead.fetch_add(1, Relaxed);
        if buf.kind == BufferKind::Large {
            // Safety: the entry named a handed-out large
            // slot, and its retiring generation just drained
            unsafe { buf.mark_large_dead(retired.entry.offset()) };
        }

        if buf.retiring.load(Relaxed) {
            // compaction owns this buffer now; it will be
            // freed wholesale, so its slots must not re-enter
            // circulation
            return;
        }

        if self.config.enable_free_lists {
            self.free_lists[buf.class].push(retired.entry);
        } else if buf.dead.load(Relaxed) == buf.used.load(Relaxed)
            && self.active[buf.class] != Some(buffer_id)
        {
            // without free lists, dead space is only ever
            // recovered a whole buffer at a time
            self.free_buffer(buffer_id);
        }
    }

    fn free_buffer(&mut self, buffer_id: u32) {
        let ptr = self.inner.buffers[buffer_id as usize].swap(std::ptr::null_mut(), Release);
        assert!(!ptr.is_null(), "buffer {} freed twice", buffer_id);
        let buf = unsafe { Box::from_raw(ptr) };

        self.free_lists[buf.class].retain(|slot| slot.buffer_id() != buffer_id);
        if self.active[buf.class] == Some(buffer_id) {
            self.active[buf.class] = None;
        }
        self.free_ids.push(buffer_id);

        drop(buf);
    }

    /// Relocates every live array out of the most fragmented
    /// buffers and rewrites the index entries that named
    /// them, then retires the emptied buffers into the
    /// current generation. Returns the number of arrays
    /// moved.
    ///
    /// Candidate selection follows `strategy`: buffers whose
    /// dead ratio exceeds `max_dead_ratio`, worst first, at
    /// most `max_buffers` of them. When buffer-id space
    /// consumption reaches `address_space_limit`, the ratio
    /// threshold drops to zero so that ids can be recovered
    /// from any buffer carrying dead slots.
    ///
    /// This never blocks readers. A reader racing the
    /// relocation sees either the old or the new copy of
    /// each array; the old copies stay resident until their
    /// buffer's retiring generation is reclaimed.
    pub fn compact_worst(&mut self, strategy: &CompactionStrategy) -> usize {
        let under_pressure = self.address_space_usage().usage() >= strategy.address_space_limit;
        let threshold = if under_pressure {
            0.0
        } else {
            strategy.max_dead_ratio
        };

        let mut candidates: Vec<(f64, u32)> = vec![];
        for buffer_id in 0..self.next_id {
            let ptr = self.inner.buffers[buffer_id as usize].load(Acquire);
            if ptr.is_null() {
                continue;
            }
            let buf = unsafe { &*ptr };
            if buf.retiring.load(Relaxed)
                || self.active[buf.class] == Some(buffer_id)
                || buf.used.load(Relaxed) == 0
            {
                continue;
            }
            let ratio = buf.dead_ratio();
            if ratio > threshold {
                candidates.push((ratio, buffer_id));
            }
        }

        if candidates.is_empty() {
            log::debug!("compaction found no buffers above dead ratio {}", threshold);
            return 0;
        }

        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
        candidates.truncate(strategy.max_buffers);

        let victims: Vec<u32> = candidates.iter().map(|&(_, id)| id).collect();

        for &buffer_id in &victims {
            let buf = self.inner.buffer(buffer_id);
            buf.retiring.store(true, Relaxed);
            self.free_lists[buf.class].retain(|slot| slot.buffer_id() != buffer_id);
        }

        let mut moved = 0;
        let mut scratch: Vec<T> = vec![];
        for id in 0..self.inner.indices.len() {
            let id = id as u32;
            let entry = match self.inner.indices.load(id) {
                Some(entry) if victims.contains(&entry.buffer_id()) => entry,
                _ => continue,
            };

            scratch.clear();
            scratch.extend_from_slice(self.inner.get(entry));
            let replacement = self.add(&scratch);
            crate::debug_delay();
            self.inner.indices.store(id, replacement);
            moved += 1;
        }

        let generation = self.inner.gen.current_generation();
        for &buffer_id in &victims {
            self.retired_buffers.push_back(RetiredBuffer {
                generation,
                id: buffer_id,
            });
        }

        log::debug!(
            "compacted {} buffers at generation {}, relocating {} arrays",
            victims.len(),
            generation,
            moved,
        );

        moved
    }

    /// Byte accounting across all buffers and the index
    /// table.
    pub fn memory_usage(&self) -> MemoryUsage {
        let mut usage = self.inner.indices.memory_usage();

        for buffer_id in 0..self.next_id {
            let ptr = self.inner.buffers[buffer_id as usize].load(Acquire);
            if ptr.is_null() {
                continue;
            }
            let bytes = unsafe { &*ptr }.byte_usage();
            usage.merge(MemoryUsage {
                allocated_bytes: bytes.allocated,
                used_bytes: bytes.used,
                dead_bytes: bytes.dead,
                hold_bytes: bytes.hold,
            });
        }

        usage
    }

    /// Memory usage snapshot plus a log line reporting how
    /// many buffers `strategy` would currently select, for
    /// hosts that poll this to schedule compaction.
    pub fn update_stat(&self, strategy: &CompactionStrategy) -> MemoryUsage {
        let usage = self.memory_usage();

        let mut candidates = 0;
        for buffer_id in 0..self.next_id {
            let ptr = self.inner.buffers[buffer_id as usize].load(Acquire);
            if ptr.is_null() {
                continue;
            }
            let buf = unsafe { &*ptr };
            if !buf.retiring.load(Relaxed)
                && self.active[buf.class] != Some(buffer_id)
                && buf.dead_ratio() > strategy.max_dead_ratio
            {
                candidates += 1;
            }
        }

        log::debug!(
            "{} of {} dead bytes reclaimable by compacting {} buffers",
            usage.dead_bytes,
            usage.allocated_bytes,
            candidates,
        );

        usage
    }

    /// Consumption of the reference encoding's buffer-id
    /// space. Freed ids are reusable and do not count.
    pub fn address_space_usage(&self) -> AddressSpace {
        AddressSpace {
            used: self.next_id as usize - self.free_ids.len(),
            limit: NUM_BUFFERS,
        }
    }
}
