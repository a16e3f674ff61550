use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferKind {
    /// Inline runs of `stride` elements per slot.
    Small,
    /// One dedicated `Box<[T]>` per slot, for arrays above
    /// the largest size class.
    Large,
}

/// Byte accounting for one buffer, summed into
/// `MemoryUsage` snapshots.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct BufferBytes {
    pub allocated: usize,
    pub used: usize,
    pub dead: usize,
    pub hold: usize,
}

/// Contiguous backing storage for one size class.
///
/// The allocation is fixed at construction and never moves,
/// which is what lets readers traverse slots while the
/// writer bump-allocates into the unused tail. Slots become
/// visible to readers only through a release-ordered index
/// store performed after the slot contents are written.
pub(crate) struct Buffer<T: Copy> {
    pub kind: BufferKind,
    /// Size class index this buffer belongs to (the large
    /// class uses the index one past the small classes).
    pub class: usize,
    /// Elements per slot; 1 for large buffers.
    pub stride: usize,
    /// Total slot capacity.
    pub capacity: usize,
    /// Creation sequence number, distinguishing buffer
    /// incarnations after an id is reused.
    pub seq: u64,
    /// Bump index: slots `0..used` have been handed out.
    pub used: AtomicUsize,
    /// Slots retired but not yet proven unobservable.
    pub holds: AtomicUsize,
    /// Slots whose retiring generation has been reclaimed.
    pub dead: AtomicUsize,
    /// Bytes held by large slots' dedicated allocations.
    pub large_bytes: AtomicUsize,
    /// Portion of `large_bytes` belonging to reclaimed
    /// slots, resident until the slot is reused or the
    /// buffer drops.
    pub large_dead_bytes: AtomicUsize,
    /// Claimed by compaction or queued for wholesale free;
    /// such a buffer accepts no further allocations and its
    /// slots never re-enter a free list.
    pub retiring: AtomicBool,
    data: NonNull<u8>,
    _marker: PhantomData<T>,
}

// Safety: the raw allocation is uniquely owned by the
// buffer; cross-thread access to slot contents is governed
// by the acquire/release publication protocol on index
// entries, and counters are atomics.
unsafe impl<T: Copy + Send + Sync> Send for Buffer<T> {}
unsafe impl<T: Copy + Send + Sync> Sync for Buffer<T> {}

impl<T: Copy> Buffer<T> {
    pub fn new_small(class: usize, stride: usize, capacity: usize, seq: u64) -> Buffer<T> {
        assert!(stride > 0 && capacity > 0);
        let layout = Layout::array::<T>(stride.checked_mul(capacity).unwrap()).unwrap();
        Buffer {
            kind: BufferKind::Small,
            class,
            stride,
            capacity,
            seq,
            used: AtomicUsize::new(0),
            holds: AtomicUsize::new(0),
            dead: AtomicUsize::new(0),
            large_bytes: AtomicUsize::new(0),
            large_dead_bytes: AtomicUsize::new(0),
            retiring: AtomicBool::new(false),
            data: raw_alloc(layout),
            _marker: PhantomData,
        }
    }

    pub fn new_large(class: usize, capacity: usize, seq: u64) -> Buffer<T> {
        assert!(capacity > 0);
        let layout = Layout::array::<Box<[T]>>(capacity).unwrap();
        Buffer {
            kind: BufferKind::Large,
            class,
            stride: 1,
            capacity,
            seq,
            used: AtomicUsize::new(0),
            holds: AtomicUsize::new(0),
            dead: AtomicUsize::new(0),
            large_bytes: AtomicUsize::new(0),
            large_dead_bytes: AtomicUsize::new(0),
            retiring: AtomicBool::new(false),
            data: raw_alloc(layout),
            _marker: PhantomData,
        }
    }

    pub fn is_full(&self) -> bool {
        self.used.load(Relaxed) == self.capacity
    }

    /// Ratio of reclaimed slots to handed-out slots, the
    /// compaction score.
    pub fn dead_ratio(&self) -> f64 {
        let used = self.used.load(Relaxed);
        if used == 0 {
            return 0.0;
        }
        self.dead.load(Relaxed) as f64 / used as f64
    }

    fn small_ptr(&self, offset: u32) -> *mut T {
        debug_assert_eq!(self.kind, BufferKind::Small);
        debug_assert!((offset as usize) < self.capacity);
        unsafe { self.data.as_ptr().cast::<T>().add(offset as usize * self.stride) }
    }

    fn large_ptr(&self, offset: u32) -> *mut Box<[T]> {
        debug_assert_eq!(self.kind, BufferKind::Large);
        debug_assert!((offset as usize) < self.capacity);
        unsafe { self.data.as_ptr().cast::<Box<[T]>>().add(offset as usize) }
    }

    /// # Safety
    /// The slot at `offset` must have been fully written and
    /// published, and must not have been reclaimed while the
    /// caller's generation guard pins its retiring epoch.
    pub unsafe fn read(&self, offset: u32, size_tag: u32) -> &[T] {
        match self.kind {
            BufferKind::Small => {
                debug_assert!(size_tag as usize <= self.stride);
                unsafe { std::slice::from_raw_parts(self.small_ptr(offset), size_tag as usize) }
            }
            BufferKind::Large => {
                debug_assert_eq!(size_tag, 0);
                let slot = unsafe { &*self.large_ptr(offset) };
                &slot[..]
            }
        }
    }

    /// # Safety
    /// The slot must be unpublished: either freshly
    /// bump-allocated or reclaimed off a free list.
    pub unsafe fn write_small(&self, offset: u32, values: &[T]) {
        debug_assert!(values.len() <= self.stride);
        unsafe {
            std::ptr::copy_nonoverlapping(values.as_ptr(), self.small_ptr(offset), values.len());
        }
    }

    /// # Safety
    /// Same contract as `write_small`; `reused` must be true
    /// iff the slot previously held a published box whose
    /// retiring generation has been reclaimed.
    pub unsafe fn write_large(&self, offset: u32, values: Box<[T]>, reused: bool) {
        let slot = self.large_ptr(offset);
        if reused {
            let old_bytes = unsafe { (&*slot).len() } * std::mem::size_of::<T>();
            self.large_bytes.fetch_sub(old_bytes, Relaxed);
            self.large_dead_bytes.fetch_sub(old_bytes, Relaxed);
            unsafe { std::ptr::drop_in_place(slot) };
        }
        self.large_bytes
            .fetch_add(values.len() * std::mem::size_of::<T>(), Relaxed);
        unsafe { std::ptr::write(slot, values) };
    }

    /// # Safety
    /// The slot at `offset` must be a handed-out large slot
    /// whose retiring generation was just reclaimed; its box
    /// stays resident, only its bytes move into the dead
    /// accounting.
    pub unsafe fn mark_large_dead(&self, offset: u32) {
        debug_assert_eq!(self.kind, BufferKind::Large);
        let bytes = unsafe { (&*self.large_ptr(offset)).len() } * std::mem::size_of::<T>();
        self.large_dead_bytes.fetch_add(bytes, Relaxed);
    }

    pub fn byte_usage(&self) -> BufferBytes {
        let used = self.used.load(Relaxed);
        let dead = self.dead.load(Relaxed);
        let holds = self.holds.load(Relaxed);

        let slot_bytes = match self.kind {
            BufferKind::Small => self.stride * std::mem::size_of::<T>(),
            BufferKind::Large => std::mem::size_of::<Box<[T]>>(),
        };

        let mut bytes = BufferBytes {
            allocated: self.capacity * slot_bytes,
            used: used * slot_bytes,
            dead: dead * slot_bytes,
            hold: holds * slot_bytes,
        };

        if self.kind == BufferKind::Large {
            let boxed = self.large_bytes.load(Relaxed);
            bytes.allocated += boxed;
            bytes.used += boxed;
            bytes.dead += self.large_dead_bytes.load(Relaxed);
        }

        bytes
    }
}

impl<T: Copy> Drop for Buffer<T> {
    fn drop(&mut self) {
        unsafe {
            match self.kind {
                BufferKind::Small => {
                    let layout = Layout::array::<T>(self.stride * self.capacity).unwrap();
                    dealloc(self.data.as_ptr(), layout);
                }
                BufferKind::Large => {
                    // every handed-out slot holds a live box:
                    // reclaim never drops one in place, only
                    // free-list reuse replaces them
                    let used = *self.used.get_mut();
                    for offset in 0..used {
                        std::ptr::drop_in_place(self.large_ptr(offset as u32));
                    }
                    let layout = Layout::array::<Box<[T]>>(self.capacity).unwrap();
                    dealloc(self.data.as_ptr(), layout);
                }
            }
        }
    }
}

fn raw_alloc(layout: Layout) -> NonNull<u8> {
    assert!(layout.size() > 0);
    let ptr = unsafe { alloc(layout) };
    NonNull::new(ptr).unwrap_or_else(|| handle_alloc_error(layout))
}
