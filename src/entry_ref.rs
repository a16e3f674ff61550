use std::num::NonZeroU64;

/// Bits of an `EntryRef` devoted to the slot offset within
/// a buffer.
pub(crate) const OFFSET_BITS: u32 = 32;
/// Bits devoted to the buffer id. This bounds the number of
/// buffers that may be live at once, and is the scarce axis
/// reported by `address_space_usage`.
pub(crate) const BUFFER_BITS: u32 = 12;
/// Bits devoted to the size tag. For arrays stored inline in
/// a size class the tag is the logical element count; `0`
/// marks a dedicated large allocation whose slot knows its
/// own length.
pub(crate) const TAG_BITS: u32 = 10;

pub(crate) const NUM_BUFFERS: usize = 1 << BUFFER_BITS;
pub(crate) const MAX_SIZE_TAG: u32 = (1 << TAG_BITS) - 1;

fn shift_ref(packed: u64) -> u64 {
    assert_eq!(packed << 1 >> 1, packed);
    // low bit is always set so the encoding is never zero,
    // leaving raw 0 free as the null sentinel in index slots
    (packed << 1) | 1
}

fn unshift_ref(raw: u64) -> u64 {
    raw >> 1
}

/// Packed handle to one stored array: buffer id, slot offset
/// and a small size tag. Copied freely, never dereferenced
/// without the buffer pool.
#[derive(Debug, Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub(crate) struct EntryRef(NonZeroU64);

impl EntryRef {
    pub fn new(buffer_id: u32, offset: u32, size_tag: u32) -> EntryRef {
        assert!((buffer_id as usize) < NUM_BUFFERS);
        assert!(size_tag <= MAX_SIZE_TAG);

        let packed = ((size_tag as u64) << (OFFSET_BITS + BUFFER_BITS))
            | ((buffer_id as u64) << OFFSET_BITS)
            | offset as u64;

        EntryRef(NonZeroU64::new(shift_ref(packed)).unwrap())
    }

    pub fn from_raw(raw: u64) -> Option<EntryRef> {
        Some(EntryRef(NonZeroU64::new(raw)?))
    }

    pub fn to_raw(self) -> u64 {
        self.0.get()
    }

    /// Raw index word for an optional reference; `None`
    /// becomes the null sentinel.
    pub fn opt_to_raw(entry: Option<EntryRef>) -> u64 {
        entry.map(EntryRef::to_raw).unwrap_or(0)
    }

    pub fn buffer_id(self) -> u32 {
        ((unshift_ref(self.0.get()) >> OFFSET_BITS) & ((1 << BUFFER_BITS) - 1)) as u32
    }

    pub fn offset(self) -> u32 {
        (unshift_ref(self.0.get()) & ((1 << OFFSET_BITS) - 1)) as u32
    }

    pub fn size_tag(self) -> u32 {
        (unshift_ref(self.0.get()) >> (OFFSET_BITS + BUFFER_BITS)) as u32
    }
}
