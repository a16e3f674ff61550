use std::fmt;

use crate::entry_ref::MAX_SIZE_TAG;
use crate::Scree;

/// Configuration for the size-classed buffer pool behind a
/// [`Scree`] store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ascending slot capacities, in elements. An array is
    /// stored in the first class that fits it; arrays larger
    /// than the last boundary get a dedicated allocation.
    pub size_classes: Vec<usize>,
    /// Slot count for the first buffer of each size class.
    pub min_entries_per_buffer: usize,
    /// Ceiling on a single buffer's backing allocation.
    /// Buffer slot counts grow geometrically up to this.
    pub max_buffer_bytes: usize,
    /// Geometric growth factor applied to the slot count of
    /// each successive buffer within a size class.
    pub alloc_grow_factor: f64,
    /// When enabled, reclaimed slots are reused by later
    /// allocations of the same size class instead of
    /// accumulating as dead space until compaction.
    pub enable_free_lists: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            size_classes: Config::default_size_classes(64),
            min_entries_per_buffer: 1024,
            max_buffer_bytes: 1 << 22, // 4mb
            alloc_grow_factor: 1.5,
            enable_free_lists: true,
        }
    }
}

impl Config {
    /// Size-class boundaries with every size covered up to 8
    /// elements, then ~25% steps up to `max_small_array_size`.
    pub fn default_size_classes(max_small_array_size: usize) -> Vec<usize> {
        let mut classes = vec![];
        let mut current = 1_usize;
        while current < max_small_array_size {
            classes.push(current);
            current = if current < 8 {
                current + 1
            } else {
                (current * 5).div_ceil(4)
            };
        }
        classes.push(max_small_array_size);
        classes
    }

    /// Pure sizing policy: a configuration whose buffer
    /// allocations align to the host's memory page
    /// granularity. Large buffers stay within one huge page,
    /// and the smallest buffer of the biggest class still
    /// fills a small page, minimizing internal fragmentation
    /// at the OS mapping level. `elem_size` is
    /// `size_of::<T>()` for the element type the store will
    /// hold.
    pub fn optimized_for_huge_pages(
        elem_size: usize,
        max_small_array_size: usize,
        huge_page_size: usize,
        small_page_size: usize,
        min_entries_per_buffer: usize,
        alloc_grow_factor: f64,
        enable_free_lists: bool,
    ) -> Config {
        assert!(elem_size > 0);
        assert!(huge_page_size >= small_page_size);

        let floor = small_page_size / (elem_size * max_small_array_size).max(1);

        Config {
            size_classes: Config::default_size_classes(max_small_array_size),
            min_entries_per_buffer: min_entries_per_buffer.max(floor).max(1),
            max_buffer_bytes: huge_page_size,
            alloc_grow_factor,
            enable_free_lists,
        }
    }

    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.size_classes.is_empty() {
            return Err(InvalidConfig("size_classes must be non-empty"));
        }
        if self.size_classes[0] == 0 {
            return Err(InvalidConfig("size classes must hold at least one element"));
        }
        if !self.size_classes.windows(2).all(|w| w[0] < w[1]) {
            return Err(InvalidConfig("size_classes must be strictly ascending"));
        }
        if *self.size_classes.last().unwrap() > MAX_SIZE_TAG as usize {
            return Err(InvalidConfig(
                "largest size class exceeds the reference encoding's size tag",
            ));
        }
        if self.min_entries_per_buffer == 0 {
            return Err(InvalidConfig("min_entries_per_buffer must be non-zero"));
        }
        if self.max_buffer_bytes == 0 {
            return Err(InvalidConfig("max_buffer_bytes must be non-zero"));
        }
        if self.alloc_grow_factor < 1.0 {
            return Err(InvalidConfig("alloc_grow_factor must be at least 1.0"));
        }
        Ok(())
    }

    /// Builds a store over elements of type `T` with this
    /// configuration.
    pub fn build<T: Copy>(&self) -> Result<Scree<T>, InvalidConfig> {
        self.validate()?;
        Ok(Scree::from_config(self.clone()))
    }
}

/// Policy for selecting buffers to reclaim during
/// [`Scree::compact_worst`].
#[derive(Debug, Clone)]
pub struct CompactionStrategy {
    /// Buffers whose reclaimed-to-allocated slot ratio
    /// exceeds this are candidates for relocation.
    pub max_dead_ratio: f64,
    /// At most this many buffers are relocated per
    /// invocation, bounding the cost of one call.
    pub max_buffers: usize,
    /// When the consumed fraction of the reference
    /// encoding's buffer-id space reaches this, any buffer
    /// with dead slots becomes a candidate so ids can be
    /// recovered before exhaustion.
    pub address_space_limit: f64,
}

impl Default for CompactionStrategy {
    fn default() -> CompactionStrategy {
        CompactionStrategy {
            max_dead_ratio: 0.2,
            max_buffers: 1,
            address_space_limit: 0.9,
        }
    }
}

/// A [`Config`] failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidConfig(pub &'static str);

impl fmt::Display for InvalidConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl std::error::Error for InvalidConfig {}
