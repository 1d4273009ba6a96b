//! Size classes for the segregated free-list allocator
//!
//! Each class carves chunks of `chunk_size` bytes into equal slots of
//! `slot_size` bytes. Requests are routed to the smallest class whose slot
//! fits both the size and the alignment.

use crate::error::{ForgeMemError, MemResult};
use crate::memory::config::SizeClassConfig;

/// Upper bound on slots per chunk (width of [`SlotMask`](super::SlotMask))
pub const MAX_SLOTS_PER_CHUNK: u32 = 256;

/// One slot-size/chunk-size pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    slot_size: u64,
    chunk_size: u64,
}

impl SizeClass {
    pub fn new(slot_size: u64, chunk_size: u64) -> MemResult<Self> {
        if slot_size == 0 || chunk_size == 0 {
            return Err(ForgeMemError::InvalidConfiguration(format!(
                "size class {}/{} has a zero dimension",
                slot_size, chunk_size
            )));
        }
        if chunk_size % slot_size != 0 {
            return Err(ForgeMemError::InvalidConfiguration(format!(
                "chunk size {} is not a multiple of slot size {}",
                chunk_size, slot_size
            )));
        }
        let slots = chunk_size / slot_size;
        if slots > MAX_SLOTS_PER_CHUNK as u64 {
            return Err(ForgeMemError::InvalidConfiguration(format!(
                "chunk size {} holds {} slots of {} bytes, maximum is {}",
                chunk_size, slots, slot_size, MAX_SLOTS_PER_CHUNK
            )));
        }
        Ok(SizeClass {
            slot_size,
            chunk_size,
        })
    }

    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn slots_per_chunk(&self) -> u32 {
        (self.chunk_size / self.slot_size) as u32
    }

    /// Largest power of two dividing the slot size
    ///
    /// Every slot offset inside a chunk is a multiple of this, so a chunk
    /// placed at this alignment keeps every slot aligned to it too.
    pub fn natural_alignment(&self) -> u64 {
        1 << self.slot_size.trailing_zeros()
    }

    fn satisfies(&self, size: u64, alignment: u64) -> bool {
        self.slot_size >= size && self.slot_size >= alignment && self.slot_size % alignment == 0
    }
}

/// Ordered, immutable list of size classes
#[derive(Debug, Clone)]
pub struct SizeClassTable {
    classes: Vec<SizeClass>,
}

impl SizeClassTable {
    pub fn new(classes: Vec<SizeClass>) -> MemResult<Self> {
        if classes.is_empty() {
            return Err(ForgeMemError::InvalidConfiguration(
                "size class table is empty".to_string(),
            ));
        }
        if let Some(pair) = classes
            .windows(2)
            .find(|w| w[0].slot_size >= w[1].slot_size)
        {
            return Err(ForgeMemError::InvalidConfiguration(format!(
                "size classes must have strictly increasing slot sizes ({} then {})",
                pair[0].slot_size, pair[1].slot_size
            )));
        }
        Ok(SizeClassTable { classes })
    }

    pub fn from_config(config: &[SizeClassConfig]) -> MemResult<Self> {
        let classes = config
            .iter()
            .map(|c| SizeClass::new(c.slot_size, c.chunk_size))
            .collect::<MemResult<Vec<_>>>()?;
        Self::new(classes)
    }

    /// Index of the first class that fits `size` at `alignment`
    ///
    /// Alignment may promote a request past the class its size alone would
    /// select. `None` when no class fits.
    pub fn find_class(&self, size: u64, alignment: u64) -> Option<usize> {
        self.classes
            .iter()
            .position(|class| class.satisfies(size, alignment))
    }

    pub fn get(&self, index: usize) -> Option<&SizeClass> {
        self.classes.get(index)
    }

    pub fn largest_slot_size(&self) -> u64 {
        self.classes.last().map(|c| c.slot_size).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SizeClass> {
        self.classes.iter()
    }
}
