//! Chunks, the chunk arena, and allocation tokens

use std::fmt;
use std::ops::Range;

use super::size_class::SizeClass;
use super::slot_mask::SlotMask;
use crate::backend::{BufferHandle, MappedPtr};

/// Generation-checked reference to a chunk in a class's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId {
    pub class: u32,
    pub index: u32,
    pub generation: u32,
}

/// Backing memory of one chunk: a whole buffer or a region of a shared one
#[derive(Debug)]
pub struct ChunkMemory {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
    pub mapped: Option<MappedPtr>,
}

/// One chunk of equally sized slots
#[derive(Debug)]
pub struct Chunk {
    memory: ChunkMemory,
    capacity: u32,
    slot_size: u64,
    in_use_mask: SlotMask,
    in_use_count: u32,
    pending_frees: u32,
}

impl Chunk {
    pub fn new(memory: ChunkMemory, class: &SizeClass) -> Self {
        debug_assert!(memory.size >= class.chunk_size());
        Chunk {
            memory,
            capacity: class.slots_per_chunk(),
            slot_size: class.slot_size(),
            in_use_mask: SlotMask::new(),
            in_use_count: 0,
            pending_frees: 0,
        }
    }

    pub fn memory(&self) -> &ChunkMemory {
        &self.memory
    }

    /// Give up the chunk's memory
    ///
    /// Panics if slots of this chunk are still queued for deferred free.
    pub fn into_memory(self) -> ChunkMemory {
        assert_eq!(
            self.pending_frees, 0,
            "chunk destroyed with {} frees still pending",
            self.pending_frees
        );
        self.memory
    }

    /// Give up the memory without the pending-free check (teardown only)
    pub(crate) fn into_memory_unchecked(self) -> ChunkMemory {
        self.memory
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    pub fn in_use_count(&self) -> u32 {
        self.in_use_count
    }

    pub fn pending_frees(&self) -> u32 {
        self.pending_frees
    }

    pub fn mask(&self) -> &SlotMask {
        &self.in_use_mask
    }

    pub fn is_full(&self) -> bool {
        self.in_use_count >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.in_use_count == 0
    }

    /// Claim the lowest free slot and return its byte offset in the chunk
    pub fn allocate_slot(&mut self) -> Option<u64> {
        let bit = self.in_use_mask.first_unset(self.capacity)?;
        self.in_use_mask.set(bit);
        self.in_use_count += 1;
        Some(bit as u64 * self.slot_size)
    }

    /// Release the slot at `offset`
    ///
    /// Panics if the slot is not in use.
    pub fn free_slot(&mut self, offset: u64) {
        assert!(
            offset % self.slot_size == 0,
            "offset {} is not on a slot boundary (slot size {})",
            offset,
            self.slot_size
        );
        let bit = (offset / self.slot_size) as u32;
        assert!(bit < self.capacity, "slot {} out of range", bit);
        assert!(
            self.in_use_mask.get(bit),
            "double free of slot {} (offset {})",
            bit,
            offset
        );
        self.in_use_mask.unset(bit);
        self.in_use_count -= 1;
    }

    pub fn mark_pending(&mut self) {
        self.pending_frees += 1;
    }

    pub fn clear_pending(&mut self) {
        assert!(self.pending_frees > 0, "no pending free to clear");
        self.pending_frees -= 1;
    }

    /// CPU pointer to the byte at `offset` inside the chunk
    pub fn mapped_at(&self, offset: u64) -> Option<MappedPtr> {
        // SAFETY: offset is a slot offset, inside the chunk's mapping
        self.memory.mapped.map(|base| unsafe { base.add(offset) })
    }

    /// Longest run of free slots, and total free slots
    pub fn free_runs(&self) -> (u32, u32) {
        (
            self.in_use_mask.longest_unset_run(self.capacity),
            self.capacity - self.in_use_count,
        )
    }

    /// Every maximal run of free slots, as slot index ranges
    pub fn free_slot_runs(&self) -> Vec<Range<u32>> {
        self.in_use_mask.unset_runs(self.capacity)
    }
}

/// One line per chunk: sizes, then each free run as `| first-last(bytes)`
/// with byte offsets relative to the chunk
impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let free = (self.capacity - self.in_use_count) as u64 * self.slot_size;
        write!(
            f,
            "{} at {}, total size {}, free size {}",
            self.memory.buffer,
            self.memory.offset,
            self.capacity as u64 * self.slot_size,
            free
        )?;
        let runs = self.free_slot_runs();
        if runs.is_empty() {
            return Ok(());
        }
        write!(f, " ")?;
        for run in runs {
            let start = run.start as u64 * self.slot_size;
            let len = run.len() as u64 * self.slot_size;
            write!(f, "| {}-{}({}) ", start, start + len - 1, len)?;
        }
        write!(f, "|")
    }
}

#[derive(Debug)]
struct ArenaSlot {
    generation: u32,
    chunk: Option<Chunk>,
}

/// Generational arena of chunks owned by one size class
///
/// Tokens reference chunks by index plus generation; an index is reused
/// only after its generation advanced, so stale tokens are detected.
#[derive(Debug, Default)]
pub struct ChunkList {
    slots: Vec<ArenaSlot>,
    free_indices: Vec<u32>,
    live: usize,
}

impl ChunkList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `chunk`, returning its index and generation
    pub fn insert(&mut self, chunk: Chunk) -> (u32, u32) {
        self.live += 1;
        if let Some(index) = self.free_indices.pop() {
            let slot = &mut self.slots[index as usize];
            slot.chunk = Some(chunk);
            return (index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(ArenaSlot {
            generation: 0,
            chunk: Some(chunk),
        });
        (index, 0)
    }

    pub fn get(&self, index: u32, generation: u32) -> Option<&Chunk> {
        self.slots
            .get(index as usize)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.chunk.as_ref())
    }

    pub fn get_mut(&mut self, index: u32, generation: u32) -> Option<&mut Chunk> {
        self.slots
            .get_mut(index as usize)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.chunk.as_mut())
    }

    pub fn remove(&mut self, index: u32, generation: u32) -> Option<Chunk> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        let chunk = slot.chunk.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_indices.push(index);
        self.live -= 1;
        Some(chunk)
    }

    /// Index and generation of the first chunk with a free slot
    pub fn find_available(&self) -> Option<(u32, u32)> {
        self.slots
            .iter()
            .enumerate()
            .find_map(|(i, slot)| match &slot.chunk {
                Some(chunk) if !chunk.is_full() => Some((i as u32, slot.generation)),
                _ => None,
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.slots.iter().filter_map(|slot| slot.chunk.as_ref())
    }

    /// Remove every chunk
    pub fn drain(&mut self) -> Vec<Chunk> {
        self.free_indices.clear();
        self.live = 0;
        self.slots
            .drain(..)
            .filter_map(|slot| slot.chunk)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

/// Handle to one sub-allocation
///
/// Tokens are move-only. Freeing consumes the token, which rules out using
/// a handle after it was returned to its allocator.
#[derive(Debug)]
pub struct AllocationToken {
    pub(crate) chunk: Option<ChunkId>,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) buffer: BufferHandle,
    pub(crate) buffer_offset: u64,
    pub(crate) mapped: Option<MappedPtr>,
}

impl AllocationToken {
    /// A token that refers to nothing
    pub fn empty() -> Self {
        AllocationToken {
            chunk: None,
            offset: 0,
            size: 0,
            buffer: BufferHandle(0),
            buffer_offset: 0,
            mapped: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.chunk.is_some()
    }

    pub fn chunk(&self) -> Option<ChunkId> {
        self.chunk
    }

    pub fn class_index(&self) -> Option<usize> {
        self.chunk.map(|c| c.class as usize)
    }

    /// Offset of the slot inside its chunk
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Requested size
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Offset of the slot inside the device buffer
    pub fn buffer_offset(&self) -> u64 {
        self.buffer_offset
    }

    pub fn mapped_ptr(&self) -> Option<MappedPtr> {
        self.mapped
    }
}

impl fmt::Display for AllocationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.chunk {
            Some(id) => write!(
                f,
                "token(class={} chunk={}@{} offset={} size={})",
                id.class, id.index, id.generation, self.offset, self.size
            ),
            None => write!(f, "token(empty)"),
        }
    }
}
