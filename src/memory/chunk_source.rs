//! Where chunk memory comes from
//!
//! The segregated allocator asks a [`ChunkSource`] for memory whenever a
//! class runs out of free slots. [`DedicatedChunkSource`] gives every chunk
//! its own device buffer. [`BackingBufferSource`] carves chunks out of a
//! bounded number of large buffers with a best-fit free list, which keeps
//! the device allocation count low.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::chunk::ChunkMemory;
use super::size_class::SizeClass;
use crate::backend::{BufferDesc, BufferHandle, BufferUsage, DevicePtr, MappedPtr};
use crate::error::{ForgeMemError, MemResult};

/// Minimum placement alignment of a chunk inside a backing buffer
pub const MIN_CHUNK_ALIGNMENT: u64 = 256;

/// Supplies and reclaims chunk memory
pub trait ChunkSource: Send + Sync {
    fn allocate_chunk(&self, class_index: usize, class: &SizeClass) -> MemResult<ChunkMemory>;

    fn free_chunk(&self, memory: ChunkMemory);

    /// Bytes currently handed out as chunks
    fn allocated_bytes(&self) -> u64;
}

/// One device buffer per chunk
pub struct DedicatedChunkSource {
    device: DevicePtr,
    usage: BufferUsage,
    mappable: bool,
    allocated: AtomicU64,
}

impl DedicatedChunkSource {
    pub fn new(device: DevicePtr, usage: BufferUsage, mappable: bool) -> Self {
        DedicatedChunkSource {
            device,
            usage,
            mappable,
            allocated: AtomicU64::new(0),
        }
    }
}

impl ChunkSource for DedicatedChunkSource {
    fn allocate_chunk(&self, class_index: usize, class: &SizeClass) -> MemResult<ChunkMemory> {
        let size = class.chunk_size();
        let buffer = self
            .device
            .create_buffer(&BufferDesc::new(size, self.usage, self.mappable))?;

        let mapped = if self.mappable {
            match self.device.map_buffer(buffer, 0, size) {
                Ok(ptr) => Some(ptr),
                Err(e) => {
                    self.device.destroy_buffer(buffer);
                    return Err(e);
                }
            }
        } else {
            None
        };

        self.allocated.fetch_add(size, Ordering::Relaxed);
        tracing::debug!(
            "DedicatedChunkSource: created {} for class {} ({} bytes)",
            buffer,
            class_index,
            size
        );
        Ok(ChunkMemory {
            buffer,
            offset: 0,
            size,
            mapped,
        })
    }

    fn free_chunk(&self, memory: ChunkMemory) {
        if memory.mapped.is_some() {
            self.device.unmap_buffer(memory.buffer);
        }
        self.device.destroy_buffer(memory.buffer);
        self.allocated.fetch_sub(memory.size, Ordering::Relaxed);
        tracing::debug!("DedicatedChunkSource: destroyed {}", memory.buffer);
    }

    fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// Free region inside a backing buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    offset: u64,
    size: u64,
}

impl FreeBlock {
    fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    fn is_adjacent_to(&self, other: &FreeBlock) -> bool {
        self.offset + self.size == other.offset
    }
}

#[derive(Debug)]
struct BackingBuffer {
    handle: BufferHandle,
    size: u64,
    mapped: Option<MappedPtr>,
    /// Sorted by offset, adjacent blocks merged
    free_blocks: Vec<FreeBlock>,
}

impl BackingBuffer {
    fn free_bytes(&self) -> u64 {
        self.free_blocks.iter().map(|b| b.size).sum()
    }

    fn is_unused(&self) -> bool {
        self.free_blocks.len() == 1 && self.free_blocks[0].size == self.size
    }

    /// Smallest block that fits `size` at `alignment`: (block index, usable size)
    fn find_best_fit(&self, size: u64, alignment: u64) -> Option<(usize, u64)> {
        self.free_blocks
            .iter()
            .enumerate()
            .filter_map(|(idx, block)| {
                let aligned_offset = align_up(block.offset, alignment);
                if aligned_offset >= block.offset + block.size {
                    return None;
                }
                let usable = block.size - (aligned_offset - block.offset);
                (usable >= size).then_some((idx, usable))
            })
            .min_by_key(|&(_, usable)| usable)
    }

    /// Split block `idx` around an aligned region of `size` bytes
    fn take(&mut self, idx: usize, size: u64, alignment: u64) -> u64 {
        let block = self.free_blocks.remove(idx);
        let offset = align_up(block.offset, alignment);
        let padding = offset - block.offset;
        let remaining = block.size - padding - size;

        if padding > 0 {
            self.free_blocks.push(FreeBlock::new(block.offset, padding));
        }
        if remaining > 0 {
            self.free_blocks.push(FreeBlock::new(offset + size, remaining));
        }
        self.sort_free_blocks();
        offset
    }

    fn give_back(&mut self, offset: u64, size: u64) {
        debug_assert!(
            !self
                .free_blocks
                .iter()
                .any(|b| offset < b.offset + b.size && b.offset < offset + size),
            "region {}..{} returned twice",
            offset,
            offset + size
        );
        self.free_blocks.push(FreeBlock::new(offset, size));
        self.sort_free_blocks();
    }

    fn sort_free_blocks(&mut self) {
        self.free_blocks.sort_by_key(|b| b.offset);
        self.coalesce_free_blocks();
    }

    fn coalesce_free_blocks(&mut self) {
        let mut i = 0;
        while i + 1 < self.free_blocks.len() {
            let current = self.free_blocks[i];
            let next = self.free_blocks[i + 1];
            if current.is_adjacent_to(&next) {
                self.free_blocks[i].size += next.size;
                self.free_blocks.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}

/// Align offset up to alignment (power of two)
pub(crate) fn align_up(offset: u64, alignment: u64) -> u64 {
    (offset + alignment - 1) & !(alignment - 1)
}

/// Chunks carved from a bounded set of large backing buffers
///
/// Backing buffers are created lazily, `max(buffer_size_hint, chunk_size)`
/// bytes each, up to `max_buffer_count`. Freed chunk regions are merged
/// with their neighbours so large classes can reuse space left by small ones.
pub struct BackingBufferSource {
    device: DevicePtr,
    usage: BufferUsage,
    mappable: bool,
    buffer_size_hint: u64,
    max_buffer_count: usize,
    buffers: Mutex<Vec<BackingBuffer>>,
    allocated: AtomicU64,
}

impl BackingBufferSource {
    pub fn new(
        device: DevicePtr,
        usage: BufferUsage,
        mappable: bool,
        buffer_size_hint: u64,
        max_buffer_count: usize,
    ) -> Self {
        BackingBufferSource {
            device,
            usage,
            mappable,
            buffer_size_hint,
            max_buffer_count,
            buffers: Mutex::new(Vec::new()),
            allocated: AtomicU64::new(0),
        }
    }

    pub fn backing_buffer_count(&self) -> usize {
        self.buffers.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Total bytes of all backing buffers
    pub fn reserved_bytes(&self) -> u64 {
        self.buffers
            .lock()
            .map(|b| b.iter().map(|buf| buf.size).sum())
            .unwrap_or(0)
    }

    /// 0.0 when free space is one contiguous block, approaching 1.0 as it scatters
    pub fn fragmentation(&self) -> f32 {
        let Ok(buffers) = self.buffers.lock() else {
            return 0.0;
        };
        let free: u64 = buffers.iter().map(|b| b.free_bytes()).sum();
        if free == 0 {
            return 0.0;
        }
        let largest = buffers
            .iter()
            .flat_map(|b| b.free_blocks.iter().map(|block| block.size))
            .max()
            .unwrap_or(0);
        1.0 - (largest as f32 / free as f32)
    }

    /// Destroy backing buffers that hold no chunks. Returns how many were released.
    pub fn release_unused_buffers(&self) -> MemResult<usize> {
        let mut buffers = self.buffers.lock()?;
        let before = buffers.len();
        let device = &self.device;
        buffers.retain(|buffer| {
            if !buffer.is_unused() {
                return true;
            }
            if buffer.mapped.is_some() {
                device.unmap_buffer(buffer.handle);
            }
            device.destroy_buffer(buffer.handle);
            false
        });
        let released = before - buffers.len();
        if released > 0 {
            tracing::debug!(
                "BackingBufferSource: released {} unused backing buffers",
                released
            );
        }
        Ok(released)
    }

    fn create_backing_buffer(&self, min_size: u64) -> MemResult<BackingBuffer> {
        let size = self.buffer_size_hint.max(min_size);
        let handle = self
            .device
            .create_buffer(&BufferDesc::new(size, self.usage, self.mappable))?;
        let mapped = if self.mappable {
            match self.device.map_buffer(handle, 0, size) {
                Ok(ptr) => Some(ptr),
                Err(e) => {
                    self.device.destroy_buffer(handle);
                    return Err(e);
                }
            }
        } else {
            None
        };
        tracing::debug!(
            "BackingBufferSource: created backing {} ({} bytes)",
            handle,
            size
        );
        Ok(BackingBuffer {
            handle,
            size,
            mapped,
            free_blocks: vec![FreeBlock::new(0, size)],
        })
    }
}

impl ChunkSource for BackingBufferSource {
    fn allocate_chunk(&self, class_index: usize, class: &SizeClass) -> MemResult<ChunkMemory> {
        let size = class.chunk_size();
        let alignment = class.natural_alignment().max(MIN_CHUNK_ALIGNMENT);
        let mut buffers = self.buffers.lock()?;

        let best = buffers
            .iter()
            .enumerate()
            .filter_map(|(b, buffer)| {
                buffer
                    .find_best_fit(size, alignment)
                    .map(|(block, usable)| (b, block, usable))
            })
            .min_by_key(|&(_, _, usable)| usable);

        let (buffer_idx, block_idx) = match best {
            Some((b, block, _)) => (b, block),
            None => {
                if buffers.len() >= self.max_buffer_count {
                    return Err(ForgeMemError::BufferLimitReached {
                        max_buffers: self.max_buffer_count,
                    });
                }
                buffers.push(self.create_backing_buffer(size)?);
                (buffers.len() - 1, 0)
            }
        };

        let buffer = &mut buffers[buffer_idx];
        let offset = buffer.take(block_idx, size, alignment);
        // SAFETY: offset + size lies inside the backing buffer
        let mapped = buffer.mapped.map(|base| unsafe { base.add(offset) });
        self.allocated.fetch_add(size, Ordering::Relaxed);

        tracing::debug!(
            "BackingBufferSource: chunk for class {} at {}+{} ({} bytes)",
            class_index,
            buffer.handle,
            offset,
            size
        );
        Ok(ChunkMemory {
            buffer: buffer.handle,
            offset,
            size,
            mapped,
        })
    }

    fn free_chunk(&self, memory: ChunkMemory) {
        let mut buffers = match self.buffers.lock() {
            Ok(buffers) => buffers,
            Err(e) => {
                tracing::error!("BackingBufferSource::free_chunk: lock poisoned: {}", e);
                return;
            }
        };
        match buffers.iter_mut().find(|b| b.handle == memory.buffer) {
            Some(buffer) => {
                buffer.give_back(memory.offset, memory.size);
                self.allocated.fetch_sub(memory.size, Ordering::Relaxed);
            }
            None => tracing::warn!(
                "BackingBufferSource::free_chunk: {} is not a backing buffer",
                memory.buffer
            ),
        }
    }

    fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl Drop for BackingBufferSource {
    fn drop(&mut self) {
        let buffers = match self.buffers.get_mut() {
            Ok(buffers) => buffers,
            Err(poisoned) => poisoned.into_inner(),
        };
        for buffer in buffers.drain(..) {
            if buffer.mapped.is_some() {
                self.device.unmap_buffer(buffer.handle);
            }
            self.device.destroy_buffer(buffer.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostDevice;
    use std::sync::Arc;

    fn class(slot: u64, chunk: u64) -> SizeClass {
        SizeClass::new(slot, chunk).unwrap()
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(1000, 512), 1024);
    }

    #[test]
    fn test_free_block_adjacent() {
        let a = FreeBlock::new(0, 100);
        let b = FreeBlock::new(100, 200);
        let c = FreeBlock::new(400, 100);
        assert!(a.is_adjacent_to(&b));
        assert!(!b.is_adjacent_to(&c));
    }

    #[test]
    fn test_dedicated_source_one_buffer_per_chunk() {
        let device = Arc::new(HostDevice::new());
        let source = DedicatedChunkSource::new(device.clone(), BufferUsage::default(), true);

        let a = source.allocate_chunk(0, &class(64, 4096)).unwrap();
        let b = source.allocate_chunk(0, &class(64, 4096)).unwrap();
        assert_ne!(a.buffer, b.buffer);
        assert!(a.mapped.is_some());
        assert_eq!(source.allocated_bytes(), 8192);
        assert_eq!(device.live_buffer_count(), 2);

        source.free_chunk(a);
        source.free_chunk(b);
        assert_eq!(source.allocated_bytes(), 0);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn test_backing_source_packs_chunks() {
        let device = Arc::new(HostDevice::new());
        let source = BackingBufferSource::new(device.clone(), BufferUsage::default(), false, 64 * 1024, 2);

        let a = source.allocate_chunk(0, &class(64, 16 * 1024)).unwrap();
        let b = source.allocate_chunk(0, &class(64, 16 * 1024)).unwrap();
        assert_eq!(a.buffer, b.buffer);
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 16 * 1024);
        assert_eq!(source.backing_buffer_count(), 1);
        assert_eq!(device.live_buffer_count(), 1);

        source.free_chunk(a);
        source.free_chunk(b);
        assert_eq!(source.fragmentation(), 0.0);
    }

    #[test]
    fn test_backing_source_coalesces_and_reuses() {
        let device = Arc::new(HostDevice::new());
        let source = BackingBufferSource::new(device, BufferUsage::default(), false, 64 * 1024, 1);

        let small = class(64, 16 * 1024);
        let a = source.allocate_chunk(0, &small).unwrap();
        let b = source.allocate_chunk(0, &small).unwrap();
        let c = source.allocate_chunk(0, &small).unwrap();
        let _d = source.allocate_chunk(0, &small).unwrap();

        source.free_chunk(a);
        source.free_chunk(c);
        assert!(source.fragmentation() > 0.0);

        // b sits between the two holes; freeing it merges 48 KiB
        source.free_chunk(b);
        let big = source.allocate_chunk(1, &class(1024, 48 * 1024)).unwrap();
        assert_eq!(big.offset, 0);
    }

    #[test]
    fn test_backing_source_buffer_limit() {
        let device = Arc::new(HostDevice::new());
        let source = BackingBufferSource::new(device, BufferUsage::default(), false, 16 * 1024, 1);

        let _a = source.allocate_chunk(0, &class(64, 16 * 1024)).unwrap();
        let err = source.allocate_chunk(0, &class(64, 16 * 1024)).unwrap_err();
        assert!(matches!(err, ForgeMemError::BufferLimitReached { max_buffers: 1 }));
        assert!(err.is_out_of_memory());
    }

    #[test]
    fn test_oversized_chunk_gets_own_buffer() {
        let device = Arc::new(HostDevice::new());
        let source = BackingBufferSource::new(device, BufferUsage::default(), false, 4096, 4);

        let chunk = source.allocate_chunk(0, &class(64 * 1024, 1024 * 1024)).unwrap();
        assert_eq!(chunk.size, 1024 * 1024);
        assert_eq!(source.reserved_bytes(), 1024 * 1024);
    }

    #[test]
    fn test_mapped_chunks_offset_into_backing_mapping() {
        let device = Arc::new(HostDevice::new());
        let source = BackingBufferSource::new(device, BufferUsage::default(), true, 64 * 1024, 1);

        let a = source.allocate_chunk(0, &class(64, 16 * 1024)).unwrap();
        let b = source.allocate_chunk(0, &class(64, 16 * 1024)).unwrap();
        let delta = b.mapped.unwrap().as_ptr() as usize - a.mapped.unwrap().as_ptr() as usize;
        assert_eq!(delta as u64, b.offset - a.offset);
    }

    #[test]
    fn test_release_unused_buffers() {
        let device = Arc::new(HostDevice::new());
        let source = BackingBufferSource::new(device.clone(), BufferUsage::default(), false, 16 * 1024, 2);

        let a = source.allocate_chunk(0, &class(64, 16 * 1024)).unwrap();
        let b = source.allocate_chunk(0, &class(64, 16 * 1024)).unwrap();
        source.free_chunk(a);
        assert_eq!(source.release_unused_buffers().unwrap(), 1);
        assert_eq!(device.live_buffer_count(), 1);
        source.free_chunk(b);
    }
}
