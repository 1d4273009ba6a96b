//! Bump allocator for transient per-frame GPU data
//!
//! Allocation advances the top of the current chunk with a compare-and-swap
//! loop; only creating the next chunk takes a lock. `reset` rewinds every
//! chunk and keeps their memory, so a frame that repeats the previous
//! frame's allocation pattern gets the same (chunk, offset) pairs without
//! touching the device.

use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU64, Ordering};
use std::sync::Mutex;

use super::chunk_source::align_up;
use super::config::StackAllocatorConfig;
use crate::backend::{BufferDesc, BufferHandle, DevicePtr, MappedPtr};
use crate::error::{ForgeMemError, MemResult};
use crate::invalid_request;

const NO_CHUNK: i32 = -1;

#[derive(Debug, Default)]
struct StackChunk {
    /// Raw buffer handle, 0 when the slot has no memory yet
    buffer: AtomicU64,
    size: AtomicU64,
    top: AtomicU64,
    mapped: AtomicPtr<u8>,
}

impl StackChunk {
    fn handle(&self) -> Option<BufferHandle> {
        match self.buffer.load(Ordering::Acquire) {
            0 => None,
            raw => Some(BufferHandle(raw)),
        }
    }
}

/// Region handed out by a [`StackFrameAllocator`]
///
/// Stack allocations are never freed individually; they die with `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackAllocation {
    pub buffer: BufferHandle,
    pub chunk_index: usize,
    /// Offset inside the chunk's buffer
    pub offset: u64,
    pub size: u64,
    pub mapped: Option<MappedPtr>,
}

/// Lock-free bump allocator over growable chunks
pub struct StackFrameAllocator {
    name: String,
    device: DevicePtr,
    config: StackAllocatorConfig,
    chunks: Box<[StackChunk]>,
    current: AtomicI32,
    grow_lock: Mutex<()>,
    allocation_count: AtomicU64,
}

impl StackFrameAllocator {
    pub fn new(
        name: impl Into<String>,
        device: DevicePtr,
        config: StackAllocatorConfig,
    ) -> MemResult<Self> {
        config.validate()?;
        let chunk_slots = if config.fixed_capacity {
            1
        } else {
            config.max_chunks
        };
        let chunks = (0..chunk_slots).map(|_| StackChunk::default()).collect();
        Ok(StackFrameAllocator {
            name: name.into(),
            device,
            config,
            chunks,
            current: AtomicI32::new(NO_CHUNK),
            grow_lock: Mutex::new(()),
            allocation_count: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &StackAllocatorConfig {
        &self.config
    }

    /// Allocate `size` bytes aligned to `alignment`
    ///
    /// The effective alignment is at least `min_alignment`.
    pub fn allocate(&self, size: u64, alignment: u64) -> MemResult<StackAllocation> {
        if size == 0 {
            return Err(invalid_request!("allocation size must be non-zero"));
        }
        if !alignment.is_power_of_two() {
            return Err(invalid_request!(
                "alignment {} is not a power of two",
                alignment
            ));
        }
        let alignment = alignment.max(self.config.min_alignment);

        loop {
            let current = self.current.load(Ordering::Acquire);
            if current != NO_CHUNK {
                if let Some(allocation) = self.bump(current as usize, size, alignment) {
                    self.allocation_count.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(
                        "StackFrameAllocator[{}]: {} bytes at chunk {} offset {}",
                        self.name,
                        size,
                        allocation.chunk_index,
                        allocation.offset
                    );
                    return Ok(allocation);
                }
            }
            self.grow(current, size)?;
        }
    }

    /// Rewind every chunk, keeping their memory for the next frame
    ///
    /// Does nothing when nothing was allocated since the last reset.
    pub fn reset(&mut self) {
        let current = *self.current.get_mut();
        if current == NO_CHUNK && *self.allocation_count.get_mut() == 0 {
            return;
        }
        for chunk in self.chunks.iter_mut() {
            *chunk.top.get_mut() = 0;
        }
        *self.current.get_mut() = NO_CHUNK;
        let count = std::mem::take(self.allocation_count.get_mut());
        tracing::trace!(
            "StackFrameAllocator[{}]: reset after {} allocations",
            self.name,
            count
        );
    }

    /// Copy `data` into a host-visible allocation
    pub fn write<T: Copy>(&self, allocation: &StackAllocation, data: &[T]) -> MemResult<()> {
        let bytes = std::mem::size_of_val(data) as u64;
        if bytes > allocation.size {
            return Err(invalid_request!(
                "{} bytes do not fit a {}-byte allocation",
                bytes,
                allocation.size
            ));
        }
        let ptr = allocation
            .mapped
            .ok_or_else(|| ForgeMemError::NotMappable(format!("stack allocator '{}'", self.name)))?;
        // SAFETY: the allocation is exclusively owned by the caller for this
        // frame and `bytes` fits inside it
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr() as *const u8, ptr.as_ptr(), bytes as usize);
        }
        Ok(())
    }

    /// Chunks that hold device memory
    pub fn chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.handle().is_some()).count()
    }

    /// Device memory held across all chunks
    pub fn reserved_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.handle().is_some())
            .map(|c| c.size.load(Ordering::Acquire))
            .sum()
    }

    /// Bytes consumed this frame, alignment padding included
    pub fn used_bytes(&self) -> u64 {
        let current = self.current.load(Ordering::Acquire);
        if current == NO_CHUNK {
            return 0;
        }
        self.chunks[..=current as usize]
            .iter()
            .map(|c| c.top.load(Ordering::Acquire))
            .sum()
    }

    pub fn allocation_count(&self) -> u64 {
        self.allocation_count.load(Ordering::Relaxed)
    }

    fn bump(&self, index: usize, size: u64, alignment: u64) -> Option<StackAllocation> {
        let chunk = &self.chunks[index];
        let capacity = chunk.size.load(Ordering::Acquire);
        let mut top = chunk.top.load(Ordering::Acquire);
        loop {
            let offset = align_up(top, alignment);
            let end = offset.checked_add(size)?;
            if end > capacity {
                return None;
            }
            match chunk
                .top
                .compare_exchange_weak(top, end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let buffer = chunk.handle()?;
                    // SAFETY: offset + size is inside the chunk's mapping
                    let mapped = MappedPtr::from_raw(chunk.mapped.load(Ordering::Acquire))
                        .map(|base| unsafe { base.add(offset) });
                    return Some(StackAllocation {
                        buffer,
                        chunk_index: index,
                        offset,
                        size,
                        mapped,
                    });
                }
                Err(observed) => top = observed,
            }
        }
    }

    /// Make chunk `observed + 1` current, unless another thread already did
    fn grow(&self, observed: i32, size: u64) -> MemResult<()> {
        let _guard = self.grow_lock.lock()?;
        if self.current.load(Ordering::Acquire) != observed {
            return Ok(());
        }

        let next = (observed + 1) as usize;
        if next >= self.chunks.len() {
            return Err(self.out_of_memory(
                size,
                if self.config.fixed_capacity {
                    "fixed capacity exhausted".to_string()
                } else {
                    format!("all {} chunks in use", self.chunks.len())
                },
            ));
        }

        let previous = next
            .checked_sub(1)
            .map(|prev| self.chunks[prev].size.load(Ordering::Acquire));
        let nominal = self.config.next_chunk_size(previous);
        if self.config.fixed_capacity && size > nominal {
            return Err(self.out_of_memory(size, "request exceeds fixed capacity".to_string()));
        }
        let needed = nominal
            .max(size)
            .checked_next_multiple_of(self.config.min_alignment)
            .ok_or_else(|| self.out_of_memory(size, format!("chunk {} size overflows", next)))?;

        let chunk = &self.chunks[next];
        let reusable = chunk.handle().is_some() && chunk.size.load(Ordering::Acquire) >= needed;
        if !reusable {
            if let Some(old) = chunk.handle() {
                self.release_chunk(chunk, old);
            }
            let buffer = self
                .device
                .create_buffer(&BufferDesc::new(
                    needed,
                    self.config.usage,
                    self.config.mappable,
                ))
                .map_err(|e| {
                    if e.is_out_of_memory() {
                        self.out_of_memory(size, e.to_string())
                    } else {
                        e
                    }
                })?;
            let mapped = if self.config.mappable {
                match self.device.map_buffer(buffer, 0, needed) {
                    Ok(ptr) => ptr.as_ptr(),
                    Err(e) => {
                        self.device.destroy_buffer(buffer);
                        return Err(e);
                    }
                }
            } else {
                std::ptr::null_mut()
            };
            chunk.mapped.store(mapped, Ordering::Release);
            chunk.size.store(needed, Ordering::Release);
            chunk.buffer.store(buffer.raw(), Ordering::Release);
            tracing::debug!(
                "StackFrameAllocator[{}]: chunk {} created ({} bytes)",
                self.name,
                next,
                needed
            );
        }
        chunk.top.store(0, Ordering::Release);
        self.current.store(next as i32, Ordering::Release);
        Ok(())
    }

    fn release_chunk(&self, chunk: &StackChunk, handle: BufferHandle) {
        if !chunk.mapped.swap(std::ptr::null_mut(), Ordering::AcqRel).is_null() {
            self.device.unmap_buffer(handle);
        }
        self.device.destroy_buffer(handle);
        chunk.buffer.store(0, Ordering::Release);
        chunk.size.store(0, Ordering::Release);
    }

    fn out_of_memory(&self, size: u64, reason: String) -> ForgeMemError {
        tracing::error!(
            "StackFrameAllocator[{}]: out of memory allocating {} bytes: {}",
            self.name,
            size,
            reason
        );
        ForgeMemError::OutOfMemory {
            pool: self.name.clone(),
            requested: size,
            reason,
        }
    }
}

impl Drop for StackFrameAllocator {
    fn drop(&mut self) {
        for chunk in self.chunks.iter() {
            if let Some(handle) = chunk.handle() {
                self.release_chunk(chunk, handle);
            }
        }
    }
}
