//! Segregated free-list allocator
//!
//! Requests are routed to a size class; each class owns a list of chunks
//! whose slots are tracked by a bitset. Classes are locked independently,
//! so threads allocating different sizes never contend.
//!
//! # Thread Safety
//!
//! All operations take `&self`. A class lock is held only while a chunk is
//! found or created and a bit flipped; returning chunk memory to the
//! [`ChunkSource`] happens after the class lock is released.

use std::sync::{Arc, Mutex};

use super::chunk::{AllocationToken, Chunk, ChunkId, ChunkList, ChunkMemory};
use super::chunk_source::ChunkSource;
use super::garbage::{ReclaimFailure, ReclaimResult};
use super::size_class::{SizeClass, SizeClassTable};
use super::stats::{AllocatorStats, ClassStats};
use crate::backend::MappedPtr;
use crate::error::{ForgeMemError, MemResult};
use crate::{internal_error, invalid_request};

#[derive(Debug, Default)]
struct ClassState {
    chunks: ChunkList,
    /// Emptied chunks kept for reuse
    recycled: Vec<ChunkMemory>,
    requested_bytes: u64,
}

/// Size-class allocator over chunk memory from a [`ChunkSource`]
pub struct SegregatedFreeListAllocator {
    name: String,
    table: SizeClassTable,
    classes: Box<[Mutex<ClassState>]>,
    source: Arc<dyn ChunkSource>,
    retain_empty_chunks: usize,
}

impl SegregatedFreeListAllocator {
    pub fn new(name: impl Into<String>, table: SizeClassTable, source: Arc<dyn ChunkSource>) -> Self {
        let classes = (0..table.len())
            .map(|_| Mutex::new(ClassState::default()))
            .collect();
        SegregatedFreeListAllocator {
            name: name.into(),
            table,
            classes,
            source,
            retain_empty_chunks: 0,
        }
    }

    /// Keep up to `count` emptied chunks per class instead of releasing them
    pub fn with_retained_chunks(mut self, count: usize) -> Self {
        self.retain_empty_chunks = count;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &SizeClassTable {
        &self.table
    }

    /// Allocate `size` bytes aligned to `alignment` (a power of two)
    ///
    /// # Errors
    /// - `InvalidRequest` for a zero size or a non-power-of-two alignment
    /// - `RequestTooLarge` when no size class fits
    /// - `OutOfMemory` when a new chunk cannot be obtained
    pub fn allocate(&self, size: u64, alignment: u64) -> MemResult<AllocationToken> {
        if size == 0 {
            return Err(invalid_request!("allocation size must be non-zero"));
        }
        if !alignment.is_power_of_two() {
            return Err(invalid_request!(
                "alignment {} is not a power of two",
                alignment
            ));
        }

        let class_index =
            self.table
                .find_class(size, alignment)
                .ok_or(ForgeMemError::RequestTooLarge {
                    size,
                    alignment,
                    largest: self.table.largest_slot_size(),
                })?;
        let class = self.class(class_index)?;

        let mut guard = self.classes[class_index].lock()?;
        let state = &mut *guard;

        let (index, generation) = match state.chunks.find_available() {
            Some(found) => found,
            None => {
                let memory = match state.recycled.pop() {
                    Some(memory) => memory,
                    None => self
                        .source
                        .allocate_chunk(class_index, class)
                        .map_err(|e| self.chunk_creation_failed(size, e))?,
                };
                let (index, generation) = state.chunks.insert(Chunk::new(memory, class));
                tracing::debug!(
                    "SegregatedFreeListAllocator[{}]: new chunk {}@{} in class {} ({} slots of {} bytes)",
                    self.name,
                    index,
                    generation,
                    class_index,
                    class.slots_per_chunk(),
                    class.slot_size()
                );
                (index, generation)
            }
        };

        let chunk = state
            .chunks
            .get_mut(index, generation)
            .ok_or_else(|| internal_error!("chunk {} vanished from class {}", index, class_index))?;
        let offset = chunk
            .allocate_slot()
            .ok_or_else(|| internal_error!("chunk {} reported free space but is full", index))?;
        let memory = chunk.memory();
        let token = AllocationToken {
            chunk: Some(ChunkId {
                class: class_index as u32,
                index,
                generation,
            }),
            offset,
            size,
            buffer: memory.buffer,
            buffer_offset: memory.offset + offset,
            mapped: chunk.mapped_at(offset),
        };
        state.requested_bytes += size;

        tracing::trace!(
            "SegregatedFreeListAllocator[{}]: allocated {} bytes (align {}) -> {}",
            self.name,
            size,
            alignment,
            token
        );
        Ok(token)
    }

    /// Return a slot to its chunk; an emptied chunk is recycled or released
    ///
    /// Panics on a double free, an empty token or a token from another allocator.
    pub fn free(&self, token: AllocationToken) -> MemResult<()> {
        self.release(&token, false)
    }

    /// Record that `token` was queued for deferred free
    ///
    /// Its chunk cannot be released until [`free_pending`](Self::free_pending)
    /// is called for every token marked this way.
    pub fn mark_pending(&self, token: &AllocationToken) -> MemResult<()> {
        let id = Self::id_of(token);
        let mut state = self.class_state(id)?;
        state
            .chunks
            .get_mut(id.index, id.generation)
            .unwrap_or_else(|| panic!("stale allocation token {}", token))
            .mark_pending();
        Ok(())
    }

    /// Free a token previously passed to [`mark_pending`](Self::mark_pending)
    pub fn free_pending(&self, token: AllocationToken) -> MemResult<()> {
        self.release(&token, true)
    }

    /// [`free_pending`](Self::free_pending) for the garbage collector: a
    /// failed free hands the token back so it can be retried
    pub fn try_free_pending(&self, token: AllocationToken) -> ReclaimResult<AllocationToken> {
        self.release(&token, true)
            .map_err(|error| ReclaimFailure::new(token, error))
    }

    /// CPU pointer to the token's slot, if its chunk is host-visible
    pub fn mapped_ptr(&self, token: &AllocationToken) -> Option<MappedPtr> {
        token.mapped_ptr()
    }

    /// Aggregate statistics, locking each class in turn
    pub fn stats(&self) -> MemResult<AllocatorStats> {
        let mut stats = AllocatorStats::default();
        for (class_index, class) in self.table.iter().enumerate() {
            let state = self.classes[class_index].lock()?;
            stats.requested_bytes += state.requested_bytes;
            stats.retained_chunks += state.recycled.len();
            stats.allocated_bytes += state.recycled.len() as u64 * class.chunk_size();
            for chunk in state.chunks.iter() {
                stats.allocated_bytes += class.chunk_size();
                stats.in_use_bytes += chunk.in_use_count() as u64 * class.slot_size();
                stats.live_allocations += chunk.in_use_count() as u64;
                stats.pending_frees += chunk.pending_frees() as u64;
                stats.chunk_count += 1;
                stats.external_fragmentation =
                    stats.external_fragmentation.max(chunk_fragmentation(chunk));
                stats.quadratic_fragmentation = stats
                    .quadratic_fragmentation
                    .max(chunk_quadratic_fragmentation(chunk));
            }
        }
        Ok(stats)
    }

    pub fn class_stats(&self) -> MemResult<Vec<ClassStats>> {
        self.table
            .iter()
            .enumerate()
            .map(|(class_index, class)| -> MemResult<ClassStats> {
                let state = self.classes[class_index].lock()?;
                let mut stats = ClassStats {
                    class_index,
                    slot_size: class.slot_size(),
                    chunk_size: class.chunk_size(),
                    chunk_count: state.chunks.len(),
                    retained_chunks: state.recycled.len(),
                    ..Default::default()
                };
                for chunk in state.chunks.iter() {
                    stats.in_use_slots += chunk.in_use_count() as u64;
                    stats.total_slots += chunk.capacity() as u64;
                    stats.pending_frees += chunk.pending_frees() as u64;
                }
                Ok(stats)
            })
            .collect()
    }

    /// Worst chunk's `1 - longest_free_run / free_slots`
    pub fn external_fragmentation(&self) -> MemResult<f32> {
        let mut worst = 0.0f32;
        for class in self.classes.iter() {
            let state = class.lock()?;
            for chunk in state.chunks.iter() {
                worst = worst.max(chunk_fragmentation(chunk));
            }
        }
        Ok(worst)
    }

    /// Worst chunk's `1 - sum(run^2) / free_slots^2`
    ///
    /// Unlike [`external_fragmentation`](Self::external_fragmentation) this
    /// accounts for every free run, not only the longest one.
    pub fn external_fragmentation_quadratic(&self) -> MemResult<f32> {
        let mut worst = 0.0f32;
        for class in self.classes.iter() {
            let state = class.lock()?;
            for chunk in state.chunks.iter() {
                worst = worst.max(chunk_quadratic_fragmentation(chunk));
            }
        }
        Ok(worst)
    }

    /// Human-readable dump of every chunk's free runs, grouped by class
    pub fn free_runs_report(&self) -> MemResult<String> {
        let mut report = String::new();
        for (class_index, class) in self.table.iter().enumerate() {
            let state = self.classes[class_index].lock()?;
            if state.chunks.is_empty() {
                continue;
            }
            report.push_str(&format!(
                "Class #{} (slot {} bytes)\n",
                class_index,
                class.slot_size()
            ));
            for (chunk_number, chunk) in state.chunks.iter().enumerate() {
                report.push_str(&format!("  Chunk #{}: {}\n", chunk_number, chunk));
            }
        }
        Ok(report)
    }

    /// Check internal consistency of every class
    pub fn validate(&self) -> MemResult<()> {
        for (class_index, class) in self.table.iter().enumerate() {
            let state = self.classes[class_index].lock()?;
            let mut in_use_bytes = 0;
            for chunk in state.chunks.iter() {
                if chunk.mask().count_ones() != chunk.in_use_count() {
                    return Err(internal_error!(
                        "class {}: chunk mask holds {} bits but count is {}",
                        class_index,
                        chunk.mask().count_ones(),
                        chunk.in_use_count()
                    ));
                }
                if chunk.mask().any_set_at_or_above(chunk.capacity()) {
                    return Err(internal_error!(
                        "class {}: chunk has bits set beyond capacity {}",
                        class_index,
                        chunk.capacity()
                    ));
                }
                if chunk.pending_frees() > chunk.in_use_count() {
                    return Err(internal_error!(
                        "class {}: {} pending frees but only {} slots in use",
                        class_index,
                        chunk.pending_frees(),
                        chunk.in_use_count()
                    ));
                }
                if chunk.is_empty() {
                    return Err(internal_error!(
                        "class {}: empty chunk was not released",
                        class_index
                    ));
                }
                in_use_bytes += chunk.in_use_count() as u64 * class.slot_size();
            }
            if state.requested_bytes > in_use_bytes {
                return Err(internal_error!(
                    "class {}: {} requested bytes exceed {} in-use slot bytes",
                    class_index,
                    state.requested_bytes,
                    in_use_bytes
                ));
            }
        }
        Ok(())
    }

    /// Release retained empty chunks back to the chunk source
    pub fn release_retained_chunks(&self) -> MemResult<usize> {
        let mut released = Vec::new();
        for class in self.classes.iter() {
            released.append(&mut class.lock()?.recycled);
        }
        let count = released.len();
        for memory in released {
            self.source.free_chunk(memory);
        }
        Ok(count)
    }

    fn release(&self, token: &AllocationToken, pending: bool) -> MemResult<()> {
        let id = Self::id_of(token);
        let released = {
            let mut guard = self.class_state(id)?;
            let state = &mut *guard;
            let chunk = state
                .chunks
                .get_mut(id.index, id.generation)
                .unwrap_or_else(|| panic!("stale allocation token {}", token));
            if pending {
                chunk.clear_pending();
            }
            chunk.free_slot(token.offset);
            state.requested_bytes -= token.size;

            if chunk.is_empty() {
                let chunk = state
                    .chunks
                    .remove(id.index, id.generation)
                    .unwrap_or_else(|| panic!("chunk {} vanished during free", id.index));
                let memory = chunk.into_memory();
                if state.recycled.len() < self.retain_empty_chunks {
                    tracing::debug!(
                        "SegregatedFreeListAllocator[{}]: retaining empty chunk of class {}",
                        self.name,
                        id.class
                    );
                    state.recycled.push(memory);
                    None
                } else {
                    Some(memory)
                }
            } else {
                None
            }
        };

        if let Some(memory) = released {
            tracing::debug!(
                "SegregatedFreeListAllocator[{}]: releasing chunk {}@{} of class {}",
                self.name,
                id.index,
                id.generation,
                id.class
            );
            self.source.free_chunk(memory);
        }
        tracing::trace!(
            "SegregatedFreeListAllocator[{}]: freed {} (pending={})",
            self.name,
            token,
            pending
        );
        Ok(())
    }

    fn id_of(token: &AllocationToken) -> ChunkId {
        match token.chunk {
            Some(id) => id,
            None => panic!("free of an empty allocation token"),
        }
    }

    fn class_state(&self, id: ChunkId) -> MemResult<std::sync::MutexGuard<'_, ClassState>> {
        let class = self
            .classes
            .get(id.class as usize)
            .unwrap_or_else(|| panic!("token class {} out of range", id.class));
        Ok(class.lock()?)
    }

    fn class(&self, index: usize) -> MemResult<&SizeClass> {
        self.table
            .get(index)
            .ok_or_else(|| internal_error!("size class {} out of range", index))
    }

    fn chunk_creation_failed(&self, size: u64, err: ForgeMemError) -> ForgeMemError {
        if err.is_out_of_memory() {
            ForgeMemError::OutOfMemory {
                pool: self.name.clone(),
                requested: size,
                reason: err.to_string(),
            }
        } else {
            err
        }
    }
}

fn chunk_fragmentation(chunk: &Chunk) -> f32 {
    let (longest, free) = chunk.free_runs();
    if free == 0 {
        return 0.0;
    }
    1.0 - longest as f32 / free as f32
}

fn chunk_quadratic_fragmentation(chunk: &Chunk) -> f32 {
    let (_, free) = chunk.free_runs();
    if free == 0 {
        return 0.0;
    }
    let quality = chunk
        .free_slot_runs()
        .iter()
        .map(|run| {
            let len = run.len() as f64;
            len * len
        })
        .sum::<f64>()
        .sqrt()
        / free as f64;
    (1.0 - quality * quality) as f32
}

impl Drop for SegregatedFreeListAllocator {
    fn drop(&mut self) {
        for (class_index, class) in self.classes.iter_mut().enumerate() {
            let state = match class.get_mut() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            for chunk in state.chunks.drain() {
                if !chunk.is_empty() {
                    tracing::warn!(
                        "SegregatedFreeListAllocator[{}]: {} allocations of class {} were never freed",
                        self.name,
                        chunk.in_use_count(),
                        class_index
                    );
                }
                self.source.free_chunk(chunk.into_memory_unchecked());
            }
            for memory in state.recycled.drain(..) {
                self.source.free_chunk(memory);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferUsage, HostDevice};
    use crate::memory::chunk_source::DedicatedChunkSource;

    fn allocator(device: &Arc<HostDevice>) -> SegregatedFreeListAllocator {
        let table = SizeClassTable::new(vec![
            SizeClass::new(64, 1024).unwrap(),
            SizeClass::new(256, 4096).unwrap(),
            SizeClass::new(1024, 16 * 1024).unwrap(),
        ])
        .unwrap();
        let source = Arc::new(DedicatedChunkSource::new(
            device.clone(),
            BufferUsage::default(),
            true,
        ));
        SegregatedFreeListAllocator::new("test", table, source)
    }

    #[test]
    fn test_allocate_and_free() {
        let device = Arc::new(HostDevice::new());
        let alloc = allocator(&device);

        let token = alloc.allocate(40, 4).unwrap();
        assert!(token.is_valid());
        assert_eq!(token.class_index(), Some(0));
        assert_eq!(token.offset(), 0);

        let stats = alloc.stats().unwrap();
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.in_use_bytes, 64);
        assert_eq!(stats.requested_bytes, 40);
        assert_eq!(stats.allocated_bytes, 1024);

        alloc.free(token).unwrap();
        let stats = alloc.stats().unwrap();
        assert_eq!(stats.chunk_count, 0);
        assert_eq!(stats.in_use_bytes, 0);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn test_invalid_requests() {
        let device = Arc::new(HostDevice::new());
        let alloc = allocator(&device);
        assert!(matches!(
            alloc.allocate(0, 4),
            Err(ForgeMemError::InvalidRequest(_))
        ));
        assert!(matches!(
            alloc.allocate(16, 0),
            Err(ForgeMemError::InvalidRequest(_))
        ));
        assert!(matches!(
            alloc.allocate(16, 3),
            Err(ForgeMemError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_request_too_large() {
        let device = Arc::new(HostDevice::new());
        let alloc = allocator(&device);
        let err = alloc.allocate(2048, 1).unwrap_err();
        assert!(matches!(
            err,
            ForgeMemError::RequestTooLarge {
                size: 2048,
                largest: 1024,
                ..
            }
        ));
    }

    #[test]
    fn test_second_chunk_when_full() {
        let device = Arc::new(HostDevice::new());
        let alloc = allocator(&device);
        let tokens: Vec<_> = (0..17).map(|_| alloc.allocate(64, 1).unwrap()).collect();
        assert_eq!(alloc.stats().unwrap().chunk_count, 2);
        assert_ne!(tokens[0].buffer(), tokens[16].buffer());
        for token in tokens {
            alloc.free(token).unwrap();
        }
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn test_retained_chunks_are_reused() {
        let device = Arc::new(HostDevice::new());
        let alloc = allocator(&device).with_retained_chunks(1);

        let token = alloc.allocate(8, 1).unwrap();
        let buffer = token.buffer();
        alloc.free(token).unwrap();

        let stats = alloc.stats().unwrap();
        assert_eq!(stats.chunk_count, 0);
        assert_eq!(stats.retained_chunks, 1);
        assert_eq!(device.live_buffer_count(), 1);

        let token = alloc.allocate(8, 1).unwrap();
        assert_eq!(token.buffer(), buffer);
        assert_eq!(device.buffers_created(), 1);
        alloc.free(token).unwrap();

        assert_eq!(alloc.release_retained_chunks().unwrap(), 1);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn test_pending_keeps_chunk_alive() {
        let device = Arc::new(HostDevice::new());
        let alloc = allocator(&device);

        let token = alloc.allocate(8, 1).unwrap();
        alloc.mark_pending(&token).unwrap();
        assert_eq!(alloc.stats().unwrap().pending_frees, 1);
        assert_eq!(alloc.stats().unwrap().chunk_count, 1);

        alloc.free_pending(token).unwrap();
        assert_eq!(alloc.stats().unwrap().chunk_count, 0);
    }

    #[test]
    #[should_panic(expected = "empty allocation token")]
    fn test_free_empty_token_panics() {
        let device = Arc::new(HostDevice::new());
        let alloc = allocator(&device);
        let _ = alloc.free(AllocationToken::empty());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let device = Arc::new(HostDevice::new());
        let alloc = allocator(&device);
        let keep = alloc.allocate(8, 1).unwrap();
        let token = alloc.allocate(8, 1).unwrap();
        let forged = AllocationToken {
            chunk: token.chunk,
            offset: token.offset,
            size: token.size,
            buffer: token.buffer,
            buffer_offset: token.buffer_offset,
            mapped: token.mapped,
        };
        alloc.free(token).unwrap();
        let _ = alloc.free(forged);
        drop(keep);
    }

    #[test]
    fn test_external_fragmentation() {
        let device = Arc::new(HostDevice::new());
        let alloc = allocator(&device);
        let tokens: Vec<_> = (0..16).map(|_| alloc.allocate(64, 1).unwrap()).collect();
        assert_eq!(alloc.external_fragmentation().unwrap(), 0.0);

        // free every other slot: 8 free slots, longest run 1
        let mut kept = Vec::new();
        for (i, token) in tokens.into_iter().enumerate() {
            if i % 2 == 0 {
                alloc.free(token).unwrap();
            } else {
                kept.push(token);
            }
        }
        let frag = alloc.external_fragmentation().unwrap();
        assert!((frag - 0.875).abs() < 1e-6);
        // 8 runs of 1: 1 - 8 / 64
        let quadratic = alloc.external_fragmentation_quadratic().unwrap();
        assert!((quadratic - 0.875).abs() < 1e-6);
        alloc.validate().unwrap();

        for token in kept {
            alloc.free(token).unwrap();
        }
    }

    #[test]
    fn test_quadratic_fragmentation_weighs_every_run() {
        let device = Arc::new(HostDevice::new());
        let alloc = allocator(&device);
        assert_eq!(alloc.external_fragmentation_quadratic().unwrap(), 0.0);

        let tokens: Vec<_> = (0..16).map(|_| alloc.allocate(64, 1).unwrap()).collect();
        // free slots 0..4, 6..8 and 10..12: runs of 4, 2 and 2
        let mut kept = Vec::new();
        for (i, token) in tokens.into_iter().enumerate() {
            if i < 4 || (6..8).contains(&i) || (10..12).contains(&i) {
                alloc.free(token).unwrap();
            } else {
                kept.push(token);
            }
        }

        // longest run: 1 - 4/8; quadratic: 1 - (16 + 4 + 4) / 64
        assert!((alloc.external_fragmentation().unwrap() - 0.5).abs() < 1e-6);
        assert!((alloc.external_fragmentation_quadratic().unwrap() - 0.625).abs() < 1e-6);
        let stats = alloc.stats().unwrap();
        assert!((stats.quadratic_fragmentation - 0.625).abs() < 1e-6);

        for token in kept {
            alloc.free(token).unwrap();
        }
    }

    #[test]
    fn test_free_runs_report() {
        let device = Arc::new(HostDevice::new());
        let alloc = allocator(&device);
        assert_eq!(alloc.free_runs_report().unwrap(), "");

        let tokens: Vec<_> = (0..3).map(|_| alloc.allocate(64, 1).unwrap()).collect();
        let big = alloc.allocate(200, 1).unwrap();
        let mut tokens = tokens.into_iter();
        let first = tokens.next().unwrap();
        alloc.free(first).unwrap();

        let report = alloc.free_runs_report().unwrap();
        let lines: Vec<_> = report.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "Class #0 (slot 64 bytes)");
        assert!(lines[1].starts_with("  Chunk #0: "));
        assert!(lines[1].ends_with("free size 832 | 0-63(64) | 192-1023(832) |"));
        assert_eq!(lines[2], "Class #1 (slot 256 bytes)");
        assert!(lines[3].ends_with("| 256-4095(3840) |"));

        for token in tokens {
            alloc.free(token).unwrap();
        }
        alloc.free(big).unwrap();
    }

    #[test]
    fn test_class_stats() {
        let device = Arc::new(HostDevice::new());
        let alloc = allocator(&device);
        let a = alloc.allocate(100, 1).unwrap();
        let stats = alloc.class_stats().unwrap();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats[1].in_use_slots, 1);
        assert_eq!(stats[1].total_slots, 16);
        assert_eq!(stats[0].chunk_count, 0);
        alloc.free(a).unwrap();
    }

    #[test]
    fn test_mapped_ptr_points_into_slot() {
        let device = Arc::new(HostDevice::new());
        let alloc = allocator(&device);
        let a = alloc.allocate(8, 1).unwrap();
        let b = alloc.allocate(8, 1).unwrap();
        let pa = alloc.mapped_ptr(&a).unwrap().as_ptr() as usize;
        let pb = alloc.mapped_ptr(&b).unwrap().as_ptr() as usize;
        assert_eq!(pb - pa, 64);
        alloc.free(a).unwrap();
        alloc.free(b).unwrap();
    }

    #[test]
    fn test_out_of_memory_from_device() {
        let device = Arc::new(HostDevice::new());
        let alloc = allocator(&device);
        device.fail_next_allocations(1);
        let err = alloc.allocate(8, 1).unwrap_err();
        match err {
            ForgeMemError::OutOfMemory { pool, requested, .. } => {
                assert_eq!(pool, "test");
                assert_eq!(requested, 8);
            }
            other => panic!("expected OutOfMemory, got {other:?}"),
        }
        // the allocator is still usable afterwards
        let token = alloc.allocate(8, 1).unwrap();
        alloc.free(token).unwrap();
    }
}
