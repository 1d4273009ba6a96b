//! GPU buffer pool
//!
//! Composition root of the sub-allocation core: one
//! [`SegregatedFreeListAllocator`] over a bounded set of backing buffers, plus
//! the frame garbage collector that holds deferred frees until the GPU is done
//! with them.
//!
//! # Frame protocol
//!
//! ```text
//! allocate -> write / record GPU commands -> deferred_free -> end_frame(fence)
//!                                                               |
//!                        slot reused once the fence signaled <--+
//! ```

use std::mem;
use std::sync::Arc;

use super::chunk::AllocationToken;
use super::chunk_source::{BackingBufferSource, ChunkSource};
use super::config::PoolConfig;
use super::garbage::{CollectReport, FrameGarbageCollector};
use super::segregated::SegregatedFreeListAllocator;
use super::size_class::SizeClassTable;
use super::stats::{ClassStats, PoolStats};
use crate::backend::{BufferHandle, DevicePtr, FencePtr, MappedPtr};
use crate::error::{ForgeMemError, MemResult};
use crate::invalid_request;
use crate::metrics::PoolMetrics;

/// A sub-allocation handed out by [`GpuBufferPool`]
///
/// Move-only. Give it back with [`GpuBufferPool::deferred_free`] or
/// [`GpuBufferPool::free_immediate`].
#[derive(Debug)]
pub struct Allocation {
    token: AllocationToken,
    /// Padding inside the slot for non-power-of-two alignments
    fixed_offset: u64,
    size: u64,
}

impl Allocation {
    pub fn buffer(&self) -> BufferHandle {
        self.token.buffer()
    }

    /// Byte offset of the aligned view inside [`buffer`](Self::buffer)
    pub fn offset(&self) -> u64 {
        self.token.buffer_offset() + self.fixed_offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn fixed_offset(&self) -> u64 {
        self.fixed_offset
    }

    pub fn token(&self) -> &AllocationToken {
        &self.token
    }

    /// CPU pointer to the aligned view when the pool is host-visible
    pub fn mapped_ptr(&self) -> Option<MappedPtr> {
        // SAFETY: the slot holds at least fixed_offset + size bytes
        self.token
            .mapped_ptr()
            .map(|ptr| unsafe { ptr.add(self.fixed_offset) })
    }
}

/// Sub-allocating pool over a bounded number of device buffers
///
/// # Thread Safety
///
/// `allocate`, `deferred_free` and `free_immediate` may be called from any
/// thread. `end_frame` and `stats` belong to the thread that drives frames.
pub struct GpuBufferPool {
    name: String,
    device: DevicePtr,
    config: PoolConfig,
    source: Arc<BackingBufferSource>,
    allocator: SegregatedFreeListAllocator,
    garbage: FrameGarbageCollector<AllocationToken>,
    metrics: Option<PoolMetrics>,
}

impl GpuBufferPool {
    /// Configure a pool; device memory is only reserved by the first allocation
    pub fn new(name: impl Into<String>, device: DevicePtr, config: PoolConfig) -> MemResult<Self> {
        config.validate()?;
        let name = name.into();
        let table = SizeClassTable::from_config(&config.size_classes)?;

        let source = Arc::new(BackingBufferSource::new(
            device.clone(),
            config.usage,
            config.mappable,
            config.buffer_size_hint,
            config.max_buffer_count,
        ));
        let chunk_source: Arc<dyn ChunkSource> = source.clone();
        let allocator = SegregatedFreeListAllocator::new(name.clone(), table, chunk_source)
            .with_retained_chunks(config.retain_empty_chunks);
        let garbage = FrameGarbageCollector::new(config.garbage.clone());
        let metrics = config.telemetry.then(|| PoolMetrics::new(&name));

        tracing::info!(
            "GpuBufferPool '{}': {} size classes ({}..{} bytes), {} buffers of {} MB max, usage={:?}, mappable={}",
            name,
            allocator.table().len(),
            config.size_classes.first().map(|c| c.slot_size).unwrap_or(0),
            allocator.table().largest_slot_size(),
            config.max_buffer_count,
            config.buffer_size_hint / (1024 * 1024),
            config.usage,
            config.mappable
        );

        Ok(GpuBufferPool {
            name,
            device,
            config,
            source,
            allocator,
            garbage,
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn device(&self) -> &DevicePtr {
        &self.device
    }

    /// Allocate `size` bytes aligned to `alignment`
    ///
    /// A non-power-of-two alignment over-allocates by `alignment` bytes and
    /// shifts the view inside the slot.
    ///
    /// # Errors
    /// - `InvalidRequest` for a zero size or alignment
    /// - `RequestTooLarge` when the padded request exceeds every size class
    /// - `OutOfMemory` / `BufferLimitReached` when no backing memory is left
    pub fn allocate(&self, size: u64, alignment: u64) -> MemResult<Allocation> {
        if size == 0 {
            return Err(invalid_request!("allocation size must be non-zero"));
        }
        if alignment == 0 {
            return Err(invalid_request!("alignment must be non-zero"));
        }

        let result = if alignment.is_power_of_two() {
            self.allocator
                .allocate(size, alignment)
                .map(|token| Allocation {
                    token,
                    fixed_offset: 0,
                    size,
                })
        } else {
            self.allocate_padded(size, alignment)
        };

        match result {
            Ok(allocation) => {
                if let Some(metrics) = &self.metrics {
                    metrics.allocations.inc();
                }
                Ok(allocation)
            }
            Err(e) => {
                if e.is_out_of_memory() {
                    tracing::error!(
                        "GpuBufferPool '{}': failed to allocate {} bytes (align {}): {}",
                        self.name,
                        size,
                        alignment,
                        e
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.out_of_memory.inc();
                    }
                }
                Err(e)
            }
        }
    }

    fn allocate_padded(&self, size: u64, alignment: u64) -> MemResult<Allocation> {
        let padded = size.checked_add(alignment).ok_or_else(|| {
            invalid_request!("size {} plus alignment {} overflows", size, alignment)
        })?;
        let token = self.allocator.allocate(padded, 1)?;
        let base = token.buffer_offset();
        let fixed_offset = base.div_ceil(alignment) * alignment - base;
        tracing::trace!(
            "GpuBufferPool '{}': {} bytes at non-power-of-two alignment {} -> fixed offset {}",
            self.name,
            size,
            alignment,
            fixed_offset
        );
        Ok(Allocation {
            token,
            fixed_offset,
            size,
        })
    }

    /// Room for `count` values of `T`
    pub fn allocate_typed<T>(&self, count: usize) -> MemResult<Allocation> {
        let size = (mem::size_of::<T>() as u64)
            .checked_mul(count as u64)
            .ok_or_else(|| invalid_request!("{} elements overflow the size range", count))?;
        self.allocate(size, mem::align_of::<T>() as u64)
    }

    /// Room for `count` elements of a structured buffer of `T`
    ///
    /// The view is aligned to both the element stride and the device's
    /// structured-buffer alignment.
    pub fn allocate_structured<T>(&self, count: usize) -> MemResult<Allocation> {
        let stride = mem::size_of::<T>().max(1) as u64;
        let size = stride
            .checked_mul(count as u64)
            .ok_or_else(|| invalid_request!("{} elements overflow the size range", count))?;
        let alignment = lcm(stride, self.device.limits().structured_buffer_alignment.max(1));
        self.allocate(size, alignment)
    }

    /// Queue `allocation` for release once the current frame's fence signals
    pub fn deferred_free(&self, allocation: Allocation) -> MemResult<()> {
        self.allocator.mark_pending(&allocation.token)?;
        self.garbage.deferred_free(allocation.token)?;
        if let Some(metrics) = &self.metrics {
            metrics.deferred_frees.inc();
        }
        Ok(())
    }

    /// Release `allocation` now; the GPU must not be using it
    pub fn free_immediate(&self, allocation: Allocation) -> MemResult<()> {
        self.allocator.free(allocation.token)
    }

    /// Close the frame with `fence` and reclaim frames whose fence signaled
    ///
    /// # Errors
    /// `FenceTimeout` when too many frames are in flight and the oldest one
    /// does not finish in time.
    pub fn end_frame(&self, fence: FencePtr) -> MemResult<CollectReport> {
        let allocator = &self.allocator;
        let report = self
            .garbage
            .end_frame(fence, |token| allocator.try_free_pending(token))?;

        if let Some(metrics) = &self.metrics {
            metrics.frames.inc();
            metrics.reclaimed.inc_by(report.items_reclaimed as u64);
            if let Some(stalled) = report.stalled {
                metrics.fence_stall_seconds.observe(stalled.as_secs_f64());
            }
            let stats = self.stats()?;
            metrics.record_stats(&stats);
            tracing::debug!("GpuBufferPool '{}': {}", self.name, stats);
        }
        Ok(report)
    }

    /// Reclaim frames whose fence signaled without closing the current one
    pub fn collect(&self) -> MemResult<CollectReport> {
        let allocator = &self.allocator;
        let report = self.garbage.collect(|token| allocator.try_free_pending(token))?;
        if let Some(metrics) = &self.metrics {
            metrics.reclaimed.inc_by(report.items_reclaimed as u64);
        }
        Ok(report)
    }

    /// Wait for every outstanding frame and reclaim all deferred frees
    ///
    /// Frees queued in the current frame are reclaimed too, so the device
    /// must be idle.
    pub fn flush(&self) -> MemResult<CollectReport> {
        let allocator = &self.allocator;
        let report = self.garbage.flush(self.config.garbage.fence_timeout(), |token| {
            allocator.try_free_pending(token)
        })?;
        if let Some(metrics) = &self.metrics {
            metrics.reclaimed.inc_by(report.items_reclaimed as u64);
        }
        Ok(report)
    }

    /// Copy `data` into a host-visible allocation
    pub fn write<T: Copy>(&self, allocation: &Allocation, data: &[T]) -> MemResult<()> {
        let bytes = mem::size_of_val(data) as u64;
        if bytes > allocation.size {
            return Err(invalid_request!(
                "{} bytes do not fit a {}-byte allocation",
                bytes,
                allocation.size
            ));
        }
        let ptr = allocation
            .mapped_ptr()
            .ok_or_else(|| ForgeMemError::NotMappable(format!("pool '{}'", self.name)))?;
        // SAFETY: the caller owns the allocation and `bytes` fits inside it
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr() as *const u8, ptr.as_ptr(), bytes as usize);
        }
        Ok(())
    }

    /// Backing buffer and byte offset to bind for `allocation`
    pub fn buffer_of(&self, allocation: &Allocation) -> (BufferHandle, u64) {
        (allocation.buffer(), allocation.offset())
    }

    pub fn stats(&self) -> MemResult<PoolStats> {
        Ok(PoolStats {
            allocator: self.allocator.stats()?,
            backing_buffers: self.source.backing_buffer_count(),
            reserved_bytes: self.source.reserved_bytes(),
            backing_fragmentation: self.source.fragmentation(),
            pending_garbage_items: self.garbage.pending_item_count(),
            pending_garbage_buckets: self.garbage.pending_bucket_count(),
            frame: self.garbage.current_frame(),
        })
    }

    pub fn class_stats(&self) -> MemResult<Vec<ClassStats>> {
        self.allocator.class_stats()
    }

    /// Free slot runs of every chunk, for debugging fragmentation
    pub fn free_runs_report(&self) -> MemResult<String> {
        self.allocator.free_runs_report()
    }

    /// Check allocator bookkeeping
    pub fn validate(&self) -> MemResult<()> {
        self.allocator.validate()
    }

    /// Return retained chunks and unused backing buffers to the device
    pub fn trim(&self) -> MemResult<usize> {
        let chunks = self.allocator.release_retained_chunks()?;
        let buffers = self.source.release_unused_buffers()?;
        tracing::debug!(
            "GpuBufferPool '{}': trimmed {} retained chunks, {} backing buffers",
            self.name,
            chunks,
            buffers
        );
        Ok(buffers)
    }

    /// Telemetry, when enabled in the config
    pub fn metrics(&self) -> Option<&PoolMetrics> {
        self.metrics.as_ref()
    }
}

impl Drop for GpuBufferPool {
    fn drop(&mut self) {
        let allocator = &self.allocator;
        if let Err(e) = self
            .garbage
            .flush(self.config.garbage.fence_timeout(), |token| {
                allocator.try_free_pending(token)
            })
        {
            tracing::warn!(
                "GpuBufferPool '{}': could not flush deferred frees on drop: {}",
                self.name,
                e
            );
        }
        if let Ok(stats) = self.allocator.stats() {
            if stats.live_allocations > 0 {
                tracing::warn!(
                    "GpuBufferPool '{}': dropped with {} live allocations ({} bytes)",
                    self.name,
                    stats.live_allocations,
                    stats.requested_bytes
                );
            }
        }
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn lcm(a: u64, b: u64) -> u64 {
    a / gcd(a, b) * b
}
