//! Prometheus-compatible allocator telemetry
//!
//! One [`PoolMetrics`] per pool, exported in Prometheus text format.
//! All updates are lock-free atomic operations.

use prometheus_client::{
    encoding::text::encode,
    metrics::counter::Counter,
    metrics::gauge::Gauge,
    metrics::histogram::{exponential_buckets, Histogram},
    registry::Registry,
};
use std::sync::atomic::AtomicU64;

use crate::error::{ForgeMemError, MemResult};
use crate::memory::PoolStats;

/// Metrics of one [`GpuBufferPool`](crate::memory::GpuBufferPool)
#[derive(Debug)]
pub struct PoolMetrics {
    registry: Registry,

    /// Chunk bytes held by the allocator
    pub allocated_bytes: Gauge<i64>,

    /// Slot bytes in use
    pub in_use_bytes: Gauge<i64>,

    pub chunk_count: Gauge<i64>,

    pub backing_buffers: Gauge<i64>,

    /// Items waiting in the garbage collector
    pub pending_garbage: Gauge<i64>,

    pub external_fragmentation: Gauge<f64, AtomicU64>,

    pub allocations: Counter<u64>,

    pub deferred_frees: Counter<u64>,

    pub reclaimed: Counter<u64>,

    pub out_of_memory: Counter<u64>,

    pub frames: Counter<u64>,

    /// Time `end_frame` spent blocked on an old fence
    pub fence_stall_seconds: Histogram,
}

impl PoolMetrics {
    pub fn new(pool: &str) -> Self {
        let mut registry = Registry::with_prefix("forgemem");

        let allocated_bytes = Gauge::default();
        registry.register(
            "allocated_bytes",
            format!("Chunk memory held by pool {}", pool),
            allocated_bytes.clone(),
        );

        let in_use_bytes = Gauge::default();
        registry.register(
            "in_use_bytes",
            format!("Slot bytes in use in pool {}", pool),
            in_use_bytes.clone(),
        );

        let chunk_count = Gauge::default();
        registry.register(
            "chunks",
            format!("Live chunks in pool {}", pool),
            chunk_count.clone(),
        );

        let backing_buffers = Gauge::default();
        registry.register(
            "backing_buffers",
            format!("Backing device buffers of pool {}", pool),
            backing_buffers.clone(),
        );

        let pending_garbage = Gauge::default();
        registry.register(
            "pending_garbage",
            format!("Allocations of pool {} waiting for their fence", pool),
            pending_garbage.clone(),
        );

        let external_fragmentation = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "external_fragmentation",
            format!("Worst chunk fragmentation in pool {}", pool),
            external_fragmentation.clone(),
        );

        let allocations = Counter::default();
        registry.register(
            "allocations",
            "Sub-allocations served",
            allocations.clone(),
        );

        let deferred_frees = Counter::default();
        registry.register(
            "deferred_frees",
            "Allocations queued for deferred free",
            deferred_frees.clone(),
        );

        let reclaimed = Counter::default();
        registry.register(
            "reclaimed",
            "Allocations reclaimed after their fence signaled",
            reclaimed.clone(),
        );

        let out_of_memory = Counter::default();
        registry.register(
            "out_of_memory",
            "Allocation requests that failed for lack of memory",
            out_of_memory.clone(),
        );

        let frames = Counter::default();
        registry.register("frames", "Frames ended", frames.clone());

        let fence_stall_seconds = Histogram::new(exponential_buckets(0.0001, 4.0, 8));
        registry.register(
            "fence_stall_seconds",
            "Time end_frame blocked on the oldest fence",
            fence_stall_seconds.clone(),
        );

        PoolMetrics {
            registry,
            allocated_bytes,
            in_use_bytes,
            chunk_count,
            backing_buffers,
            pending_garbage,
            external_fragmentation,
            allocations,
            deferred_frees,
            reclaimed,
            out_of_memory,
            frames,
            fence_stall_seconds,
        }
    }

    /// Copy a statistics snapshot into the gauges
    pub fn record_stats(&self, stats: &PoolStats) {
        self.allocated_bytes
            .set(stats.allocator.allocated_bytes as i64);
        self.in_use_bytes.set(stats.allocator.in_use_bytes as i64);
        self.chunk_count.set(stats.allocator.chunk_count as i64);
        self.backing_buffers.set(stats.backing_buffers as i64);
        self.pending_garbage.set(stats.pending_garbage_items as i64);
        self.external_fragmentation
            .set(stats.allocator.external_fragmentation as f64);
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> MemResult<String> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)
            .map_err(|e| ForgeMemError::InternalError(format!("metrics encoding failed: {}", e)))?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AllocatorStats;

    #[test]
    fn test_metrics_creation() {
        let metrics = PoolMetrics::new("scene");
        assert_eq!(metrics.allocations.get(), 0);
        assert_eq!(metrics.allocated_bytes.get(), 0);
    }

    #[test]
    fn test_record_stats() {
        let metrics = PoolMetrics::new("scene");
        let stats = PoolStats {
            allocator: AllocatorStats {
                allocated_bytes: 4096,
                in_use_bytes: 128,
                chunk_count: 1,
                external_fragmentation: 0.5,
                ..Default::default()
            },
            backing_buffers: 1,
            pending_garbage_items: 3,
            ..Default::default()
        };
        metrics.record_stats(&stats);
        assert_eq!(metrics.allocated_bytes.get(), 4096);
        assert_eq!(metrics.in_use_bytes.get(), 128);
        assert_eq!(metrics.pending_garbage.get(), 3);
        assert_eq!(metrics.external_fragmentation.get(), 0.5);
    }

    #[test]
    fn test_export_format() {
        let metrics = PoolMetrics::new("geometry");
        metrics.allocations.inc_by(5);
        metrics.fence_stall_seconds.observe(0.002);
        let text = metrics.export().unwrap();
        assert!(text.contains("forgemem_allocations_total 5"));
        assert!(text.contains("forgemem_in_use_bytes"));
        assert!(text.contains("forgemem_fence_stall_seconds"));
        assert!(text.contains("pool geometry"));
    }
}
