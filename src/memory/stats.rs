//! Allocator and pool statistics snapshots

use std::fmt;

/// Aggregate statistics of a segregated free-list allocator
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AllocatorStats {
    /// Bytes of chunk memory held (live and retained chunks)
    pub allocated_bytes: u64,
    /// Bytes of slots currently in use (slot granularity)
    pub in_use_bytes: u64,
    /// Bytes requested by live allocations
    pub requested_bytes: u64,
    /// Live chunks
    pub chunk_count: usize,
    /// Slots in use, including those waiting in the garbage collector
    pub live_allocations: u64,
    /// Slots queued for deferred free
    pub pending_frees: u64,
    /// Emptied chunks kept for reuse
    pub retained_chunks: usize,
    pub external_fragmentation: f32,
    /// Same as `external_fragmentation`, weighing every free run
    pub quadratic_fragmentation: f32,
}

impl AllocatorStats {
    /// Fraction of in-use slot bytes lost to rounding up to the slot size
    pub fn internal_fragmentation(&self) -> f32 {
        if self.in_use_bytes == 0 {
            return 0.0;
        }
        1.0 - (self.requested_bytes as f32 / self.in_use_bytes as f32)
    }
}

impl fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AllocatorStats: allocated={}KB, in_use={}KB, chunks={} (+{} retained), live={}, pending={}, ext_frag={:.2}",
            self.allocated_bytes / 1024,
            self.in_use_bytes / 1024,
            self.chunk_count,
            self.retained_chunks,
            self.live_allocations,
            self.pending_frees,
            self.external_fragmentation
        )
    }
}

/// Per size class breakdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    pub class_index: usize,
    pub slot_size: u64,
    pub chunk_size: u64,
    pub chunk_count: usize,
    pub in_use_slots: u64,
    pub total_slots: u64,
    pub pending_frees: u64,
    pub retained_chunks: usize,
}

impl ClassStats {
    pub fn occupancy(&self) -> f32 {
        if self.total_slots == 0 {
            return 0.0;
        }
        self.in_use_slots as f32 / self.total_slots as f32
    }
}

/// Statistics of a [`GpuBufferPool`](super::GpuBufferPool)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolStats {
    pub allocator: AllocatorStats,
    pub backing_buffers: usize,
    /// Total bytes of backing buffers
    pub reserved_bytes: u64,
    pub backing_fragmentation: f32,
    pub pending_garbage_items: usize,
    pub pending_garbage_buckets: usize,
    pub frame: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PoolStats: frame={}, backing={} buffers ({}KB), garbage={} items in {} frames; {}",
            self.frame,
            self.backing_buffers,
            self.reserved_bytes / 1024,
            self.pending_garbage_items,
            self.pending_garbage_buckets,
            self.allocator
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_stats_display() {
        let stats = AllocatorStats {
            allocated_bytes: 32 * 1024,
            in_use_bytes: 2048,
            chunk_count: 2,
            live_allocations: 32,
            ..Default::default()
        };
        let display = stats.to_string();
        assert!(display.contains("allocated=32KB"));
        assert!(display.contains("chunks=2"));
    }

    #[test]
    fn test_internal_fragmentation() {
        let stats = AllocatorStats {
            in_use_bytes: 64,
            requested_bytes: 48,
            ..Default::default()
        };
        assert!((stats.internal_fragmentation() - 0.25).abs() < f32::EPSILON);
        assert_eq!(AllocatorStats::default().internal_fragmentation(), 0.0);
    }

    #[test]
    fn test_class_occupancy() {
        let stats = ClassStats {
            in_use_slots: 64,
            total_slots: 256,
            ..Default::default()
        };
        assert_eq!(stats.occupancy(), 0.25);
    }

    #[test]
    fn test_pool_stats_display_includes_allocator() {
        let stats = PoolStats {
            frame: 7,
            backing_buffers: 1,
            ..Default::default()
        };
        let display = stats.to_string();
        assert!(display.contains("frame=7"));
        assert!(display.contains("AllocatorStats"));
    }
}
