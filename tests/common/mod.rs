//! Common test utilities
//!
//! Every integration test runs against [`HostDevice`], so the allocators are
//! exercised without a GPU. A fixture wraps one device and checks on drop
//! that no device buffer outlived the pool under test.
//!
//! # Usage
//!
//! ```ignore
//! let fixture = HostFixture::new();
//! let pool = fixture.pool("geometry", scenario_config())?;
//! // ... test code ...
//! drop(pool);
//! fixture.assert_no_leak();
//! ```

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use forgemem::backend::{DevicePtr, HostDevice, HostFence};
use forgemem::memory::{
    GarbageCollectorConfig, GpuBufferPool, PoolConfig, SegregatedFreeListAllocator,
    SizeClassConfig, SizeClassTable,
};
use forgemem::memory::{ChunkSource, DedicatedChunkSource};
use forgemem::MemResult;

pub use serial_test::serial;

/// Classes `{64 B, 1 KiB, 64 KiB}` over chunks `{16 KiB, 256 KiB, 1 MiB}`
pub fn scenario_classes() -> Vec<SizeClassConfig> {
    vec![
        SizeClassConfig::new(64, 16 * 1024),
        SizeClassConfig::new(1024, 256 * 1024),
        SizeClassConfig::new(64 * 1024, 1024 * 1024),
    ]
}

/// Pool over the scenario classes with mapped backing buffers
pub fn scenario_config() -> PoolConfig {
    PoolConfig::new()
        .with_size_classes(scenario_classes())
        .with_buffer_size_hint(4 * 1024 * 1024)
        .with_max_buffer_count(4)
        .with_mappable(true)
        .with_garbage(
            GarbageCollectorConfig::default()
                .with_max_frames_in_flight(3)
                .with_fence_timeout(Duration::from_millis(50)),
        )
}

/// A fence the test signals by hand
pub fn manual_fence() -> Arc<HostFence> {
    Arc::new(HostFence::new())
}

pub struct HostFixture {
    device: Arc<HostDevice>,
}

impl HostFixture {
    pub fn new() -> Self {
        HostFixture {
            device: Arc::new(HostDevice::new()),
        }
    }

    pub fn with_device(device: HostDevice) -> Self {
        HostFixture {
            device: Arc::new(device),
        }
    }

    pub fn device(&self) -> &Arc<HostDevice> {
        &self.device
    }

    pub fn device_ptr(&self) -> DevicePtr {
        self.device.clone()
    }

    pub fn pool(&self, name: &str, config: PoolConfig) -> MemResult<GpuBufferPool> {
        GpuBufferPool::new(name, self.device_ptr(), config)
    }

    /// Allocator with one dedicated device buffer per chunk
    pub fn dedicated_allocator(
        &self,
        classes: &[SizeClassConfig],
    ) -> MemResult<SegregatedFreeListAllocator> {
        let table = SizeClassTable::from_config(classes)?;
        let source: Arc<dyn ChunkSource> = Arc::new(DedicatedChunkSource::new(
            self.device_ptr(),
            Default::default(),
            true,
        ));
        Ok(SegregatedFreeListAllocator::new("test", table, source))
    }

    /// Every device buffer created so far has been destroyed
    pub fn assert_no_leak(&self) {
        assert_eq!(
            self.device.live_buffer_count(),
            0,
            "{} device buffers still alive ({} created, {} destroyed)",
            self.device.live_buffer_count(),
            self.device.buffers_created(),
            self.device.buffers_destroyed()
        );
    }
}
