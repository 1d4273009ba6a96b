//! forgemem - GPU memory sub-allocation core
//!
//! Carves large device buffers into sub-allocations for geometry, scene data
//! and transient staging, and reclaims them only after the GPU finished
//! reading them.
//!
//! ```no_run
//! use std::sync::Arc;
//! use forgemem::backend::{GpuDevice, HostDevice};
//! use forgemem::memory::{GpuBufferPool, PoolConfig};
//!
//! # fn main() -> forgemem::MemResult<()> {
//! let device = Arc::new(HostDevice::new());
//! let pool = GpuBufferPool::new("geometry", device.clone(), PoolConfig::default())?;
//!
//! let vertices = pool.allocate_typed::<[f32; 3]>(1024)?;
//! // ... record GPU work reading `vertices` ...
//! pool.deferred_free(vertices)?;
//! pool.end_frame(device.create_fence()?)?;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::missing_safety_doc)] // FFI bindings documented at module level
#![allow(clippy::new_without_default)]

pub mod backend;
pub mod error;
pub mod logging;
pub mod memory;
pub mod metrics;

pub use backend::{DevicePtr, Fence, FencePtr, GpuDevice, HostDevice, HostFence};
pub use error::{ErrorCategory, ForgeMemError, MemResult};
pub use memory::{
    Allocation, AllocationToken, FrameGarbageCollector, GpuBufferPool, PoolConfig,
    SegregatedFreeListAllocator, StackFrameAllocator, StagingRing,
};
pub use metrics::PoolMetrics;
