//! GPU memory sub-allocation
//!
//! Device buffers are expensive to create and bind, so memory is reserved in
//! large chunks and handed out in smaller pieces:
//!
//! - [`SegregatedFreeListAllocator`]: size classes of fixed-size slots,
//!   each class owning a list of chunks tracked by a bitset
//! - [`FrameGarbageCollector`]: keeps freed slots out of circulation until
//!   the fence of the frame that last used them signaled
//! - [`GpuBufferPool`]: the two above over a bounded set of backing buffers
//! - [`StackFrameAllocator`] / [`StagingRing`]: bump allocation for
//!   transient per-frame data

pub mod chunk;
pub mod chunk_source;
pub mod config;
pub mod garbage;
pub mod pool;
pub mod segregated;
pub mod size_class;
pub mod slot_mask;
pub mod stack;
pub mod staging;
pub mod stats;

pub use chunk::{AllocationToken, ChunkId, ChunkMemory};
pub use chunk_source::{BackingBufferSource, ChunkSource, DedicatedChunkSource};
pub use config::{
    GarbageCollectorConfig, PoolConfig, PoolPreset, ReclaimPolicy, SizeClassConfig,
    StackAllocatorConfig,
};
pub use garbage::{CollectReport, FrameGarbageCollector, ReclaimFailure, ReclaimResult};
pub use pool::{Allocation, GpuBufferPool};
pub use segregated::SegregatedFreeListAllocator;
pub use size_class::{SizeClass, SizeClassTable, MAX_SLOTS_PER_CHUNK};
pub use slot_mask::SlotMask;
pub use stack::{StackAllocation, StackFrameAllocator};
pub use staging::StagingRing;
pub use stats::{AllocatorStats, ClassStats, PoolStats};
