//! Graphics-API capability surface
//!
//! The allocators never talk to a driver directly. They go through
//! [`GpuDevice`] for buffer creation, mapping and fences, which keeps the
//! sub-allocation logic testable against [`HostDevice`] and lets the
//! `rocm` feature plug in a real HIP device.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::MemResult;

pub mod host;

#[cfg(feature = "rocm")]
pub mod hip;

pub use host::{HostDevice, HostFence};

#[cfg(feature = "rocm")]
pub use hip::{HipDevice, HipFence};

bitflags! {
    /// How a buffer will be bound by the GPU
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
        const INDIRECT = 1 << 6;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        BufferUsage::STORAGE | BufferUsage::TRANSFER_DST
    }
}

/// Opaque device buffer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

impl BufferHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{:#x}", self.0)
    }
}

/// Parameters for [`GpuDevice::create_buffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    /// Buffer must be host-visible so it can be mapped
    pub mappable: bool,
}

impl BufferDesc {
    pub fn new(size: u64, usage: BufferUsage, mappable: bool) -> Self {
        Self {
            size,
            usage,
            mappable,
        }
    }
}

/// CPU address of mapped device memory
///
/// The pointer stays valid until the owning buffer is unmapped or destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

// SAFETY: MappedPtr is a plain address into driver-owned memory. Disjoint
// slots are written from different threads; the allocators guarantee that
// no two live allocations share bytes.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    pub fn new(ptr: NonNull<u8>) -> Self {
        MappedPtr(ptr)
    }

    pub fn from_raw(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(MappedPtr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Pointer `bytes` past this one.
    ///
    /// # Safety
    ///
    /// The result must stay inside the same mapping.
    pub unsafe fn add(self, bytes: u64) -> MappedPtr {
        MappedPtr(NonNull::new_unchecked(self.0.as_ptr().add(bytes as usize)))
    }
}

/// Alignment and size limits reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub structured_buffer_alignment: u64,
    pub uniform_buffer_alignment: u64,
    pub max_buffer_size: u64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            structured_buffer_alignment: 16,
            uniform_buffer_alignment: 256,
            max_buffer_size: 1 << 32,
        }
    }
}

/// GPU timeline point that signals once submitted work completed
pub trait Fence: Send + Sync + fmt::Debug {
    /// Non-blocking completion check
    fn is_signaled(&self) -> bool;

    /// Block for at most `timeout`. Returns whether the fence signaled.
    fn wait(&self, timeout: Duration) -> bool;
}

pub type FencePtr = Arc<dyn Fence>;

/// Buffer, mapping and fence operations the allocators depend on
pub trait GpuDevice: Send + Sync {
    fn create_buffer(&self, desc: &BufferDesc) -> MemResult<BufferHandle>;

    fn destroy_buffer(&self, handle: BufferHandle);

    /// Map `size` bytes starting at `offset`. Fails with `NotMappable` when the
    /// buffer was not created host-visible.
    fn map_buffer(&self, handle: BufferHandle, offset: u64, size: u64) -> MemResult<MappedPtr>;

    fn unmap_buffer(&self, handle: BufferHandle);

    fn create_fence(&self) -> MemResult<FencePtr>;

    fn limits(&self) -> DeviceLimits;
}

pub type DevicePtr = Arc<dyn GpuDevice>;
