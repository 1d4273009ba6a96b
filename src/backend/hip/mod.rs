//! AMD HIP implementation of the device surface
//!
//! Device-local buffers come from `hipMalloc`. Host-visible buffers are pinned
//! host allocations (`hipHostMalloc` with the mapped flag); with unified
//! addressing the same pointer is valid on both sides, so mapping is an
//! offset computation. Fences are HIP events recorded on the null stream.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::{BufferDesc, BufferHandle, DeviceLimits, Fence, FencePtr, GpuDevice, MappedPtr};
use crate::backend_error;
use crate::error::{ForgeMemError, MemResult};

mod ffi;

const FENCE_POLL_INTERVAL: Duration = Duration::from_micros(50);

#[derive(Debug, Clone, Copy)]
struct HipAllocation {
    size: u64,
    host_visible: bool,
}

/// HIP device handle
pub struct HipDevice {
    allocations: Mutex<HashMap<u64, HipAllocation>>,
    limits: DeviceLimits,
}

impl HipDevice {
    pub fn new() -> MemResult<Self> {
        let (free, total) = Self::memory_info()?;
        tracing::info!(
            "HipDevice::new: {} MiB free of {} MiB",
            free >> 20,
            total >> 20
        );
        Ok(HipDevice {
            allocations: Mutex::new(HashMap::new()),
            limits: DeviceLimits {
                structured_buffer_alignment: 16,
                uniform_buffer_alignment: 256,
                max_buffer_size: total as u64,
            },
        })
    }

    /// Free and total device memory in bytes
    pub fn memory_info() -> MemResult<(usize, usize)> {
        let mut free: usize = 0;
        let mut total: usize = 0;
        let result = unsafe { ffi::hipMemGetInfo(&mut free, &mut total) };
        if result != ffi::HIP_SUCCESS {
            return Err(backend_error!("hipMemGetInfo failed with code {}", result));
        }
        Ok((free, total))
    }
}

impl GpuDevice for HipDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> MemResult<BufferHandle> {
        let mut raw: *mut c_void = ptr::null_mut();
        let result = if desc.mappable {
            unsafe { ffi::hipHostMalloc(&mut raw, desc.size as usize, ffi::HIP_HOST_MALLOC_MAPPED) }
        } else {
            unsafe { ffi::hipMalloc(&mut raw, desc.size as usize) }
        };

        if result == ffi::HIP_ERROR_OUT_OF_MEMORY {
            let available = Self::memory_info().map(|(free, _)| free as u64).unwrap_or(0);
            return Err(ForgeMemError::DeviceOutOfMemory {
                requested: desc.size,
                available,
            });
        }
        if result != ffi::HIP_SUCCESS || raw.is_null() {
            return Err(backend_error!(
                "buffer allocation of {} bytes failed with code {}",
                desc.size,
                result
            ));
        }

        let handle = raw as u64;
        self.allocations.lock()?.insert(
            handle,
            HipAllocation {
                size: desc.size,
                host_visible: desc.mappable,
            },
        );
        tracing::debug!(
            "HipDevice::create_buffer: {:#x} size={} host_visible={}",
            handle,
            desc.size,
            desc.mappable
        );
        Ok(BufferHandle(handle))
    }

    fn destroy_buffer(&self, handle: BufferHandle) {
        let allocation = match self.allocations.lock() {
            Ok(mut allocations) => allocations.remove(&handle.0),
            Err(e) => {
                tracing::error!("HipDevice::destroy_buffer: lock poisoned: {}", e);
                return;
            }
        };
        let Some(allocation) = allocation else {
            tracing::warn!("HipDevice::destroy_buffer: unknown {}", handle);
            return;
        };
        let raw = handle.0 as *mut c_void;
        let result = if allocation.host_visible {
            unsafe { ffi::hipHostFree(raw) }
        } else {
            unsafe { ffi::hipFree(raw) }
        };
        if result != ffi::HIP_SUCCESS {
            tracing::error!(
                "HipDevice::destroy_buffer: freeing {} failed with code {}",
                handle,
                result
            );
        }
    }

    fn map_buffer(&self, handle: BufferHandle, offset: u64, size: u64) -> MemResult<MappedPtr> {
        let allocations = self.allocations.lock()?;
        let allocation = allocations
            .get(&handle.0)
            .ok_or_else(|| ForgeMemError::MapFailed(format!("unknown {}", handle)))?;
        if !allocation.host_visible {
            return Err(ForgeMemError::NotMappable(handle.to_string()));
        }
        if offset + size > allocation.size {
            return Err(ForgeMemError::MapFailed(format!(
                "range {}..{} exceeds {} ({} bytes)",
                offset,
                offset + size,
                handle,
                allocation.size
            )));
        }
        MappedPtr::from_raw((handle.0 + offset) as *mut u8)
            .ok_or_else(|| ForgeMemError::MapFailed("null mapping".into()))
    }

    fn unmap_buffer(&self, _handle: BufferHandle) {
        // pinned host memory stays mapped for its lifetime
    }

    fn create_fence(&self) -> MemResult<FencePtr> {
        Ok(Arc::new(HipFence::record()?))
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }
}

/// HIP event recorded on the null stream
#[derive(Debug)]
pub struct HipFence {
    event: *mut c_void,
}

// SAFETY: HIP events may be queried and synchronized from any thread. The
// wrapper is not Clone, so the event is destroyed exactly once.
unsafe impl Send for HipFence {}
unsafe impl Sync for HipFence {}

impl HipFence {
    /// Create an event and record it after all work submitted so far
    pub fn record() -> MemResult<Self> {
        let mut event: *mut c_void = ptr::null_mut();
        let result =
            unsafe { ffi::hipEventCreateWithFlags(&mut event, ffi::HIP_EVENT_DISABLE_TIMING) };
        if result != ffi::HIP_SUCCESS || event.is_null() {
            return Err(backend_error!("hipEventCreateWithFlags failed with code {}", result));
        }
        let fence = HipFence { event };

        let result = unsafe { ffi::hipEventRecord(fence.event, ptr::null_mut()) };
        if result != ffi::HIP_SUCCESS {
            return Err(backend_error!("hipEventRecord failed with code {}", result));
        }
        Ok(fence)
    }
}

impl Fence for HipFence {
    fn is_signaled(&self) -> bool {
        match unsafe { ffi::hipEventQuery(self.event) } {
            ffi::HIP_SUCCESS => true,
            ffi::HIP_ERROR_NOT_READY => false,
            code => {
                tracing::warn!("HipFence::is_signaled: hipEventQuery returned {}", code);
                false
            }
        }
    }

    fn wait(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.is_signaled() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            thread::sleep(FENCE_POLL_INTERVAL);
        }
    }
}

impl Drop for HipFence {
    fn drop(&mut self) {
        if !self.event.is_null() {
            unsafe {
                ffi::hipEventDestroy(self.event);
            }
        }
    }
}
