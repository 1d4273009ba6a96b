//! CPU-memory implementation of the device surface
//!
//! Buffers are zeroed heap allocations and every buffer is mappable, which
//! makes the host device useful both for tests and for tools that need the
//! allocators without a GPU. Fences created by the device are already
//! signaled because host "submissions" complete immediately; tests that need
//! to control fence timing construct [`HostFence`] directly.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::{BufferDesc, BufferHandle, DeviceLimits, Fence, FencePtr, GpuDevice, MappedPtr};
use crate::error::{ForgeMemError, MemResult};
use crate::invalid_request;

const HOST_BUFFER_ALIGN: usize = 4096;

struct HostBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    mapped: bool,
}

// SAFETY: the allocation is owned by the buffer table and only freed under its lock
unsafe impl Send for HostBuffer {}

/// Device backed by host memory
pub struct HostDevice {
    buffers: Mutex<HashMap<u64, HostBuffer>>,
    next_handle: AtomicU64,
    limits: DeviceLimits,
    budget: Option<u64>,
    used: AtomicU64,
    fail_next: AtomicUsize,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits::default())
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        HostDevice {
            buffers: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            limits,
            budget: None,
            used: AtomicU64::new(0),
            fail_next: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        }
    }

    /// Cap the total bytes of live buffers
    pub fn with_budget(mut self, bytes: u64) -> Self {
        self.budget = Some(bytes);
        self
    }

    /// Make the next `count` buffer creations fail with `DeviceOutOfMemory`
    pub fn fail_next_allocations(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn buffers_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn buffers_destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Copy bytes out of a buffer, bypassing mapping
    pub fn read_buffer(&self, handle: BufferHandle, offset: u64, len: usize) -> MemResult<Vec<u8>> {
        let buffers = self.buffers.lock()?;
        let buffer = buffers
            .get(&handle.0)
            .ok_or_else(|| invalid_request!("unknown {}", handle))?;
        if offset as usize + len > buffer.layout.size() {
            return Err(invalid_request!(
                "read of {} bytes at {} past end of {} ({} bytes)",
                len,
                offset,
                handle,
                buffer.layout.size()
            ));
        }
        let mut out = vec![0u8; len];
        // SAFETY: bounds checked above, buffer kept alive by the held lock
        unsafe {
            std::ptr::copy_nonoverlapping(
                buffer.ptr.as_ptr().add(offset as usize),
                out.as_mut_ptr(),
                len,
            );
        }
        Ok(out)
    }

    /// Allocate and register a zeroed buffer of `size` bytes
    fn insert_buffer(&self, size: u64) -> MemResult<u64> {
        let layout = Layout::from_size_align(size as usize, HOST_BUFFER_ALIGN)
            .map_err(|e| invalid_request!("bad buffer layout: {}", e))?;
        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(ForgeMemError::DeviceOutOfMemory {
            requested: size,
            available: 0,
        })?;

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        match self.buffers.lock() {
            Ok(mut buffers) => {
                buffers.insert(
                    handle,
                    HostBuffer {
                        ptr,
                        layout,
                        mapped: false,
                    },
                );
                Ok(handle)
            }
            Err(e) => {
                // SAFETY: ptr was allocated above with this layout and never shared
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
                Err(e.into())
            }
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for HostDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> MemResult<BufferHandle> {
        if desc.size == 0 {
            return Err(invalid_request!("buffer size must be non-zero"));
        }
        if desc.size > self.limits.max_buffer_size {
            return Err(ForgeMemError::DeviceOutOfMemory {
                requested: desc.size,
                available: self.limits.max_buffer_size,
            });
        }

        if self.take_injected_failure() {
            tracing::debug!(
                "HostDevice::create_buffer: refusing {} bytes (injected failure)",
                desc.size
            );
            return Err(ForgeMemError::DeviceOutOfMemory {
                requested: desc.size,
                available: 0,
            });
        }

        // reserve the bytes before allocating
        let budget = self.budget.unwrap_or(u64::MAX);
        if let Err(used) = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(desc.size).filter(|&next| next <= budget)
            })
        {
            let available = budget.saturating_sub(used);
            tracing::debug!(
                "HostDevice::create_buffer: refusing {} bytes ({} available)",
                desc.size,
                available
            );
            return Err(ForgeMemError::DeviceOutOfMemory {
                requested: desc.size,
                available,
            });
        }

        let handle = self.insert_buffer(desc.size).inspect_err(|_| {
            self.used.fetch_sub(desc.size, Ordering::SeqCst);
        })?;
        self.created.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(
            "HostDevice::create_buffer: handle={} size={} usage={:?}",
            handle,
            desc.size,
            desc.usage
        );
        Ok(BufferHandle(handle))
    }

    fn destroy_buffer(&self, handle: BufferHandle) {
        let removed = match self.buffers.lock() {
            Ok(mut buffers) => buffers.remove(&handle.0),
            Err(e) => {
                tracing::error!("HostDevice::destroy_buffer: lock poisoned: {}", e);
                return;
            }
        };
        match removed {
            Some(buffer) => {
                self.used
                    .fetch_sub(buffer.layout.size() as u64, Ordering::SeqCst);
                self.destroyed.fetch_add(1, Ordering::Relaxed);
                // SAFETY: ptr was allocated with this exact layout
                unsafe { alloc::dealloc(buffer.ptr.as_ptr(), buffer.layout) };
            }
            None => tracing::warn!("HostDevice::destroy_buffer: unknown {}", handle),
        }
    }

    fn map_buffer(&self, handle: BufferHandle, offset: u64, size: u64) -> MemResult<MappedPtr> {
        let mut buffers = self.buffers.lock()?;
        let buffer = buffers
            .get_mut(&handle.0)
            .ok_or_else(|| ForgeMemError::MapFailed(format!("unknown {}", handle)))?;
        if offset + size > buffer.layout.size() as u64 {
            return Err(ForgeMemError::MapFailed(format!(
                "range {}..{} exceeds {} ({} bytes)",
                offset,
                offset + size,
                handle,
                buffer.layout.size()
            )));
        }
        buffer.mapped = true;
        // SAFETY: offset is within the allocation
        let ptr = unsafe { buffer.ptr.as_ptr().add(offset as usize) };
        MappedPtr::from_raw(ptr).ok_or_else(|| ForgeMemError::MapFailed("null mapping".into()))
    }

    fn unmap_buffer(&self, handle: BufferHandle) {
        if let Ok(mut buffers) = self.buffers.lock() {
            if let Some(buffer) = buffers.get_mut(&handle.0) {
                buffer.mapped = false;
            }
        }
    }

    fn create_fence(&self) -> MemResult<FencePtr> {
        Ok(Arc::new(HostFence::signaled()))
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        let buffers = match self.buffers.get_mut() {
            Ok(buffers) => buffers,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !buffers.is_empty() {
            tracing::warn!(
                "HostDevice dropped with {} live buffers ({} bytes)",
                buffers.len(),
                self.used.load(Ordering::Relaxed)
            );
        }
        for (_, buffer) in buffers.drain() {
            // SAFETY: allocated with this layout and not yet freed
            unsafe { alloc::dealloc(buffer.ptr.as_ptr(), buffer.layout) };
        }
    }
}

/// Manually signaled fence
#[derive(Debug, Default)]
pub struct HostFence {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl HostFence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signaled() -> Self {
        HostFence {
            signaled: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        if let Ok(mut signaled) = self.signaled.lock() {
            *signaled = true;
            self.cond.notify_all();
        }
    }
}

impl Fence for HostFence {
    fn is_signaled(&self) -> bool {
        self.signaled.lock().map(|s| *s).unwrap_or(false)
    }

    fn wait(&self, timeout: Duration) -> bool {
        let guard = match self.signaled.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        match self.cond.wait_timeout_while(guard, timeout, |signaled| !*signaled) {
            Ok((guard, _)) => *guard,
            Err(_) => false,
        }
    }
}
