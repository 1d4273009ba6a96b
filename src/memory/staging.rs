//! Ring of stack allocators for CPU-to-GPU staging data
//!
//! One [`StackFrameAllocator`] per frame in flight. A slot is reused only
//! after the fence of the frame that last wrote it signaled.

use std::time::{Duration, Instant};

use super::config::{GarbageCollectorConfig, StackAllocatorConfig};
use super::stack::{StackAllocation, StackFrameAllocator};
use crate::backend::{DevicePtr, FencePtr};
use crate::error::{ForgeMemError, MemResult};

struct StagingFrame {
    allocator: StackFrameAllocator,
    fence: Option<FencePtr>,
}

pub struct StagingRing {
    frames: Vec<StagingFrame>,
    current: usize,
    fence_timeout: Duration,
}

impl StagingRing {
    pub fn new(
        name: &str,
        device: DevicePtr,
        stack: StackAllocatorConfig,
        garbage: &GarbageCollectorConfig,
    ) -> MemResult<Self> {
        garbage.validate()?;
        let frames = (0..garbage.max_frames_in_flight)
            .map(|i| {
                Ok(StagingFrame {
                    allocator: StackFrameAllocator::new(
                        format!("{}#{}", name, i),
                        device.clone(),
                        stack.clone(),
                    )?,
                    fence: None,
                })
            })
            .collect::<MemResult<Vec<_>>>()?;
        tracing::info!(
            "StagingRing '{}': {} frames, {} bytes initial per frame",
            name,
            frames.len(),
            stack.initial_chunk_size
        );
        Ok(StagingRing {
            frames,
            current: 0,
            fence_timeout: garbage.fence_timeout(),
        })
    }

    /// Wait for the current slot's previous fence and rewind its allocator
    ///
    /// # Errors
    /// `FenceTimeout` if the fence does not signal within the configured bound;
    /// the slot keeps its fence so the call can be retried.
    pub fn begin_frame(&mut self) -> MemResult<Option<Duration>> {
        let timeout = self.fence_timeout;
        let frame = &mut self.frames[self.current];
        let mut stalled = None;
        if let Some(fence) = &frame.fence {
            if !fence.is_signaled() {
                let start = Instant::now();
                tracing::warn!(
                    "StagingRing::begin_frame: slot {} still in use by the GPU, waiting",
                    self.current
                );
                if !fence.wait(timeout) {
                    return Err(ForgeMemError::FenceTimeout { waited: timeout });
                }
                stalled = Some(start.elapsed());
            }
        }
        frame.fence = None;
        frame.allocator.reset();
        Ok(stalled)
    }

    pub fn allocate(&self, size: u64, alignment: u64) -> MemResult<StackAllocation> {
        self.frames[self.current].allocator.allocate(size, alignment)
    }

    /// Allocate room for `data` and copy it in
    pub fn upload<T: Copy>(&self, data: &[T]) -> MemResult<StackAllocation> {
        let allocator = &self.frames[self.current].allocator;
        let size = std::mem::size_of_val(data).max(1) as u64;
        let allocation = allocator.allocate(size, std::mem::align_of::<T>() as u64)?;
        allocator.write(&allocation, data)?;
        Ok(allocation)
    }

    /// Attach the fence of the submitted frame and advance to the next slot
    pub fn end_frame(&mut self, fence: FencePtr) {
        self.frames[self.current].fence = Some(fence);
        self.current = (self.current + 1) % self.frames.len();
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn current_allocator(&self) -> &StackFrameAllocator {
        &self.frames[self.current].allocator
    }
}
