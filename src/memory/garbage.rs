//! Deferred free of GPU memory
//!
//! The GPU runs a few frames behind the CPU, so memory released by the CPU in
//! frame N may still be read by commands of frame N. Released items are held
//! in the *open* bucket until `end_frame` closes it with the frame's fence;
//! a closed bucket is reclaimed once that fence signaled. An item whose
//! reclaim fails is handed back and retried on the next collection.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::config::{GarbageCollectorConfig, ReclaimPolicy};
use crate::backend::FencePtr;
use crate::error::{ForgeMemError, MemResult};

struct GarbageBucket<T> {
    frame: u64,
    fence: FencePtr,
    items: Vec<T>,
}

/// A reclaim that failed, handing the item back
#[derive(Debug)]
pub struct ReclaimFailure<T> {
    pub item: T,
    pub error: ForgeMemError,
}

impl<T> ReclaimFailure<T> {
    pub fn new(item: T, error: ForgeMemError) -> Self {
        ReclaimFailure { item, error }
    }
}

/// Result of reclaiming one item
pub type ReclaimResult<T> = Result<(), ReclaimFailure<T>>;

/// Outcome of one collection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectReport {
    pub buckets_retired: usize,
    pub items_reclaimed: usize,
    /// Time spent blocked on the oldest fence, if `end_frame` had to stall
    pub stalled: Option<Duration>,
}

impl CollectReport {
    fn merge(&mut self, other: CollectReport) {
        self.buckets_retired += other.buckets_retired;
        self.items_reclaimed += other.items_reclaimed;
        if other.stalled.is_some() {
            self.stalled = Some(self.stalled.unwrap_or_default() + other.stalled.unwrap_or_default());
        }
    }
}

/// Per-frame deferred free queue
pub struct FrameGarbageCollector<T> {
    config: GarbageCollectorConfig,
    open: Mutex<Vec<T>>,
    closed: Mutex<VecDeque<GarbageBucket<T>>>,
    frame: AtomicU64,
}

impl<T: Send> FrameGarbageCollector<T> {
    pub fn new(config: GarbageCollectorConfig) -> Self {
        FrameGarbageCollector {
            config,
            open: Mutex::new(Vec::new()),
            closed: Mutex::new(VecDeque::new()),
            frame: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &GarbageCollectorConfig {
        &self.config
    }

    /// Frames closed so far
    pub fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// Queue `item` in the open bucket
    pub fn deferred_free(&self, item: T) -> MemResult<()> {
        self.open.lock()?.push(item);
        Ok(())
    }

    /// Close the open bucket with `fence` and reclaim whatever is ready
    ///
    /// When more than `max_frames_in_flight` buckets are still outstanding,
    /// blocks on the oldest fence for at most `fence_timeout`.
    ///
    /// # Errors
    /// `FenceTimeout` when the oldest fence did not signal in time, or the
    /// first error returned by `reclaim`. Items that failed stay queued.
    pub fn end_frame<F>(&self, fence: FencePtr, mut reclaim: F) -> MemResult<CollectReport>
    where
        F: FnMut(T) -> ReclaimResult<T>,
    {
        let items = mem::take(&mut *self.open.lock()?);
        let frame = self.frame.fetch_add(1, Ordering::AcqRel);
        let outstanding = {
            let mut closed = self.closed.lock()?;
            closed.push_back(GarbageBucket {
                frame,
                fence,
                items,
            });
            closed.len()
        };
        tracing::trace!(
            "FrameGarbageCollector::end_frame: closed frame {} ({} outstanding)",
            frame,
            outstanding
        );

        let mut report = self.collect(&mut reclaim)?;

        loop {
            let oldest = {
                let closed = self.closed.lock()?;
                if closed.len() <= self.config.max_frames_in_flight {
                    break;
                }
                closed
                    .front()
                    .map(|bucket| (closed.len(), bucket.frame, bucket.fence.clone()))
            };
            let Some((in_flight, oldest_frame, fence)) = oldest else {
                break;
            };

            let timeout = self.config.fence_timeout();
            tracing::warn!(
                "FrameGarbageCollector::end_frame: {} frames in flight exceeds {}, waiting on frame {}",
                in_flight,
                self.config.max_frames_in_flight,
                oldest_frame
            );
            let start = Instant::now();
            if !fence.wait(timeout) {
                tracing::error!(
                    "FrameGarbageCollector::end_frame: fence of frame {} did not signal within {:?}",
                    oldest_frame,
                    timeout
                );
                return Err(ForgeMemError::FenceTimeout { waited: timeout });
            }
            report.merge(CollectReport {
                stalled: Some(start.elapsed()),
                ..Default::default()
            });
            report.merge(self.collect(&mut reclaim)?);
        }

        Ok(report)
    }

    /// Reclaim buckets whose fence signaled, without closing a new one
    pub fn collect<F>(&self, mut reclaim: F) -> MemResult<CollectReport>
    where
        F: FnMut(T) -> ReclaimResult<T>,
    {
        let ready = {
            let mut closed = self.closed.lock()?;
            match self.config.policy {
                ReclaimPolicy::StopAtFirstPending => {
                    let count = closed
                        .iter()
                        .take_while(|bucket| bucket.fence.is_signaled())
                        .count();
                    closed.drain(..count).collect::<Vec<_>>()
                }
                ReclaimPolicy::FullScan => {
                    let (ready, pending): (VecDeque<_>, VecDeque<_>) = mem::take(&mut *closed)
                        .into_iter()
                        .partition(|bucket| bucket.fence.is_signaled());
                    *closed = pending;
                    ready.into_iter().collect()
                }
            }
        };
        self.reclaim_buckets(ready, &mut reclaim)
    }

    /// Wait for every outstanding fence, then reclaim everything
    ///
    /// Items still in the open bucket are reclaimed too; callers flush only
    /// when the device is idle (shutdown, device reset).
    pub fn flush<F>(&self, timeout: Duration, mut reclaim: F) -> MemResult<CollectReport>
    where
        F: FnMut(T) -> ReclaimResult<T>,
    {
        let deadline = Instant::now() + timeout;
        let fences: Vec<(u64, FencePtr)> = self
            .closed
            .lock()?
            .iter()
            .map(|bucket| (bucket.frame, bucket.fence.clone()))
            .collect();
        for (frame, fence) in fences {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !fence.wait(remaining) {
                tracing::error!(
                    "FrameGarbageCollector::flush: fence of frame {} did not signal within {:?}",
                    frame,
                    timeout
                );
                return Err(ForgeMemError::FenceTimeout { waited: timeout });
            }
        }

        let mut buckets: Vec<_> = mem::take(&mut *self.closed.lock()?).into_iter().collect();
        let open = mem::take(&mut *self.open.lock()?);
        if !open.is_empty() {
            buckets.push(GarbageBucket {
                frame: self.current_frame(),
                fence: idle_fence(),
                items: open,
            });
        }
        let report = self.reclaim_buckets(buckets, &mut reclaim)?;
        tracing::debug!(
            "FrameGarbageCollector::flush: reclaimed {} items",
            report.items_reclaimed
        );
        Ok(report)
    }

    /// Closed buckets still waiting on their fence
    pub fn pending_bucket_count(&self) -> usize {
        self.closed.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Items in the open bucket plus all closed buckets
    pub fn pending_item_count(&self) -> usize {
        let open = self.open.lock().map(|o| o.len()).unwrap_or(0);
        let closed = self
            .closed
            .lock()
            .map(|c| c.iter().map(|b| b.items.len()).sum())
            .unwrap_or(0);
        open + closed
    }

    fn reclaim_buckets<F>(
        &self,
        buckets: Vec<GarbageBucket<T>>,
        reclaim: &mut F,
    ) -> MemResult<CollectReport>
    where
        F: FnMut(T) -> ReclaimResult<T>,
    {
        let mut report = CollectReport::default();
        let mut first_error = None;
        let mut retry = Vec::new();
        for bucket in buckets {
            let mut failed = Vec::new();
            for item in bucket.items {
                match reclaim(item) {
                    Ok(()) => report.items_reclaimed += 1,
                    Err(ReclaimFailure { item, error }) => {
                        tracing::error!(
                            "FrameGarbageCollector: reclaiming item of frame {} failed: {}",
                            bucket.frame,
                            error
                        );
                        failed.push(item);
                        first_error.get_or_insert(error);
                    }
                }
            }
            if failed.is_empty() {
                report.buckets_retired += 1;
            } else {
                retry.push(GarbageBucket {
                    frame: bucket.frame,
                    fence: bucket.fence,
                    items: failed,
                });
            }
        }

        if !retry.is_empty() {
            // oldest first, ahead of everything still waiting on its fence
            let mut closed = self.closed.lock()?;
            for bucket in retry.into_iter().rev() {
                closed.push_front(bucket);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

/// Fence for items the caller declared idle
fn idle_fence() -> FencePtr {
    std::sync::Arc::new(crate::backend::HostFence::signaled())
}

impl<T> Drop for FrameGarbageCollector<T> {
    fn drop(&mut self) {
        let open = self.open.get_mut().map(|o| o.len()).unwrap_or(0);
        let closed: usize = self
            .closed
            .get_mut()
            .map(|c| c.iter().map(|b| b.items.len()).sum())
            .unwrap_or(0);
        if open + closed > 0 {
            tracing::warn!(
                "FrameGarbageCollector dropped with {} unreclaimed items",
                open + closed
            );
        }
    }
}
