// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Monotonic GPU fences and the sync points derived from them.
//!
//! A [`Fence`] belongs to one queue. Every submission signals the next value,
//! and the resulting [`SyncPoint`] means "the GPU has reached at least this
//! value". The completed value is a cached snapshot refreshed only at defined
//! points: [`Fence::refresh_completed_value`] (called at frame start and by
//! the allocator pool when its head is not known to be ready) and after a
//! blocking wait returns.
//!
//! Invariant: `next_value > last_signaled_value >= completed_value`.

use crate::handle::DeviceHandle;
use ferrite_core::rhi::{FenceId, QueueType, RhiError, RhiResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A monotonic GPU fence owned by a queue.
pub struct Fence {
    device: Arc<DeviceHandle>,
    id: FenceId,
    queue: QueueType,
    last_signaled: Mutex<u64>,
    completed: AtomicU64,
}

impl Fence {
    /// Creates a fence for `queue`, starting at zero.
    ///
    /// # Errors
    ///
    /// Returns `ResourceCreationFailure` if the native fence cannot be created.
    /// A device without fences cannot run, so callers treat this as fatal.
    pub fn new(device: Arc<DeviceHandle>, queue: QueueType) -> RhiResult<Arc<Self>> {
        let id = device.native().create_fence(0).inspect_err(|e| {
            log::error!("Fence: failed to create the {queue} queue fence: {e}");
        })?;
        Ok(Arc::new(Self {
            device,
            id,
            queue,
            last_signaled: Mutex::new(0),
            completed: AtomicU64::new(0),
        }))
    }

    /// The native fence.
    pub fn id(&self) -> FenceId {
        self.id
    }

    /// The queue this fence tracks.
    pub fn queue(&self) -> QueueType {
        self.queue
    }

    /// The value the next signal will use.
    pub fn next_value(&self) -> u64 {
        *self.last_signaled.lock() + 1
    }

    /// The last value enqueued for signaling.
    pub fn last_signaled_value(&self) -> u64 {
        *self.last_signaled.lock()
    }

    /// The cached completed value. Never calls into the native device.
    pub fn completed_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Whether the cached snapshot shows `value` as reached.
    pub fn is_complete(&self, value: u64) -> bool {
        value <= self.completed_value()
    }

    /// Queries the native fence and updates the cached snapshot.
    pub fn refresh_completed_value(&self) -> RhiResult<u64> {
        let value = self
            .device
            .check(self.device.native().fence_completed_value(self.id))?;
        Ok(self.advance_snapshot(value))
    }

    /// Enqueues a GPU signal of the next value after all prior work on the queue.
    pub fn signal(self: &Arc<Self>) -> RhiResult<SyncPoint> {
        let signaled = self.enqueue_signal();
        self.device.check(signaled)
    }

    /// [`signal`](Self::signal) without the device-removed report, for callers
    /// that hold a lock of their own and report once it is released.
    pub(crate) fn enqueue_signal(self: &Arc<Self>) -> RhiResult<SyncPoint> {
        let mut last = self.last_signaled.lock();
        let value = *last + 1;
        self.signal_locked(&mut last, value)
    }

    /// Enqueues a GPU signal of an explicit value.
    ///
    /// # Errors
    ///
    /// Returns `NonMonotonicFence` if `value` is not above the last signaled value.
    pub fn signal_value(self: &Arc<Self>, value: u64) -> RhiResult<SyncPoint> {
        let signaled = {
            let mut last = self.last_signaled.lock();
            if value <= *last {
                log::error!(
                    "Fence({}): rejected non-monotonic signal {} -> {value}",
                    self.queue,
                    *last
                );
                return Err(RhiError::NonMonotonicFence {
                    last: *last,
                    requested: value,
                });
            }
            self.signal_locked(&mut last, value)
        };
        self.device.check(signaled)
    }

    /// Publishes `value` before the GPU can reach it, so the completed value
    /// never runs ahead of the last signaled one.
    fn signal_locked(self: &Arc<Self>, last: &mut u64, value: u64) -> RhiResult<SyncPoint> {
        let previous = std::mem::replace(last, value);
        if let Err(e) = self.device.native().queue_signal(self.queue, self.id, value) {
            *last = previous;
            return Err(e);
        }
        Ok(SyncPoint::new(self.clone(), value))
    }

    /// Blocks until the GPU reaches `value`.
    ///
    /// Returns immediately when the cached snapshot already covers `value`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a value that was never signaled, since
    /// such a wait could never return.
    pub fn wait_for_value(&self, value: u64) -> RhiResult<()> {
        if self.is_complete(value) {
            return Ok(());
        }
        let last = self.last_signaled_value();
        if value > last {
            return Err(RhiError::InvalidArgument(format!(
                "waiting for fence value {value} on the {} queue, last signaled is {last}",
                self.queue
            )));
        }

        let timeout = self.device.settings().gpu_timeout();
        self.device
            .check(self.device.native().wait_fence(self.id, value, timeout))
            .inspect_err(|e| log::warn!("Fence({}): wait for {value} failed: {e}", self.queue))?;
        self.advance_snapshot(value);
        Ok(())
    }

    /// A sync point for the last signaled value, covering all work submitted so far.
    pub fn last_signaled_sync_point(self: &Arc<Self>) -> SyncPoint {
        SyncPoint::new(self.clone(), self.last_signaled_value())
    }

    fn advance_snapshot(&self, value: u64) -> u64 {
        let previous = self.completed.fetch_max(value, Ordering::AcqRel);
        previous.max(value)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.native().destroy_fence(self.id);
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("last_signaled", &self.last_signaled_value())
            .field("completed", &self.completed_value())
            .finish()
    }
}

/// A `(fence, value)` pair: "the GPU has reached at least `value` on `fence`".
#[derive(Clone)]
pub struct SyncPoint {
    fence: Arc<Fence>,
    value: u64,
}

impl SyncPoint {
    /// Creates a sync point.
    pub fn new(fence: Arc<Fence>, value: u64) -> Self {
        Self { fence, value }
    }

    /// The fence.
    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    /// The target value.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// The queue whose work this sync point covers.
    pub fn queue(&self) -> QueueType {
        self.fence.queue()
    }

    /// Whether the cached fence snapshot shows this point as reached.
    pub fn is_complete(&self) -> bool {
        self.fence.is_complete(self.value)
    }

    /// Refreshes the fence snapshot and reports whether this point is reached.
    pub fn poll(&self) -> RhiResult<bool> {
        Ok(self.fence.refresh_completed_value()? >= self.value)
    }

    /// Blocks until this point is reached.
    pub fn wait(&self) -> RhiResult<()> {
        self.fence.wait_for_value(self.value)
    }
}

impl PartialEq for SyncPoint {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.fence, &other.fence) && self.value == other.value
    }
}

impl Eq for SyncPoint {}

impl fmt::Debug for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPoint")
            .field("fence", &self.fence.id())
            .field("queue", &self.fence.queue())
            .field("value", &self.value)
            .finish()
    }
}
