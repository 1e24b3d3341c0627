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

//! Command allocators and their fence-gated pool.
//!
//! An allocator owns the memory recorded commands live in, so it can only be
//! reset once the GPU finished every list recorded with it. The pool is a
//! FIFO: allocators are released in submission order, so when the head is not
//! ready nothing behind it is either.

use crate::fence::{Fence, SyncPoint};
use crate::handle::DeviceHandle;
use ferrite_core::rhi::{AllocatorId, QueueType, RhiError, RhiResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A native command allocator stamped with the work that still uses it.
#[derive(Debug)]
pub struct CommandAllocator {
    id: AllocatorId,
    queue: QueueType,
    last_sync_point: Option<SyncPoint>,
}

impl CommandAllocator {
    /// The native allocator.
    pub fn id(&self) -> AllocatorId {
        self.id
    }

    /// The queue type the allocator records for.
    pub fn queue(&self) -> QueueType {
        self.queue
    }

    /// The sync point covering the last work recorded with this allocator.
    pub fn last_sync_point(&self) -> Option<&SyncPoint> {
        self.last_sync_point.as_ref()
    }

    /// Whether the cached fence snapshot shows the allocator as idle.
    pub fn is_ready(&self) -> bool {
        self.last_sync_point
            .as_ref()
            .map_or(true, SyncPoint::is_complete)
    }

    /// Resets the allocator, discarding every command recorded with it.
    ///
    /// # Errors
    ///
    /// Returns `AllocatorInFlight` if the stamped sync point is not known to be
    /// complete. The check uses the cached snapshot and never blocks.
    pub fn reset(&mut self, device: &DeviceHandle) -> RhiResult<()> {
        if let Some(point) = &self.last_sync_point {
            if !point.is_complete() {
                let completed = point.fence().completed_value();
                log::error!(
                    "CommandAllocator({:?}): reset while in flight ({} > {completed})",
                    self.id,
                    point.value()
                );
                return Err(RhiError::AllocatorInFlight {
                    allocator: self.id,
                    required: point.value(),
                    completed,
                });
            }
        }
        device.check(device.native().reset_command_allocator(self.id))?;
        self.last_sync_point = None;
        Ok(())
    }
}

/// Per-queue pool of command allocators.
#[derive(Debug)]
pub struct CommandAllocatorPool {
    device: Arc<DeviceHandle>,
    queue: QueueType,
    fence: Arc<Fence>,
    free: Mutex<VecDeque<CommandAllocator>>,
    created: AtomicUsize,
}

impl CommandAllocatorPool {
    /// Creates an empty pool for the queue `fence` belongs to.
    pub fn new(device: Arc<DeviceHandle>, fence: Arc<Fence>) -> Self {
        Self {
            device,
            queue: fence.queue(),
            fence,
            free: Mutex::new(VecDeque::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// The queue type served.
    pub fn queue(&self) -> QueueType {
        self.queue
    }

    /// Returns a reset allocator ready for recording.
    ///
    /// The head of the free queue is reused when its sync point is complete.
    /// If the cached snapshot does not show it as complete, the fence is
    /// refreshed once and the head checked again. Otherwise a new allocator
    /// is created.
    pub fn obtain(&self) -> RhiResult<CommandAllocator> {
        // Polling reports device loss, so it must run with the pool unlocked.
        let unknown_head = self
            .free
            .lock()
            .front()
            .filter(|head| !head.is_ready())
            .and_then(|head| head.last_sync_point.clone());
        if let Some(point) = unknown_head {
            point.poll()?;
        }
        let reusable = {
            let mut free = self.free.lock();
            if free.front().is_some_and(CommandAllocator::is_ready) {
                free.pop_front()
            } else {
                None
            }
        };

        let Some(mut allocator) = reusable else {
            return self.create();
        };
        if let Err(e) = allocator.reset(&self.device) {
            self.free.lock().push_front(allocator);
            return Err(e);
        }
        log::trace!("CommandAllocatorPool({}): reused {:?}", self.queue, allocator.id);
        Ok(allocator)
    }

    fn create(&self) -> RhiResult<CommandAllocator> {
        let id = self
            .device
            .check(self.device.native().create_command_allocator(self.queue))
            .inspect_err(|e| {
                log::error!("CommandAllocatorPool({}): creation failed: {e}", self.queue)
            })?;
        let created = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!(
            "CommandAllocatorPool({}): created {id:?} ({created} total)",
            self.queue
        );
        Ok(CommandAllocator {
            id,
            queue: self.queue,
            last_sync_point: None,
        })
    }

    /// Returns an allocator, unavailable until `sync_point` is reached.
    ///
    /// `sync_point` must cover every submission of lists recorded with the
    /// allocator, typically the one returned by the last `execute_command_list`.
    pub fn release(&self, mut allocator: CommandAllocator, sync_point: SyncPoint) {
        if allocator.queue != self.queue {
            log::error!(
                "CommandAllocatorPool({}): rejected a {} queue allocator",
                self.queue,
                allocator.queue
            );
            self.device.native().destroy_command_allocator(allocator.id);
            return;
        }
        allocator.last_sync_point = Some(sync_point);
        self.free.lock().push_back(allocator);
    }

    /// Destroys every idle allocator whose work has completed.
    ///
    /// Returns the number of destroyed allocators.
    pub fn trim(&self) -> RhiResult<usize> {
        self.fence.refresh_completed_value()?;
        let ready = {
            let mut free = self.free.lock();
            let (ready, busy): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut *free)
                .into_iter()
                .partition(CommandAllocator::is_ready);
            *free = busy;
            ready
        };
        for allocator in &ready {
            self.device.native().destroy_command_allocator(allocator.id);
        }
        if !ready.is_empty() {
            log::debug!(
                "CommandAllocatorPool({}): trimmed {} allocators",
                self.queue,
                ready.len()
            );
        }
        Ok(ready.len())
    }

    /// Allocators created since startup.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Allocators waiting in the pool, ready or not.
    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

impl Drop for CommandAllocatorPool {
    fn drop(&mut self) {
        for allocator in self.free.get_mut().drain(..) {
            self.device.native().destroy_command_allocator(allocator.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{mock_handle, MockDevice};
    use ferrite_core::rhi::RhiSettings;

    fn pool() -> (Arc<MockDevice>, Arc<Fence>, CommandAllocatorPool) {
        let (mock, handle) = mock_handle(RhiSettings::default());
        let fence = Fence::new(handle.clone(), QueueType::Direct).unwrap();
        let pool = CommandAllocatorPool::new(handle, fence.clone());
        (mock, fence, pool)
    }

    #[test]
    fn test_in_flight_allocator_is_not_reused() {
        let (mock, fence, pool) = pool();
        let allocator = pool.obtain().unwrap();
        let id = allocator.id();
        let point = fence.signal().unwrap();
        pool.release(allocator, point.clone());

        let other = pool.obtain().unwrap();
        assert_ne!(other.id(), id);
        assert_eq!(pool.created(), 2);
        assert!(mock.allocator_resets().is_empty());

        mock.complete_fence(fence.id(), point.value());
        let reused = pool.obtain().unwrap();
        assert_eq!(reused.id(), id);
        assert_eq!(mock.allocator_resets(), vec![id]);
    }

    #[test]
    fn test_obtain_refreshes_the_snapshot_for_the_head() {
        let (mock, fence, pool) = pool();
        let allocator = pool.obtain().unwrap();
        let point = fence.signal().unwrap();
        pool.release(allocator, point);

        mock.complete_all();
        assert_eq!(fence.completed_value(), 0);
        pool.obtain().unwrap();
        assert_eq!(fence.completed_value(), 1);
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn test_reset_in_flight_is_an_error() {
        let (_mock, fence, pool) = pool();
        let mut allocator = pool.obtain().unwrap();
        allocator.last_sync_point = Some(fence.signal().unwrap());
        let handle = pool.device.clone();

        let err = allocator.reset(&handle).unwrap_err();
        assert_eq!(
            err,
            RhiError::AllocatorInFlight {
                allocator: allocator.id(),
                required: 1,
                completed: 0,
            }
        );
    }

    #[test]
    fn test_trim_destroys_only_completed_allocators() {
        let (mock, fence, pool) = pool();
        let a = pool.obtain().unwrap();
        let b = pool.obtain().unwrap();
        let first = fence.signal().unwrap();
        let second = fence.signal().unwrap();
        pool.release(a, first.clone());
        pool.release(b, second);

        mock.complete_fence(fence.id(), first.value());
        assert_eq!(pool.trim().unwrap(), 1);
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn test_foreign_queue_allocator_is_rejected() {
        let (_mock, fence, pool) = pool();
        let handle = pool.device.clone();
        let copy_fence = Fence::new(handle.clone(), QueueType::Copy).unwrap();
        let copy_pool = CommandAllocatorPool::new(handle, copy_fence);

        let foreign = copy_pool.obtain().unwrap();
        pool.release(foreign, fence.last_signaled_sync_point());
        assert_eq!(pool.pooled(), 0);
    }
}
