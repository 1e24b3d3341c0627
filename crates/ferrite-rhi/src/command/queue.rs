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

//! Per-queue-type submission.

use super::allocator_pool::{CommandAllocator, CommandAllocatorPool};
use super::list_pool::{CommandList, CommandListPool, CommandListState};
use crate::fence::{Fence, SyncPoint};
use crate::handle::DeviceHandle;
use ferrite_core::rhi::{CommandListId, QueueStats, QueueType, RhiError, RhiResult};
use parking_lot::Mutex;
use std::sync::Arc;

/// A GPU queue with its fence, allocator pool and list pool.
///
/// Submission and the signal that follows it happen under one lock, so the
/// returned [`SyncPoint`] covers exactly the submitted lists and everything
/// before them on this queue. Device loss is reported after that lock is
/// released, so a removal callback may inspect the queue.
#[derive(Debug)]
pub struct CommandQueue {
    device: Arc<DeviceHandle>,
    queue_type: QueueType,
    fence: Arc<Fence>,
    submit_lock: Mutex<()>,
    allocators: CommandAllocatorPool,
    lists: CommandListPool,
}

impl CommandQueue {
    /// Creates the queue fence and empty pools.
    pub fn new(device: Arc<DeviceHandle>, queue_type: QueueType) -> RhiResult<Self> {
        let fence = Fence::new(device.clone(), queue_type)?;
        Ok(Self {
            allocators: CommandAllocatorPool::new(device.clone(), fence.clone()),
            lists: CommandListPool::new(device.clone(), queue_type),
            device,
            queue_type,
            fence,
            submit_lock: Mutex::new(()),
        })
    }

    /// The queue type.
    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// The queue fence.
    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    /// See [`CommandAllocatorPool::obtain`].
    pub fn obtain_allocator(&self) -> RhiResult<CommandAllocator> {
        self.allocators.obtain()
    }

    /// See [`CommandAllocatorPool::release`].
    pub fn release_allocator(&self, allocator: CommandAllocator, sync_point: SyncPoint) {
        self.allocators.release(allocator, sync_point);
    }

    /// See [`CommandListPool::obtain`].
    pub fn obtain_command_list(&self, allocator: &CommandAllocator) -> RhiResult<CommandList> {
        self.lists.obtain(allocator)
    }

    /// See [`CommandListPool::release`].
    pub fn release_command_list(&self, list: CommandList) {
        self.lists.release(list);
    }

    /// Destroys idle allocators whose work has completed.
    pub fn trim(&self) -> RhiResult<usize> {
        self.allocators.trim()
    }

    /// Submits a closed list and signals the queue fence.
    ///
    /// With `wait_for_completion` the call blocks until the GPU reached the
    /// returned sync point.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the list is `Closed`.
    pub fn execute_command_list(
        &self,
        list: &mut CommandList,
        wait_for_completion: bool,
    ) -> RhiResult<SyncPoint> {
        self.execute_command_lists(std::slice::from_mut(list), wait_for_completion)
    }

    /// Submits several closed lists in order, followed by a single signal.
    pub fn execute_command_lists(
        &self,
        lists: &mut [CommandList],
        wait_for_completion: bool,
    ) -> RhiResult<SyncPoint> {
        let mut ids: Vec<CommandListId> = Vec::with_capacity(lists.len());
        for list in lists.iter() {
            if list.queue() != self.queue_type {
                return Err(RhiError::InvalidArgument(format!(
                    "{} queue list submitted to the {} queue",
                    list.queue(),
                    self.queue_type
                )));
            }
            list.expect(CommandListState::Closed)?;
            ids.push(list.id());
        }

        let submitted = {
            let _submit = self.submit_lock.lock();
            self.device
                .native()
                .execute_command_lists(self.queue_type, &ids)
                .and_then(|()| self.fence.enqueue_signal())
        };
        let point = self.device.check(submitted)?;
        for list in lists.iter_mut() {
            list.mark_submitted();
        }
        log::trace!(
            "CommandQueue({}): submitted {} lists, fence value {}",
            self.queue_type,
            ids.len(),
            point.value()
        );

        if wait_for_completion {
            point.wait()?;
        }
        Ok(point)
    }

    /// Signals the queue fence after all work submitted so far.
    pub fn signal(&self) -> RhiResult<SyncPoint> {
        let signaled = {
            let _submit = self.submit_lock.lock();
            self.fence.enqueue_signal()
        };
        self.device.check(signaled)
    }

    /// Makes this queue wait on the GPU for `sync_point` before running later work.
    ///
    /// Skipped when the point is already complete or belongs to this queue's
    /// own fence, which the queue reaches in order anyway.
    pub fn wait(&self, sync_point: &SyncPoint) -> RhiResult<()> {
        if Arc::ptr_eq(sync_point.fence(), &self.fence) || sync_point.is_complete() {
            return Ok(());
        }
        let enqueued = {
            let _submit = self.submit_lock.lock();
            self.device.native().queue_wait(
                self.queue_type,
                sync_point.fence().id(),
                sync_point.value(),
            )
        };
        self.device.check(enqueued)?;
        log::trace!(
            "CommandQueue({}): waits for {} queue value {}",
            self.queue_type,
            sync_point.queue(),
            sync_point.value()
        );
        Ok(())
    }

    /// Signals and blocks until the GPU finished everything submitted so far.
    pub fn flush(&self) -> RhiResult<SyncPoint> {
        let point = self.signal()?;
        point.wait()?;
        Ok(point)
    }

    /// A snapshot of the queue and its pools.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queue: self.queue_type,
            last_signaled: self.fence.last_signaled_value(),
            completed: self.fence.completed_value(),
            allocators_created: self.allocators.created(),
            allocators_pooled: self.allocators.pooled(),
            lists_created: self.lists.created(),
            lists_pooled: self.lists.pooled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::mock_handle;
    use ferrite_core::rhi::{NativeCommand, RhiSettings};

    #[test]
    fn test_allocator_reuse_waits_for_submission() {
        let (mock, handle) = mock_handle(RhiSettings::default());
        let queue = CommandQueue::new(handle.clone(), QueueType::Direct).unwrap();

        let allocator = queue.obtain_allocator().unwrap();
        let allocator_id = allocator.id();
        let mut list = queue.obtain_command_list(&allocator).unwrap();
        for i in 0..5 {
            list.record(&handle, NativeCommand::Marker(format!("cmd {i}")))
                .unwrap();
        }
        list.close(&handle).unwrap();

        let point = queue.execute_command_list(&mut list, false).unwrap();
        assert_eq!(point.value(), 1);
        assert_eq!(list.state(), CommandListState::Submitted);
        assert_eq!(mock.executed_lists(), 1);
        queue.release_command_list(list);
        queue.release_allocator(allocator, point.clone());

        let busy = queue.obtain_allocator().unwrap();
        assert_ne!(busy.id(), allocator_id);
        queue.release_allocator(busy, point.clone());

        mock.complete_fence(queue.fence().id(), point.value());
        let reused = queue.obtain_allocator().unwrap();
        assert_eq!(reused.id(), allocator_id);
        assert_eq!(mock.allocator_resets(), vec![allocator_id]);
    }

    #[test]
    fn test_execute_requires_closed_list() {
        let (_mock, handle) = mock_handle(RhiSettings::default());
        let queue = CommandQueue::new(handle, QueueType::Compute).unwrap();
        let allocator = queue.obtain_allocator().unwrap();
        let mut list = queue.obtain_command_list(&allocator).unwrap();

        assert!(matches!(
            queue.execute_command_list(&mut list, false),
            Err(RhiError::InvalidState { .. })
        ));
        assert_eq!(queue.fence().last_signaled_value(), 0);
    }

    #[test]
    fn test_execute_with_wait_completes() {
        let (_mock, handle) = mock_handle(RhiSettings::default());
        let queue = CommandQueue::new(handle.clone(), QueueType::Copy).unwrap();
        let allocator = queue.obtain_allocator().unwrap();
        let mut list = queue.obtain_command_list(&allocator).unwrap();
        list.close(&handle).unwrap();

        let point = queue.execute_command_list(&mut list, true).unwrap();
        assert!(point.is_complete());
        assert_eq!(queue.stats().completed, 1);
    }

    #[test]
    fn test_wait_skips_own_and_completed_points() {
        let (mock, handle) = mock_handle(RhiSettings::default());
        let direct = CommandQueue::new(handle.clone(), QueueType::Direct).unwrap();
        let copy = CommandQueue::new(handle, QueueType::Copy).unwrap();

        let own = direct.signal().unwrap();
        direct.wait(&own).unwrap();

        let upload = copy.signal().unwrap();
        direct.wait(&upload).unwrap();

        mock.complete_all();
        copy.fence().refresh_completed_value().unwrap();
        direct.wait(&upload).unwrap();
    }

    #[test]
    fn test_stats_track_pools() {
        let (_mock, handle) = mock_handle(RhiSettings::default());
        let queue = CommandQueue::new(handle, QueueType::Direct).unwrap();
        let allocator = queue.obtain_allocator().unwrap();
        let list = queue.obtain_command_list(&allocator).unwrap();
        queue.release_command_list(list);
        let point = queue.flush().unwrap();
        queue.release_allocator(allocator, point);

        let stats = queue.stats();
        assert_eq!(stats.allocators_created, 1);
        assert_eq!(stats.allocators_pooled, 1);
        assert_eq!(stats.lists_pooled, 1);
        assert_eq!(stats.last_signaled, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(queue.trim().unwrap(), 1);
    }
}
