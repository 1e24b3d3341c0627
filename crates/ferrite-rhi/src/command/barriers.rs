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

//! Batching of resource barriers.
//!
//! Barriers are queued on the recording context and recorded as a single
//! command right before the next operation that depends on them. Redundant
//! barriers are folded while queued.

use super::list_pool::CommandList;
use crate::handle::DeviceHandle;
use ferrite_core::rhi::{NativeCommand, ResourceBarrier, ResourceId, ResourceState, RhiResult};

/// Barriers waiting to be recorded.
#[derive(Debug, Default)]
pub struct ResourceBarrierBatcher {
    barriers: Vec<ResourceBarrier>,
}

impl ResourceBarrierBatcher {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a transition of `resource` from `before` to `after`.
    ///
    /// A no-op transition is dropped. When the last queued barrier on the
    /// resource is a transition, the two are merged into one, and removed
    /// entirely if the merged transition goes back to where it started.
    pub fn transition(
        &mut self,
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    ) {
        if before == after {
            return;
        }

        if let Some(index) = self.last_barrier_on(resource) {
            if let ResourceBarrier::Transition {
                before: queued_before,
                ..
            } = self.barriers[index]
            {
                if queued_before == after {
                    self.barriers.remove(index);
                } else {
                    self.barriers[index] = ResourceBarrier::Transition {
                        resource,
                        before: queued_before,
                        after,
                    };
                }
                return;
            }
        }

        self.barriers.push(ResourceBarrier::Transition {
            resource,
            before,
            after,
        });
    }

    /// Queues an unordered-access barrier on `resource`.
    ///
    /// Skipped if the last queued barrier on the resource is already one.
    pub fn unordered_access(&mut self, resource: ResourceId) {
        let duplicate = self.last_barrier_on(resource).is_some_and(|index| {
            matches!(self.barriers[index], ResourceBarrier::UnorderedAccess { .. })
        });
        if !duplicate {
            self.barriers.push(ResourceBarrier::UnorderedAccess { resource });
        }
    }

    fn last_barrier_on(&self, resource: ResourceId) -> Option<usize> {
        self.barriers
            .iter()
            .rposition(|barrier| barrier.resource() == resource)
    }

    /// The queued barriers, in recording order.
    pub fn pending(&self) -> &[ResourceBarrier] {
        &self.barriers
    }

    /// Number of queued barriers.
    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }

    /// Records every queued barrier into `list` as one command.
    ///
    /// Records nothing when the batch is empty. Returns the number of
    /// barriers recorded.
    pub fn flush(&mut self, device: &DeviceHandle, list: &mut CommandList) -> RhiResult<usize> {
        if self.barriers.is_empty() {
            return Ok(0);
        }
        let barriers = std::mem::take(&mut self.barriers);
        let count = barriers.len();
        list.record(device, NativeCommand::ResourceBarriers(barriers))?;
        Ok(count)
    }

    /// Drops every queued barrier.
    pub fn clear(&mut self) {
        self.barriers.clear();
    }
}
