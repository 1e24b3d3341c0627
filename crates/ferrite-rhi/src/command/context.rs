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

//! The recording context.
//!
//! A [`CommandContext`] ties together everything one thread needs to record
//! GPU work: a command allocator and list from its queue's pools, a
//! [`DescriptorCache`] with shader-visible descriptor ranges to upload into,
//! a [`PipelineStateCache`], a barrier batch and a linear upload allocator.
//!
//! Queued barriers are recorded before the bindings of the next draw or
//! dispatch, and before the list is closed.
//!
//! On [`CommandContext::execute`] the list is submitted, and everything the
//! recording retired (online blocks, upload pages) is handed to the deferred
//! deletion queue with the fence value of that submission.

use super::allocator_pool::CommandAllocator;
use super::barriers::ResourceBarrierBatcher;
use super::list_pool::CommandList;
use super::queue::CommandQueue;
use crate::deletion_queue::DeferredDeletionQueue;
use crate::descriptor_cache::{CommitTarget, DescriptorCache, PipelineKind};
use crate::descriptors::{NullDescriptors, OnlineDescriptorManager, ViewRef};
use crate::device::DeviceResources;
use crate::fence::SyncPoint;
use crate::handle::DeviceHandle;
use crate::state_cache::PipelineStateCache;
use crate::upload::{UploadAllocation, UploadAllocator};
use ferrite_core::rhi::{
    DescriptorType, IndexBufferView, NativeCommand, QueueType, ResourceBarrier, ResourceId,
    ResourceState, RhiError, RhiResult, ShaderStage, VertexBufferView,
};
use std::sync::Arc;

/// Alignment of upload ranges used as copy sources.
const COPY_SOURCE_ALIGNMENT: u64 = 16;

/// Per-thread recording state for one queue type.
///
/// The command allocator and list are obtained lazily on the first recorded
/// command and returned to their pools on submission.
#[derive(Debug)]
pub struct CommandContext {
    device: Arc<DeviceHandle>,
    queue: Arc<CommandQueue>,
    deletion_queue: Arc<DeferredDeletionQueue>,
    null_descriptors: Arc<NullDescriptors>,
    resource_descriptors: OnlineDescriptorManager,
    sampler_descriptors: OnlineDescriptorManager,
    upload: UploadAllocator,
    cache: DescriptorCache,
    state: PipelineStateCache,
    barriers: ResourceBarrierBatcher,
    allocator: Option<CommandAllocator>,
    list: Option<CommandList>,
    last_sync_point: Option<SyncPoint>,
}

impl CommandContext {
    pub(crate) fn new(
        device: Arc<DeviceHandle>,
        resources: &DeviceResources,
        queue_type: QueueType,
    ) -> Self {
        Self {
            cache: DescriptorCache::new(device.settings()),
            device,
            queue: resources.queue(queue_type).clone(),
            deletion_queue: resources.deletion_queue.clone(),
            null_descriptors: resources.null_descriptors.clone(),
            resource_descriptors: OnlineDescriptorManager::new(resources.online_resources.clone()),
            sampler_descriptors: OnlineDescriptorManager::new(resources.online_samplers.clone()),
            upload: UploadAllocator::new(resources.upload_pages.clone()),
            state: PipelineStateCache::new(),
            barriers: ResourceBarrierBatcher::new(),
            allocator: None,
            list: None,
            last_sync_point: None,
        }
    }

    /// The queue type the context records for.
    pub fn queue_type(&self) -> QueueType {
        self.queue.queue_type()
    }

    /// The sync point of the last submission of this context.
    pub fn last_sync_point(&self) -> Option<&SyncPoint> {
        self.last_sync_point.as_ref()
    }

    /// Whether a list is open with commands in it, or barriers are queued.
    pub fn has_pending_work(&self) -> bool {
        !self.barriers.is_empty()
            || self
                .list
                .as_ref()
                .is_some_and(|list| list.recorded_command_count() > 0)
    }

    /// The open list, obtaining an allocator and a list if needed.
    pub fn command_list(&mut self) -> RhiResult<&mut CommandList> {
        if self.list.is_none() {
            let allocator = match self.allocator.take() {
                Some(allocator) => allocator,
                None => self.queue.obtain_allocator()?,
            };
            let list = self.queue.obtain_command_list(&allocator);
            self.allocator = Some(allocator);
            self.list = Some(list?);
            self.cache.on_new_command_list();
            self.state.on_new_command_list();
        }
        self.list
            .as_mut()
            .ok_or_else(|| RhiError::exhausted("command context has no command list"))
    }

    /// Records a raw command.
    pub fn record(&mut self, command: NativeCommand) -> RhiResult<()> {
        let device = self.device.clone();
        self.command_list()?.record(&device, command)
    }

    /// See [`DescriptorCache::bind_view`].
    pub fn bind_view(&mut self, stage: ShaderStage, slot: u32, view: &ViewRef) -> RhiResult<()> {
        self.cache.bind_view(stage, slot, view)
    }

    /// See [`DescriptorCache::unbind_view`].
    pub fn unbind_view(
        &mut self,
        stage: ShaderStage,
        ty: DescriptorType,
        slot: u32,
    ) -> RhiResult<()> {
        self.cache.unbind_view(stage, ty, slot)
    }

    /// The descriptor cache.
    pub fn descriptor_cache(&self) -> &DescriptorCache {
        &self.cache
    }

    /// See [`PipelineStateCache::set_render_targets`].
    pub fn set_render_targets(
        &mut self,
        render_targets: &[ViewRef],
        depth_stencil: Option<&ViewRef>,
    ) -> RhiResult<()> {
        self.state.set_render_targets(render_targets, depth_stencil)
    }

    /// See [`PipelineStateCache::set_vertex_buffers`].
    pub fn set_vertex_buffers(
        &mut self,
        start_slot: u32,
        views: &[VertexBufferView],
    ) -> RhiResult<()> {
        self.state.set_vertex_buffers(start_slot, views)
    }

    /// See [`PipelineStateCache::set_index_buffer`].
    pub fn set_index_buffer(&mut self, view: Option<IndexBufferView>) {
        self.state.set_index_buffer(view);
    }

    /// See [`PipelineStateCache::set_shader_constants`].
    pub fn set_shader_constants(&mut self, values: &[u32]) -> RhiResult<()> {
        self.state.set_shader_constants(values)
    }

    /// The input-assembler, output-merger and root constant bindings.
    pub fn pipeline_state(&self) -> &PipelineStateCache {
        &self.state
    }

    /// Queues a state transition of `resource`.
    pub fn transition_barrier(
        &mut self,
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    ) {
        self.barriers.transition(resource, before, after);
    }

    /// Queues an unordered-access barrier on `resource`.
    pub fn unordered_access_barrier(&mut self, resource: ResourceId) {
        self.barriers.unordered_access(resource);
    }

    /// Barriers queued since the last flush.
    pub fn pending_barriers(&self) -> &[ResourceBarrier] {
        self.barriers.pending()
    }

    /// Records the queued barriers now. Returns how many were recorded.
    pub fn flush_barriers(&mut self) -> RhiResult<usize> {
        if self.barriers.is_empty() {
            return Ok(0);
        }
        self.command_list()?;
        let list = self
            .list
            .as_mut()
            .ok_or_else(|| RhiError::exhausted("command context has no command list"))?;
        self.barriers.flush(&self.device, list)
    }

    /// Uploads the dirty descriptor tables of `pipeline` and binds them.
    ///
    /// Queued barriers and dirty non-table bindings are recorded first.
    /// Returns the number of descriptor tables bound.
    ///
    /// When the shader-visible heap runs out of blocks, blocks retired by
    /// completed submissions of this queue are reclaimed and the commit is
    /// retried once.
    pub fn commit_descriptors(&mut self, pipeline: PipelineKind) -> RhiResult<usize> {
        match self.try_commit(pipeline) {
            Err(RhiError::AllocationExhausted { what }) => {
                log::warn!(
                    "CommandContext({}): {what} exhausted, reclaiming completed blocks",
                    self.queue_type()
                );
                let completed = self.queue.fence().refresh_completed_value()?;
                self.deletion_queue.drain(self.queue_type(), completed);
                self.try_commit(pipeline)
            }
            result => result,
        }
    }

    fn try_commit(&mut self, pipeline: PipelineKind) -> RhiResult<usize> {
        self.command_list()?;
        let list = self
            .list
            .as_mut()
            .ok_or_else(|| RhiError::exhausted("command context has no command list"))?;
        self.barriers.flush(&self.device, list)?;
        self.state.commit(pipeline, &self.device, list)?;
        let mut target = CommitTarget {
            device: self.device.as_ref(),
            list,
            resource_descriptors: &mut self.resource_descriptors,
            sampler_descriptors: &mut self.sampler_descriptors,
            null_descriptors: self.null_descriptors.as_ref(),
        };
        self.cache.commit(pipeline, &mut target)
    }

    /// Commits the graphics tables and records a draw.
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) -> RhiResult<()> {
        self.commit_descriptors(PipelineKind::Graphics)?;
        self.record(NativeCommand::Draw {
            vertex_count,
            instance_count,
        })
    }

    /// Commits the compute tables and records a dispatch.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> RhiResult<()> {
        self.commit_descriptors(PipelineKind::Compute)?;
        self.record(NativeCommand::Dispatch { x, y, z })
    }

    /// Allocates transient upload memory valid until this context's next submission completes.
    pub fn linear_allocate(&mut self, size: u64, alignment: u64) -> RhiResult<UploadAllocation> {
        self.upload.allocate(size, alignment)
    }

    /// Stages `data` in upload memory and records a copy into `dst`.
    pub fn upload_to_resource(
        &mut self,
        dst: ResourceId,
        dst_offset: u64,
        data: &[u8],
    ) -> RhiResult<UploadAllocation> {
        let staging = self.upload.allocate(data.len() as u64, COPY_SOURCE_ALIGNMENT)?;
        staging.write(&self.device, data)?;
        self.record(NativeCommand::CopyBufferToResource {
            src: staging.buffer,
            src_offset: staging.offset,
            dst,
            dst_offset,
            size: staging.size,
        })?;
        Ok(staging)
    }

    /// Makes this context's queue wait on the GPU for `sync_point`.
    pub fn wait_for(&self, sync_point: &SyncPoint) -> RhiResult<()> {
        self.queue.wait(sync_point)
    }

    /// Unbinds every view, buffer and render target and drops the root
    /// constants. Queued barriers are kept.
    pub fn clear_state(&mut self) {
        self.cache.clear_state();
        self.state.clear_state();
    }

    /// Submits the recorded work.
    ///
    /// Queued barriers are recorded before the list is closed. Without
    /// recorded work nothing is submitted and the sync point of the last
    /// signal on the queue is returned.
    pub fn execute(&mut self, wait_for_completion: bool) -> RhiResult<SyncPoint> {
        self.flush_barriers()?;
        let Some(mut list) = self.list.take() else {
            let point = self.queue.fence().last_signaled_sync_point();
            if wait_for_completion {
                point.wait()?;
            }
            return Ok(point);
        };

        let submitted = list
            .close(&self.device)
            .and_then(|()| self.queue.execute_command_list(&mut list, false));
        let point = match &submitted {
            Ok(point) => point.clone(),
            Err(_) => self.queue.fence().last_signaled_sync_point(),
        };

        self.queue.release_command_list(list);
        if let Some(allocator) = self.allocator.take() {
            self.queue.release_allocator(allocator, point.clone());
        }
        let queue_type = self.queue_type();
        self.resource_descriptors
            .retire(queue_type, point.value(), &self.deletion_queue);
        self.sampler_descriptors
            .retire(queue_type, point.value(), &self.deletion_queue);
        self.upload
            .retire(queue_type, point.value(), &self.deletion_queue);
        self.cache.on_new_command_list();
        self.state.on_new_command_list();

        let point = submitted?;
        self.last_sync_point = Some(point.clone());
        if wait_for_completion {
            point.wait()?;
        }
        Ok(point)
    }

    /// Submits and blocks until the GPU finished it.
    pub fn flush(&mut self) -> RhiResult<SyncPoint> {
        self.execute(true)
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        let point = self.queue.fence().last_signaled_sync_point();
        if let Some(list) = self.list.take() {
            self.queue.release_command_list(list);
        }
        if let Some(allocator) = self.allocator.take() {
            self.queue.release_allocator(allocator, point.clone());
        }
        let queue_type = self.queue_type();
        self.resource_descriptors
            .release_all(queue_type, point.value(), &self.deletion_queue);
        self.sampler_descriptors
            .release_all(queue_type, point.value(), &self.deletion_queue);
        self.upload
            .release_all(queue_type, point.value(), &self.deletion_queue);
    }
}
