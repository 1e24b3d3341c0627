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

//! Input-assembler, output-merger and root constant bindings.
//!
//! These bindings are not made through descriptor tables: vertex and index
//! buffers are set by value, render targets by the offline handle of their
//! view, and root constants by value. Each group is dirty-tracked on its own
//! and recorded on the next commit of a pipeline that reads it.

use crate::command::CommandList;
use crate::descriptor_cache::PipelineKind;
use crate::descriptors::ViewRef;
use crate::handle::DeviceHandle;
use ferrite_core::rhi::{
    DescriptorHeapKind, IndexBufferView, NativeCommand, RhiError, RhiResult, VertexBufferView,
    MAX_RENDER_TARGETS, MAX_SHADER_CONSTANTS, MAX_VERTEX_BUFFER_SLOTS,
};
use std::sync::Arc;

fn pipeline_index(pipeline: PipelineKind) -> usize {
    match pipeline {
        PipelineKind::Graphics => 0,
        PipelineKind::Compute => 1,
    }
}

#[derive(Debug)]
struct VertexBufferCache {
    slots: Vec<Option<VertexBufferView>>,
    /// Slots up to the highest bound one.
    bound: usize,
    /// Slots the open list has bound.
    recorded: usize,
    dirty: bool,
}

#[derive(Debug, Default)]
struct IndexBufferCache {
    view: Option<IndexBufferView>,
    recorded: bool,
    dirty: bool,
}

#[derive(Debug, Default)]
struct RenderTargetCache {
    render_targets: Vec<ViewRef>,
    depth_stencil: Option<ViewRef>,
    recorded: bool,
    dirty: bool,
}

impl RenderTargetCache {
    fn is_empty(&self) -> bool {
        self.render_targets.is_empty() && self.depth_stencil.is_none()
    }
}

#[derive(Debug, Default)]
struct ShaderConstantsCache {
    values: Vec<u32>,
    dirty: [bool; 2],
}

/// Non-table bindings of one recording context.
#[derive(Debug)]
pub struct PipelineStateCache {
    vertex_buffers: VertexBufferCache,
    index_buffer: IndexBufferCache,
    render_targets: RenderTargetCache,
    constants: ShaderConstantsCache,
}

impl Default for PipelineStateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStateCache {
    /// Creates a cache with nothing bound.
    pub fn new() -> Self {
        Self {
            vertex_buffers: VertexBufferCache {
                slots: vec![None; MAX_VERTEX_BUFFER_SLOTS as usize],
                bound: 0,
                recorded: 0,
                dirty: false,
            },
            index_buffer: IndexBufferCache::default(),
            render_targets: RenderTargetCache::default(),
            constants: ShaderConstantsCache::default(),
        }
    }

    /// Binds `views` to consecutive vertex buffer slots from `start_slot`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the last slot is past
    /// [`MAX_VERTEX_BUFFER_SLOTS`]. Nothing is bound in that case.
    pub fn set_vertex_buffers(
        &mut self,
        start_slot: u32,
        views: &[VertexBufferView],
    ) -> RhiResult<()> {
        let end = start_slot as usize + views.len();
        if end > MAX_VERTEX_BUFFER_SLOTS as usize {
            log::error!("PipelineStateCache: vertex buffer slots {start_slot}..{end} out of range");
            return Err(RhiError::InvalidArgument(format!(
                "vertex buffer slots {start_slot}..{end} exceed the {MAX_VERTEX_BUFFER_SLOTS} slots"
            )));
        }

        let cache = &mut self.vertex_buffers;
        for (slot, view) in cache.slots[start_slot as usize..end].iter_mut().zip(views) {
            if *slot != Some(*view) {
                *slot = Some(*view);
                cache.dirty = true;
            }
        }
        cache.bound = cache.bound.max(end);
        Ok(())
    }

    /// The vertex buffer bound at `slot`, if any.
    pub fn vertex_buffer(&self, slot: u32) -> Option<VertexBufferView> {
        self.vertex_buffers
            .slots
            .get(slot as usize)
            .copied()
            .flatten()
    }

    /// Binds or unbinds the index buffer.
    pub fn set_index_buffer(&mut self, view: Option<IndexBufferView>) {
        let cache = &mut self.index_buffer;
        if cache.view != view {
            cache.view = view;
            cache.dirty = true;
        }
    }

    /// The bound index buffer.
    pub fn index_buffer(&self) -> Option<IndexBufferView> {
        self.index_buffer.view
    }

    /// Replaces the bound render targets and depth-stencil view.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for more than [`MAX_RENDER_TARGETS`] targets,
    /// or for views that were not created in the render target and
    /// depth-stencil heaps respectively.
    pub fn set_render_targets(
        &mut self,
        render_targets: &[ViewRef],
        depth_stencil: Option<&ViewRef>,
    ) -> RhiResult<()> {
        if render_targets.len() > MAX_RENDER_TARGETS as usize {
            return Err(RhiError::InvalidArgument(format!(
                "{} render targets exceed the maximum of {MAX_RENDER_TARGETS}",
                render_targets.len()
            )));
        }
        let expect_kind = |view: &ViewRef, kind: DescriptorHeapKind| {
            let actual = view.desc().heap_kind();
            if actual == kind {
                Ok(())
            } else {
                Err(RhiError::InvalidArgument(format!(
                    "a {actual:?} view cannot be bound as {kind:?}"
                )))
            }
        };
        for view in render_targets {
            expect_kind(view, DescriptorHeapKind::RenderTarget)?;
        }
        if let Some(view) = depth_stencil {
            expect_kind(view, DescriptorHeapKind::DepthStencil)?;
        }

        let cache = &mut self.render_targets;
        let unchanged = cache.render_targets.len() == render_targets.len()
            && cache
                .render_targets
                .iter()
                .zip(render_targets)
                .all(|(bound, new)| Arc::ptr_eq(bound, new))
            && match (&cache.depth_stencil, depth_stencil) {
                (Some(bound), Some(new)) => Arc::ptr_eq(bound, new),
                (None, None) => true,
                _ => false,
            };
        if !unchanged {
            cache.render_targets = render_targets.to_vec();
            cache.depth_stencil = depth_stencil.cloned();
            cache.dirty = true;
        }
        Ok(())
    }

    /// Number of bound render targets.
    pub fn render_target_count(&self) -> usize {
        self.render_targets.render_targets.len()
    }

    /// The bound depth-stencil view.
    pub fn depth_stencil(&self) -> Option<&ViewRef> {
        self.render_targets.depth_stencil.as_ref()
    }

    /// Replaces the 32-bit root constants read by both pipelines.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for more than [`MAX_SHADER_CONSTANTS`] values.
    pub fn set_shader_constants(&mut self, values: &[u32]) -> RhiResult<()> {
        if values.len() > MAX_SHADER_CONSTANTS as usize {
            return Err(RhiError::InvalidArgument(format!(
                "{} shader constants exceed the maximum of {MAX_SHADER_CONSTANTS}",
                values.len()
            )));
        }
        let cache = &mut self.constants;
        if cache.values != values {
            cache.values = values.to_vec();
            cache.dirty = [true; 2];
        }
        Ok(())
    }

    /// The bound root constants.
    pub fn shader_constants(&self) -> &[u32] {
        &self.constants.values
    }

    /// Whether the next commit of `pipeline` records anything.
    pub fn is_dirty(&self, pipeline: PipelineKind) -> bool {
        let constants = self.constants.dirty[pipeline_index(pipeline)];
        match pipeline {
            PipelineKind::Graphics => {
                constants
                    || self.vertex_buffers.dirty
                    || self.index_buffer.dirty
                    || self.render_targets.dirty
            }
            PipelineKind::Compute => constants,
        }
    }

    /// Called when recording moves to a new command list, which starts
    /// with nothing bound.
    pub fn on_new_command_list(&mut self) {
        let vertex = &mut self.vertex_buffers;
        vertex.recorded = 0;
        vertex.dirty = vertex.bound > 0;

        let index = &mut self.index_buffer;
        index.recorded = false;
        index.dirty = index.view.is_some();

        let targets = &mut self.render_targets;
        targets.recorded = false;
        targets.dirty = !targets.is_empty();

        let constants = &mut self.constants;
        constants.dirty = [!constants.values.is_empty(); 2];
    }

    /// Unbinds everything. What the open list has bound is unbound on the
    /// next commit.
    pub fn clear_state(&mut self) {
        let vertex = &mut self.vertex_buffers;
        vertex.slots.iter_mut().for_each(|slot| *slot = None);
        vertex.bound = 0;
        vertex.dirty = vertex.recorded > 0;

        let index = &mut self.index_buffer;
        index.view = None;
        index.dirty = index.recorded;

        let targets = &mut self.render_targets;
        targets.render_targets.clear();
        targets.depth_stencil = None;
        targets.dirty = targets.recorded;

        self.constants = ShaderConstantsCache::default();
    }

    /// Records every dirty group `pipeline` reads into `list`.
    ///
    /// Returns the number of commands recorded.
    pub fn commit(
        &mut self,
        pipeline: PipelineKind,
        device: &DeviceHandle,
        list: &mut CommandList,
    ) -> RhiResult<usize> {
        let mut recorded = 0;
        if pipeline == PipelineKind::Graphics {
            let vertex = &mut self.vertex_buffers;
            if vertex.dirty {
                let len = vertex.bound.max(vertex.recorded);
                list.record(
                    device,
                    NativeCommand::SetVertexBuffers {
                        start_slot: 0,
                        views: vertex.slots[..len].to_vec(),
                    },
                )?;
                vertex.recorded = vertex.bound;
                vertex.dirty = false;
                recorded += 1;
            }

            let index = &mut self.index_buffer;
            if index.dirty {
                list.record(device, NativeCommand::SetIndexBuffer(index.view))?;
                index.recorded = index.view.is_some();
                index.dirty = false;
                recorded += 1;
            }

            let targets = &mut self.render_targets;
            if targets.dirty {
                list.record(
                    device,
                    NativeCommand::SetRenderTargets {
                        render_targets: targets.render_targets.iter().map(|v| v.handle()).collect(),
                        depth_stencil: targets.depth_stencil.as_ref().map(|v| v.handle()),
                    },
                )?;
                targets.recorded = !targets.is_empty();
                targets.dirty = false;
                recorded += 1;
            }
        }

        let constants = &mut self.constants;
        let index = pipeline_index(pipeline);
        if constants.dirty[index] {
            if !constants.values.is_empty() {
                list.record(
                    device,
                    NativeCommand::SetRootConstants {
                        compute: pipeline == PipelineKind::Compute,
                        values: constants.values.clone(),
                    },
                )?;
                recorded += 1;
            }
            constants.dirty[index] = false;
        }
        Ok(recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandAllocatorPool, CommandListPool};
    use crate::descriptors::{OfflineDescriptorHeap, ResourceView};
    use crate::fence::Fence;
    use crate::mock::{mock_handle, MockDevice};
    use ferrite_core::rhi::{BufferId, IndexFormat, QueueType, ResourceId, RhiSettings, ViewDesc};

    struct Fixture {
        mock: Arc<MockDevice>,
        handle: Arc<DeviceHandle>,
        lists: CommandListPool,
        allocators: CommandAllocatorPool,
        list: CommandList,
    }

    impl Fixture {
        fn new() -> Self {
            let (mock, handle) = mock_handle(RhiSettings::default());
            let fence = Fence::new(handle.clone(), QueueType::Direct).unwrap();
            let allocators = CommandAllocatorPool::new(handle.clone(), fence);
            let lists = CommandListPool::new(handle.clone(), QueueType::Direct);
            let allocator = allocators.obtain().unwrap();
            let list = lists.obtain(&allocator).unwrap();
            Self {
                mock,
                handle,
                lists,
                allocators,
                list,
            }
        }

        fn commit(&mut self, cache: &mut PipelineStateCache, pipeline: PipelineKind) -> usize {
            cache.commit(pipeline, &self.handle, &mut self.list).unwrap()
        }

        fn commands(&self) -> Vec<NativeCommand> {
            self.mock.commands(self.list.id())
        }

        fn next_list(&mut self) {
            let allocator = self.allocators.obtain().unwrap();
            self.list = self.lists.obtain(&allocator).unwrap();
        }
    }

    fn vertices(buffer: u64) -> VertexBufferView {
        VertexBufferView {
            buffer: BufferId(buffer),
            offset: 0,
            size: 1024,
            stride: 32,
        }
    }

    fn target_heaps(handle: &Arc<DeviceHandle>) -> [Arc<OfflineDescriptorHeap>; 2] {
        [
            Arc::new(OfflineDescriptorHeap::new(
                handle.clone(),
                DescriptorHeapKind::RenderTarget,
            )),
            Arc::new(OfflineDescriptorHeap::new(
                handle.clone(),
                DescriptorHeapKind::DepthStencil,
            )),
        ]
    }

    #[test]
    fn test_vertex_buffers_record_up_to_highest_slot() {
        let mut fx = Fixture::new();
        let mut cache = PipelineStateCache::new();
        cache.set_vertex_buffers(2, &[vertices(1)]).unwrap();

        assert_eq!(fx.commit(&mut cache, PipelineKind::Graphics), 1);
        assert_eq!(
            fx.commands(),
            vec![NativeCommand::SetVertexBuffers {
                start_slot: 0,
                views: vec![None, None, Some(vertices(1))],
            }]
        );

        // Same views again: nothing to record.
        cache.set_vertex_buffers(2, &[vertices(1)]).unwrap();
        assert!(!cache.is_dirty(PipelineKind::Graphics));
        assert_eq!(fx.commit(&mut cache, PipelineKind::Graphics), 0);
    }

    #[test]
    fn test_vertex_slots_past_the_limit_are_rejected() {
        let mut cache = PipelineStateCache::new();
        let views = [vertices(1), vertices(2)];
        let err = cache
            .set_vertex_buffers(MAX_VERTEX_BUFFER_SLOTS - 1, &views)
            .unwrap_err();
        assert!(matches!(err, RhiError::InvalidArgument(_)));
        assert_eq!(cache.vertex_buffer(MAX_VERTEX_BUFFER_SLOTS - 1), None);
        assert!(!cache.is_dirty(PipelineKind::Graphics));
    }

    #[test]
    fn test_index_buffer_changes_are_tracked() {
        let mut fx = Fixture::new();
        let mut cache = PipelineStateCache::new();
        let indices = IndexBufferView {
            buffer: BufferId(4),
            offset: 64,
            size: 600,
            format: IndexFormat::Uint16,
        };
        cache.set_index_buffer(Some(indices));
        fx.commit(&mut cache, PipelineKind::Graphics);
        cache.set_index_buffer(Some(indices));
        assert_eq!(fx.commit(&mut cache, PipelineKind::Graphics), 0);
        cache.set_index_buffer(None);
        fx.commit(&mut cache, PipelineKind::Graphics);

        assert_eq!(
            fx.commands(),
            vec![
                NativeCommand::SetIndexBuffer(Some(indices)),
                NativeCommand::SetIndexBuffer(None),
            ]
        );
    }

    #[test]
    fn test_render_targets_record_offline_handles() {
        let mut fx = Fixture::new();
        let [rtv_heap, dsv_heap] = target_heaps(&fx.handle);
        let color = ResourceView::create(
            &rtv_heap,
            ViewDesc::RenderTarget {
                resource: ResourceId(1),
                mip: 0,
            },
        )
        .unwrap();
        let depth = ResourceView::create(
            &dsv_heap,
            ViewDesc::DepthStencil {
                resource: ResourceId(2),
                read_only: false,
            },
        )
        .unwrap();

        let mut cache = PipelineStateCache::new();
        cache
            .set_render_targets(&[color.clone()], Some(&depth))
            .unwrap();
        assert_eq!(fx.commit(&mut cache, PipelineKind::Graphics), 1);
        assert_eq!(
            fx.commands(),
            vec![NativeCommand::SetRenderTargets {
                render_targets: vec![color.handle()],
                depth_stencil: Some(depth.handle()),
            }]
        );

        cache
            .set_render_targets(&[color.clone()], Some(&depth))
            .unwrap();
        assert!(!cache.is_dirty(PipelineKind::Graphics));
        // The cache keeps its views alive while they are bound.
        assert_eq!(Arc::strong_count(&color), 2);
    }

    #[test]
    fn test_render_target_kinds_are_checked() {
        let fx = Fixture::new();
        let [rtv_heap, dsv_heap] = target_heaps(&fx.handle);
        let color = ResourceView::create(
            &rtv_heap,
            ViewDesc::RenderTarget {
                resource: ResourceId(1),
                mip: 0,
            },
        )
        .unwrap();
        let depth = ResourceView::create(
            &dsv_heap,
            ViewDesc::DepthStencil {
                resource: ResourceId(2),
                read_only: true,
            },
        )
        .unwrap();

        let mut cache = PipelineStateCache::new();
        assert!(cache.set_render_targets(&[depth.clone()], None).is_err());
        assert!(cache.set_render_targets(&[], Some(&color)).is_err());
        let too_many = vec![color.clone(); MAX_RENDER_TARGETS as usize + 1];
        assert!(cache.set_render_targets(&too_many, None).is_err());
        assert_eq!(cache.render_target_count(), 0);
        assert!(cache.depth_stencil().is_none());
    }

    #[test]
    fn test_constants_are_committed_once_per_pipeline() {
        let mut fx = Fixture::new();
        let mut cache = PipelineStateCache::new();
        cache.set_shader_constants(&[1, 2, 3]).unwrap();

        assert_eq!(fx.commit(&mut cache, PipelineKind::Compute), 1);
        assert_eq!(fx.commit(&mut cache, PipelineKind::Compute), 0);
        assert!(cache.is_dirty(PipelineKind::Graphics));
        assert_eq!(fx.commit(&mut cache, PipelineKind::Graphics), 1);

        assert_eq!(
            fx.commands(),
            vec![
                NativeCommand::SetRootConstants {
                    compute: true,
                    values: vec![1, 2, 3],
                },
                NativeCommand::SetRootConstants {
                    compute: false,
                    values: vec![1, 2, 3],
                },
            ]
        );
        let too_many = vec![0; MAX_SHADER_CONSTANTS as usize + 1];
        assert!(cache.set_shader_constants(&too_many).is_err());
        assert_eq!(cache.shader_constants(), &[1, 2, 3]);
    }

    #[test]
    fn test_new_command_list_rebinds_bound_state() {
        let mut fx = Fixture::new();
        let mut cache = PipelineStateCache::new();
        cache.set_vertex_buffers(0, &[vertices(7)]).unwrap();
        cache.set_shader_constants(&[9]).unwrap();
        fx.commit(&mut cache, PipelineKind::Graphics);

        fx.next_list();
        cache.on_new_command_list();
        assert!(cache.is_dirty(PipelineKind::Graphics));
        // Vertex buffers and constants, nothing for the unbound groups.
        assert_eq!(fx.commit(&mut cache, PipelineKind::Graphics), 2);
    }

    #[test]
    fn test_fresh_list_with_nothing_bound_records_nothing() {
        let mut fx = Fixture::new();
        let mut cache = PipelineStateCache::new();
        cache.on_new_command_list();
        assert!(!cache.is_dirty(PipelineKind::Graphics));
        assert_eq!(fx.commit(&mut cache, PipelineKind::Graphics), 0);
        assert!(fx.commands().is_empty());
    }

    #[test]
    fn test_clear_state_unbinds_what_the_list_holds() {
        let mut fx = Fixture::new();
        let mut cache = PipelineStateCache::new();
        cache.set_vertex_buffers(0, &[vertices(1), vertices(2)]).unwrap();
        fx.commit(&mut cache, PipelineKind::Graphics);

        cache.clear_state();
        assert_eq!(cache.vertex_buffer(0), None);
        assert_eq!(fx.commit(&mut cache, PipelineKind::Graphics), 1);
        assert_eq!(
            fx.commands().last(),
            Some(&NativeCommand::SetVertexBuffers {
                start_slot: 0,
                views: vec![None, None],
            })
        );

        // A cleared cache on a new list has nothing to unbind.
        fx.next_list();
        cache.on_new_command_list();
        assert_eq!(fx.commit(&mut cache, PipelineKind::Graphics), 0);
    }
}
