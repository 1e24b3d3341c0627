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

//! Per-draw descriptor binding cache.
//!
//! Views are bound per shader stage and per [`DescriptorType`] into slot
//! tables. On commit, every dirty table is copied in one batch from the
//! offline slots of its views into a fresh range of the shader-visible heap,
//! and the stage's root table is pointed at that range. Unbound slots get
//! the null descriptor of their type.
//!
//! Sampler tables are additionally cached by the identities of the bound
//! samplers, so draws that use the same samplers share one uploaded table.

use crate::command::CommandList;
use crate::descriptors::{NullDescriptors, OnlineDescriptorManager, ViewRef};
use crate::handle::DeviceHandle;
use ferrite_core::rhi::{
    CpuDescriptorHandle, DescriptorType, GpuDescriptorHandle, HeapId, NativeCommand, RhiError,
    RhiResult, RhiSettings, ShaderStage,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Which stages a commit covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    /// Vertex through pixel stages.
    Graphics,
    /// The compute stage.
    Compute,
}

impl PipelineKind {
    /// The stages whose tables the pipeline reads.
    pub fn stages(self) -> &'static [ShaderStage] {
        match self {
            PipelineKind::Graphics => &ShaderStage::GRAPHICS,
            PipelineKind::Compute => &[ShaderStage::Compute],
        }
    }
}

/// Everything a commit writes to.
#[derive(Debug)]
pub struct CommitTarget<'a> {
    /// The device used for descriptor copies.
    pub device: &'a DeviceHandle,
    /// The list receiving heap and table bindings.
    pub list: &'a mut CommandList,
    /// The context's shader-visible resource range allocator.
    pub resource_descriptors: &'a mut OnlineDescriptorManager,
    /// The context's shader-visible sampler range allocator.
    pub sampler_descriptors: &'a mut OnlineDescriptorManager,
    /// Fillers for unbound slots.
    pub null_descriptors: &'a NullDescriptors,
}

#[derive(Debug)]
struct TableBindings {
    slots: Vec<Option<ViewRef>>,
    dirty: bool,
}

fn table_index(stage: ShaderStage, ty: DescriptorType) -> usize {
    stage.index() * DescriptorType::ALL.len() + ty.index()
}

/// Bound views of one recording context.
#[derive(Debug)]
pub struct DescriptorCache {
    tables: Vec<TableBindings>,
    force_rebinding: bool,
    sampler_tables: HashMap<Vec<u64>, GpuDescriptorHandle>,
    sampler_generation: u64,
    bound_heaps: Option<(HeapId, HeapId)>,
}

impl DescriptorCache {
    /// Creates an empty cache with table lengths taken from `settings`.
    pub fn new(settings: &RhiSettings) -> Self {
        let mut tables = Vec::with_capacity(ShaderStage::ALL.len() * DescriptorType::ALL.len());
        for _stage in ShaderStage::ALL {
            for ty in DescriptorType::ALL {
                tables.push(TableBindings {
                    slots: vec![None; settings.table_size(ty) as usize],
                    dirty: true,
                });
            }
        }
        Self {
            tables,
            force_rebinding: settings.force_rebinding,
            sampler_tables: HashMap::new(),
            sampler_generation: 0,
            bound_heaps: None,
        }
    }

    /// Binds `view` to `slot` of the table its type selects.
    ///
    /// The table only becomes dirty if a different view was bound there.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for render target and depth views, which are
    /// not bound through tables, and for a slot outside the table.
    pub fn bind_view(&mut self, stage: ShaderStage, slot: u32, view: &ViewRef) -> RhiResult<()> {
        let ty = view.descriptor_type().ok_or_else(|| {
            RhiError::InvalidArgument(format!(
                "{:?} views cannot be bound to a descriptor table",
                view.desc().heap_kind()
            ))
        })?;
        self.set_slot(stage, ty, slot, Some(view))
    }

    /// Clears `slot` of the `ty` table of `stage`.
    pub fn unbind_view(
        &mut self,
        stage: ShaderStage,
        ty: DescriptorType,
        slot: u32,
    ) -> RhiResult<()> {
        self.set_slot(stage, ty, slot, None)
    }

    fn set_slot(
        &mut self,
        stage: ShaderStage,
        ty: DescriptorType,
        slot: u32,
        view: Option<&ViewRef>,
    ) -> RhiResult<()> {
        let table = &mut self.tables[table_index(stage, ty)];
        let len = table.slots.len();
        let current = table.slots.get_mut(slot as usize).ok_or_else(|| {
            log::error!("DescriptorCache: {stage:?} {ty:?} slot {slot} out of {len}");
            RhiError::InvalidArgument(format!("{ty:?} slot {slot} is outside a table of {len}"))
        })?;

        let unchanged = match (current.as_ref(), view) {
            (Some(bound), Some(new)) => Arc::ptr_eq(bound, new),
            (None, None) => true,
            _ => false,
        };
        if !unchanged {
            *current = view.cloned();
            table.dirty = true;
        }
        Ok(())
    }

    /// The view bound at `slot`, if any.
    pub fn bound_view(
        &self,
        stage: ShaderStage,
        ty: DescriptorType,
        slot: u32,
    ) -> Option<&ViewRef> {
        self.tables[table_index(stage, ty)]
            .slots
            .get(slot as usize)
            .and_then(Option::as_ref)
    }

    /// Whether the table must be uploaded on the next commit.
    pub fn is_dirty(&self, stage: ShaderStage, ty: DescriptorType) -> bool {
        self.tables[table_index(stage, ty)].dirty
    }

    /// Sampler tables currently reusable.
    pub fn cached_sampler_tables(&self) -> usize {
        self.sampler_tables.len()
    }

    /// Forces every table to be uploaded on the next commit.
    pub fn mark_all_dirty(&mut self) {
        for table in &mut self.tables {
            table.dirty = true;
        }
    }

    /// Called when recording moves to a new command list, which starts
    /// without heaps or tables bound.
    pub fn on_new_command_list(&mut self) {
        self.bound_heaps = None;
        self.mark_all_dirty();
    }

    /// Unbinds every view and forgets every uploaded table.
    pub fn clear_state(&mut self) {
        for table in &mut self.tables {
            table.slots.iter_mut().for_each(|slot| *slot = None);
            table.dirty = true;
        }
        self.sampler_tables.clear();
        self.bound_heaps = None;
    }

    /// Uploads every dirty table of the stages `pipeline` reads and records
    /// the bindings into `target.list`.
    ///
    /// Returns the number of tables bound.
    pub fn commit(
        &mut self,
        pipeline: PipelineKind,
        target: &mut CommitTarget<'_>,
    ) -> RhiResult<usize> {
        let heaps = (
            target.resource_descriptors.heap().heap_id(),
            target.sampler_descriptors.heap().heap_id(),
        );
        if self.bound_heaps != Some(heaps) {
            target.list.record(
                target.device,
                NativeCommand::SetDescriptorHeaps {
                    resource: heaps.0,
                    sampler: heaps.1,
                },
            )?;
            self.bound_heaps = Some(heaps);
        }
        self.sync_sampler_generation(target.sampler_descriptors.generation());

        let mut committed = 0;
        for &stage in pipeline.stages() {
            for ty in DescriptorType::ALL {
                let index = table_index(stage, ty);
                if !self.force_rebinding && !self.tables[index].dirty {
                    continue;
                }

                let base = match ty {
                    DescriptorType::Sampler => self.sampler_table(index, target)?,
                    _ => upload_table(
                        &self.tables[index],
                        ty,
                        target.device,
                        target.resource_descriptors,
                        target.null_descriptors,
                    )?,
                };
                target.list.record(
                    target.device,
                    NativeCommand::SetDescriptorTable {
                        stage,
                        table: ty,
                        base,
                    },
                )?;
                self.tables[index].dirty = false;
                committed += 1;
            }
        }
        Ok(committed)
    }

    fn sampler_table(
        &mut self,
        index: usize,
        target: &mut CommitTarget<'_>,
    ) -> RhiResult<GpuDescriptorHandle> {
        let key: Vec<u64> = self.tables[index]
            .slots
            .iter()
            .map(|slot| slot.as_ref().map_or(0, |view| view.id()))
            .collect();
        if let Some(&base) = self.sampler_tables.get(&key) {
            return Ok(base);
        }

        let base = upload_table(
            &self.tables[index],
            DescriptorType::Sampler,
            target.device,
            target.sampler_descriptors,
            target.null_descriptors,
        )?;
        // The upload may have moved to a new block, invalidating older entries.
        self.sync_sampler_generation(target.sampler_descriptors.generation());
        self.sampler_tables.insert(key, base);
        Ok(base)
    }

    fn sync_sampler_generation(&mut self, generation: u64) {
        if self.sampler_generation != generation {
            self.sampler_tables.clear();
            self.sampler_generation = generation;
        }
    }
}

fn upload_table(
    bindings: &TableBindings,
    ty: DescriptorType,
    device: &DeviceHandle,
    manager: &mut OnlineDescriptorManager,
    null_descriptors: &NullDescriptors,
) -> RhiResult<GpuDescriptorHandle> {
    let sources: Vec<CpuDescriptorHandle> = bindings
        .slots
        .iter()
        .map(|slot| {
            slot.as_ref()
                .map_or_else(|| null_descriptors.handle(ty), |view| view.handle())
        })
        .collect();

    let range = manager.allocate(sources.len() as u32)?;
    device.check(
        device
            .native()
            .copy_descriptors(manager.heap().kind(), range.cpu, &sources),
    )?;
    Ok(range.gpu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandAllocatorPool, CommandListPool};
    use crate::descriptors::{OfflineDescriptorHeap, OnlineDescriptorHeap, ResourceView};
    use crate::fence::Fence;
    use crate::mock::{mock_handle, MockDevice};
    use ferrite_core::rhi::{
        BufferId, DescriptorHeapKind, QueueType, ResourceId, SamplerDesc, ViewDesc,
    };

    struct Fixture {
        mock: Arc<MockDevice>,
        handle: Arc<DeviceHandle>,
        resource_heap: Arc<OfflineDescriptorHeap>,
        sampler_heap: Arc<OfflineDescriptorHeap>,
        nulls: NullDescriptors,
        resources: OnlineDescriptorManager,
        samplers: OnlineDescriptorManager,
        list: CommandList,
        _allocators: CommandAllocatorPool,
    }

    impl Fixture {
        fn new(settings: RhiSettings) -> Self {
            let (mock, handle) = mock_handle(settings);
            let resource_heap = Arc::new(OfflineDescriptorHeap::new(
                handle.clone(),
                DescriptorHeapKind::Resource,
            ));
            let sampler_heap = Arc::new(OfflineDescriptorHeap::new(
                handle.clone(),
                DescriptorHeapKind::Sampler,
            ));
            let nulls = NullDescriptors::new(&resource_heap, &sampler_heap).unwrap();
            let online_resources =
                OnlineDescriptorHeap::new(handle.clone(), DescriptorHeapKind::Resource, 256, 4)
                    .unwrap();
            let online_samplers =
                OnlineDescriptorHeap::new(handle.clone(), DescriptorHeapKind::Sampler, 32, 4)
                    .unwrap();

            let fence = Fence::new(handle.clone(), QueueType::Direct).unwrap();
            let allocators = CommandAllocatorPool::new(handle.clone(), fence);
            let lists = CommandListPool::new(handle.clone(), QueueType::Direct);
            let allocator = allocators.obtain().unwrap();
            let list = lists.obtain(&allocator).unwrap();

            Self {
                mock,
                handle,
                resource_heap,
                sampler_heap,
                nulls,
                resources: OnlineDescriptorManager::new(online_resources),
                samplers: OnlineDescriptorManager::new(online_samplers),
                list,
                _allocators: allocators,
            }
        }

        fn commit(&mut self, cache: &mut DescriptorCache, pipeline: PipelineKind) -> usize {
            let mut target = CommitTarget {
                device: &self.handle,
                list: &mut self.list,
                resource_descriptors: &mut self.resources,
                sampler_descriptors: &mut self.samplers,
                null_descriptors: &self.nulls,
            };
            cache.commit(pipeline, &mut target).unwrap()
        }

        fn buffer_view(&self, id: u64) -> ViewRef {
            ResourceView::create(
                &self.resource_heap,
                ViewDesc::ConstantBuffer {
                    buffer: BufferId(id),
                    offset: 0,
                    size: 256,
                },
            )
            .unwrap()
        }

        fn sampler_view(&self, anisotropy: u32) -> ViewRef {
            ResourceView::create(
                &self.sampler_heap,
                ViewDesc::Sampler(SamplerDesc {
                    max_anisotropy: anisotropy,
                    ..Default::default()
                }),
            )
            .unwrap()
        }

        fn table_bases(&self) -> Vec<(ShaderStage, DescriptorType, GpuDescriptorHandle)> {
            self.mock
                .commands(self.list.id())
                .into_iter()
                .filter_map(|command| match command {
                    NativeCommand::SetDescriptorTable { stage, table, base } => {
                        Some((stage, table, base))
                    }
                    _ => None,
                })
                .collect()
        }
    }

    fn cpu_of(base: GpuDescriptorHandle) -> CpuDescriptorHandle {
        CpuDescriptorHandle(base.0 & !(1 << 63))
    }

    #[test]
    fn test_rebinding_same_view_keeps_table_clean() {
        let mut fx = Fixture::new(RhiSettings::default());
        let mut cache = DescriptorCache::new(fx.handle.settings());
        let view = fx.buffer_view(1);

        cache.bind_view(ShaderStage::Pixel, 0, &view).unwrap();
        assert!(cache.is_dirty(ShaderStage::Pixel, DescriptorType::ConstantBuffer));
        fx.commit(&mut cache, PipelineKind::Graphics);
        assert!(!cache.is_dirty(ShaderStage::Pixel, DescriptorType::ConstantBuffer));

        cache.bind_view(ShaderStage::Pixel, 0, &view.clone()).unwrap();
        assert!(!cache.is_dirty(ShaderStage::Pixel, DescriptorType::ConstantBuffer));

        let other = fx.buffer_view(2);
        cache.bind_view(ShaderStage::Pixel, 0, &other).unwrap();
        assert!(cache.is_dirty(ShaderStage::Pixel, DescriptorType::ConstantBuffer));
    }

    #[test]
    fn test_commit_copies_views_and_nulls() {
        let mut fx = Fixture::new(RhiSettings::default());
        let mut cache = DescriptorCache::new(fx.handle.settings());
        let view = fx.buffer_view(7);
        cache.bind_view(ShaderStage::Vertex, 1, &view).unwrap();

        let committed = fx.commit(&mut cache, PipelineKind::Graphics);
        assert_eq!(committed, ShaderStage::GRAPHICS.len() * DescriptorType::ALL.len());

        let commands = fx.mock.commands(fx.list.id());
        assert!(matches!(commands[0], NativeCommand::SetDescriptorHeaps { .. }));

        let (_, _, base) = fx
            .table_bases()
            .into_iter()
            .find(|(stage, ty, _)| {
                *stage == ShaderStage::Vertex && *ty == DescriptorType::ConstantBuffer
            })
            .unwrap();
        let slot0 = cpu_of(base);
        let slot1 = slot0.offset(1, crate::mock::INCREMENT);
        assert_eq!(
            fx.mock.descriptor_at(slot0),
            Some(ViewDesc::Null(DescriptorType::ConstantBuffer))
        );
        assert_eq!(fx.mock.descriptor_at(slot1), Some(view.desc().clone()));
    }

    #[test]
    fn test_clean_tables_are_not_uploaded_again() {
        let mut fx = Fixture::new(RhiSettings::default());
        let mut cache = DescriptorCache::new(fx.handle.settings());
        fx.commit(&mut cache, PipelineKind::Compute);
        let copies = fx.mock.copy_calls();

        assert_eq!(fx.commit(&mut cache, PipelineKind::Compute), 0);
        assert_eq!(fx.mock.copy_calls(), copies);
        let heap_bindings = fx
            .mock
            .commands(fx.list.id())
            .iter()
            .filter(|c| matches!(c, NativeCommand::SetDescriptorHeaps { .. }))
            .count();
        assert_eq!(heap_bindings, 1);
    }

    #[test]
    fn test_force_rebinding_uploads_every_commit() {
        let mut fx = Fixture::new(RhiSettings {
            force_rebinding: true,
            ..Default::default()
        });
        let mut cache = DescriptorCache::new(fx.handle.settings());
        fx.commit(&mut cache, PipelineKind::Compute);
        assert_eq!(
            fx.commit(&mut cache, PipelineKind::Compute),
            DescriptorType::ALL.len()
        );
    }

    #[test]
    fn test_sampler_tables_are_shared_between_draws() {
        let mut fx = Fixture::new(RhiSettings::default());
        let mut cache = DescriptorCache::new(fx.handle.settings());
        let linear = fx.sampler_view(1);
        let aniso = fx.sampler_view(16);

        cache.bind_view(ShaderStage::Compute, 0, &linear).unwrap();
        fx.commit(&mut cache, PipelineKind::Compute);
        let first_cursor = fx.samplers.cursor();

        cache.bind_view(ShaderStage::Compute, 0, &aniso).unwrap();
        fx.commit(&mut cache, PipelineKind::Compute);
        cache.bind_view(ShaderStage::Compute, 0, &linear).unwrap();
        fx.commit(&mut cache, PipelineKind::Compute);

        // Two distinct tables uploaded, the third commit reused the first.
        assert_eq!(fx.samplers.cursor(), first_cursor * 2);
        assert_eq!(cache.cached_sampler_tables(), 2);
        let samplers: Vec<_> = fx
            .table_bases()
            .into_iter()
            .filter(|(_, ty, _)| *ty == DescriptorType::Sampler)
            .map(|(_, _, base)| base)
            .collect();
        assert_eq!(samplers.len(), 3);
        assert_eq!(samplers[0], samplers[2]);
        assert_ne!(samplers[0], samplers[1]);
    }

    #[test]
    fn test_sampler_cache_dropped_on_block_switch() {
        let mut fx = Fixture::new(RhiSettings::default());
        let mut cache = DescriptorCache::new(fx.handle.settings());
        let sampler = fx.sampler_view(4);
        cache.bind_view(ShaderStage::Compute, 0, &sampler).unwrap();
        fx.commit(&mut cache, PipelineKind::Compute);
        assert_eq!(cache.cached_sampler_tables(), 1);

        fx.samplers.realloc().unwrap();
        cache.unbind_view(ShaderStage::Compute, DescriptorType::Sampler, 0)
            .unwrap();
        fx.commit(&mut cache, PipelineKind::Compute);
        assert_eq!(cache.cached_sampler_tables(), 1);
    }

    #[test]
    fn test_invalid_bindings_are_rejected() {
        let fx = Fixture::new(RhiSettings::default());
        let mut cache = DescriptorCache::new(fx.handle.settings());
        let view = fx.buffer_view(1);
        assert!(cache.bind_view(ShaderStage::Pixel, 16, &view).is_err());

        let rtv_heap = Arc::new(OfflineDescriptorHeap::new(
            fx.handle.clone(),
            DescriptorHeapKind::RenderTarget,
        ));
        let rtv = ResourceView::create(
            &rtv_heap,
            ViewDesc::RenderTarget {
                resource: ResourceId(1),
                mip: 0,
            },
        )
        .unwrap();
        assert!(matches!(
            cache.bind_view(ShaderStage::Pixel, 0, &rtv),
            Err(RhiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_clear_state_unbinds_everything() {
        let mut fx = Fixture::new(RhiSettings::default());
        let mut cache = DescriptorCache::new(fx.handle.settings());
        let view = fx.buffer_view(3);
        cache.bind_view(ShaderStage::Hull, 2, &view).unwrap();
        fx.commit(&mut cache, PipelineKind::Graphics);

        cache.clear_state();
        assert!(cache
            .bound_view(ShaderStage::Hull, DescriptorType::ConstantBuffer, 2)
            .is_none());
        assert!(cache.is_dirty(ShaderStage::Hull, DescriptorType::ConstantBuffer));
        assert_eq!(cache.cached_sampler_tables(), 0);
        // Only the cache held the view besides this test.
        assert_eq!(Arc::strong_count(&view), 1);
    }
}
