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

//! The RHI device: owner of every queue, pool and heap.

use crate::command::{CommandAllocator, CommandContext, CommandList, CommandQueue};
use crate::deletion_queue::{DeferredDeletionQueue, DeferredPayload};
use crate::descriptors::{
    NullDescriptors, OfflineDescriptor, OfflineDescriptorHeap, OnlineDescriptorHeap, ResourceView,
    ViewRef,
};
use crate::fence::SyncPoint;
use crate::handle::{DeviceHandle, DeviceRemovedCallback};
use crate::upload::UploadPagePool;
use ferrite_core::rhi::{
    DescriptorHeapKind, NativeDevice, QueueType, RhiError, RhiResult, RhiSettings, RhiStats,
    SamplerDesc, ViewDesc,
};
use std::sync::Arc;

/// Everything rebuilt when the device is recreated.
#[derive(Debug)]
pub(crate) struct DeviceResources {
    pub(crate) queues: Vec<Arc<CommandQueue>>,
    pub(crate) offline_heaps: Vec<Arc<OfflineDescriptorHeap>>,
    pub(crate) online_resources: Arc<OnlineDescriptorHeap>,
    pub(crate) online_samplers: Arc<OnlineDescriptorHeap>,
    pub(crate) upload_pages: Arc<UploadPagePool>,
    pub(crate) deletion_queue: Arc<DeferredDeletionQueue>,
    pub(crate) null_descriptors: Arc<NullDescriptors>,
}

impl DeviceResources {
    fn new(handle: &Arc<DeviceHandle>) -> RhiResult<Self> {
        let settings = handle.settings();
        let queues = QueueType::ALL
            .iter()
            .map(|&queue| CommandQueue::new(handle.clone(), queue).map(Arc::new))
            .collect::<RhiResult<Vec<_>>>()?;
        let offline_heaps: Vec<_> = DescriptorHeapKind::ALL
            .iter()
            .map(|&kind| Arc::new(OfflineDescriptorHeap::new(handle.clone(), kind)))
            .collect();
        let online_resources = OnlineDescriptorHeap::new(
            handle.clone(),
            DescriptorHeapKind::Resource,
            settings.online_resource_block_size,
            settings.online_resource_block_count,
        )?;
        let online_samplers = OnlineDescriptorHeap::new(
            handle.clone(),
            DescriptorHeapKind::Sampler,
            settings.online_sampler_block_size,
            settings.online_sampler_block_count,
        )?;
        let null_descriptors = NullDescriptors::new(
            &offline_heaps[DescriptorHeapKind::Resource.index()],
            &offline_heaps[DescriptorHeapKind::Sampler.index()],
        )?;

        Ok(Self {
            queues,
            offline_heaps,
            online_resources,
            online_samplers,
            upload_pages: UploadPagePool::new(handle.clone()),
            deletion_queue: Arc::new(DeferredDeletionQueue::new()),
            null_descriptors: Arc::new(null_descriptors),
        })
    }

    pub(crate) fn queue(&self, queue: QueueType) -> &Arc<CommandQueue> {
        &self.queues[queue.index()]
    }

    fn offline_heap(&self, kind: DescriptorHeapKind) -> &Arc<OfflineDescriptorHeap> {
        &self.offline_heaps[kind.index()]
    }
}

/// The command-submission and descriptor manager of one GPU.
///
/// Shared pools and heaps are internally synchronized, so the device is
/// used through `&self` from any number of threads. Each recording thread
/// works through its own [`CommandContext`].
#[derive(Debug)]
pub struct RhiDevice {
    handle: Arc<DeviceHandle>,
    resources: DeviceResources,
}

impl RhiDevice {
    /// Builds every queue, pool and heap on top of `native`.
    ///
    /// # Errors
    ///
    /// Fails on invalid settings and when a fence or a native heap cannot be
    /// created. The device is unusable in that case.
    pub fn new(native: Arc<dyn NativeDevice>, settings: RhiSettings) -> RhiResult<Self> {
        settings.validate()?;
        let handle = DeviceHandle::new(native, settings);
        let resources = DeviceResources::new(&handle)
            .inspect_err(|e| log::error!("RhiDevice: initialization failed: {e}"))?;
        log::info!(
            "RhiDevice: ready with {} queues, {} resource blocks and {} sampler blocks",
            resources.queues.len(),
            resources.online_resources.block_count(),
            resources.online_samplers.block_count()
        );
        Ok(Self { handle, resources })
    }

    /// The shared device handle.
    pub fn handle(&self) -> &Arc<DeviceHandle> {
        &self.handle
    }

    /// The settings every pool was sized with.
    pub fn settings(&self) -> &RhiSettings {
        self.handle.settings()
    }

    /// A recording context for `queue`.
    ///
    /// Contexts keep the pools they were created from alive; drop them before
    /// calling [`recreate`](Self::recreate).
    pub fn create_context(&self, queue: QueueType) -> CommandContext {
        CommandContext::new(self.handle.clone(), &self.resources, queue)
    }

    /// The submission queue of `queue`.
    pub fn queue(&self, queue: QueueType) -> &Arc<CommandQueue> {
        self.resources.queue(queue)
    }

    /// Obtains a reset command allocator for `queue`.
    pub fn obtain_allocator(&self, queue: QueueType) -> RhiResult<CommandAllocator> {
        self.queue(queue).obtain_allocator()
    }

    /// Returns an allocator that stays unavailable until `sync_point` completes.
    pub fn release_allocator(&self, allocator: CommandAllocator, sync_point: SyncPoint) {
        self.queue(allocator.queue())
            .release_allocator(allocator, sync_point);
    }

    /// Obtains a list recording into `allocator`.
    pub fn obtain_command_list(&self, allocator: &CommandAllocator) -> RhiResult<CommandList> {
        self.queue(allocator.queue()).obtain_command_list(allocator)
    }

    /// Returns a list to its pool.
    pub fn release_command_list(&self, list: CommandList) {
        self.queue(list.queue()).release_command_list(list);
    }

    /// Submits a closed list to its queue. See [`CommandQueue::execute_command_list`].
    pub fn execute_command_list(
        &self,
        list: &mut CommandList,
        wait_for_completion: bool,
    ) -> RhiResult<SyncPoint> {
        self.queue(list.queue())
            .execute_command_list(list, wait_for_completion)
    }

    /// The CPU-only heap of `kind`.
    pub fn offline_heap(&self, kind: DescriptorHeapKind) -> &Arc<OfflineDescriptorHeap> {
        self.resources.offline_heap(kind)
    }

    /// Allocates a raw slot from the CPU-only heap of `kind`.
    pub fn allocate_offline_descriptor(
        &self,
        kind: DescriptorHeapKind,
    ) -> RhiResult<OfflineDescriptor> {
        self.offline_heap(kind).allocate()
    }

    /// Returns a raw slot to the CPU-only heap of `kind`.
    pub fn free_offline_descriptor(
        &self,
        kind: DescriptorHeapKind,
        descriptor: OfflineDescriptor,
    ) -> RhiResult<()> {
        self.offline_heap(kind).free(descriptor)
    }

    /// Writes a view into the CPU-only heap its description selects.
    pub fn create_view(&self, desc: ViewDesc) -> RhiResult<ViewRef> {
        ResourceView::create(self.offline_heap(desc.heap_kind()), desc)
    }

    /// Writes a sampler into the CPU-only sampler heap.
    pub fn create_sampler(&self, desc: SamplerDesc) -> RhiResult<ViewRef> {
        self.create_view(ViewDesc::Sampler(desc))
    }

    /// Releases `payload` once `queue`'s fence reaches `fence_value`.
    pub fn deferred_delete(&self, queue: QueueType, fence_value: u64, payload: DeferredPayload) {
        self.resources
            .deletion_queue
            .enqueue(queue, fence_value, payload);
    }

    /// Refreshes every queue's completed value and releases what it covers.
    ///
    /// Returns the number of released deferred entries.
    pub fn begin_frame(&self) -> RhiResult<usize> {
        for queue in &self.resources.queues {
            queue.fence().refresh_completed_value()?;
        }
        Ok(self.drain_completed())
    }

    fn drain_completed(&self) -> usize {
        let queues = &self.resources.queues;
        self.resources
            .deletion_queue
            .drain_completed(|queue| queues[queue.index()].fence().completed_value())
    }

    /// Signals and waits on every queue, then releases everything deferred.
    pub fn flush(&self) -> RhiResult<usize> {
        for queue in &self.resources.queues {
            queue.flush()?;
        }
        Ok(self.drain_completed())
    }

    /// Blocks until the GPU is idle. Same as [`flush`](Self::flush).
    pub fn wait_idle(&self) -> RhiResult<usize> {
        self.flush()
    }

    /// Central device-removed handler. See [`DeviceHandle::handle_device_removed`].
    pub fn handle_device_removed(&self, err: &RhiError) {
        self.handle.handle_device_removed(err);
    }

    /// Whether the device has been removed.
    pub fn is_lost(&self) -> bool {
        self.handle.is_lost()
    }

    /// Diagnostics recorded at removal.
    pub fn removal_reason(&self) -> Option<String> {
        self.handle.removal_reason()
    }

    /// Registers the callback notified once when the device is removed.
    pub fn set_device_removed_callback(&self, callback: DeviceRemovedCallback) {
        self.handle.set_device_removed_callback(callback);
    }

    /// Recovers the native device and rebuilds every queue, pool and heap.
    ///
    /// Work in flight on the old device is considered gone: everything
    /// deferred is released immediately.
    pub fn recreate(&mut self) -> RhiResult<()> {
        log::warn!(
            "RhiDevice: recreating after removal ({})",
            self.removal_reason().unwrap_or_else(|| "no reason".to_string())
        );
        self.handle
            .native()
            .recover()
            .inspect_err(|e| log::error!("RhiDevice: native recovery failed: {e}"))?;
        self.handle.clear_lost();

        let released = self.resources.deletion_queue.flush_all();
        let fresh = DeviceResources::new(&self.handle)?;
        drop(std::mem::replace(&mut self.resources, fresh));
        log::info!("RhiDevice: recreated, {released} deferred entries released");
        Ok(())
    }

    /// A snapshot of every pool.
    pub fn stats(&self) -> RhiStats {
        let resources = &self.resources;
        RhiStats {
            queues: resources.queues.iter().map(|queue| queue.stats()).collect(),
            offline_heaps: resources
                .offline_heaps
                .iter()
                .map(|heap| heap.stats())
                .collect(),
            online_heaps: vec![
                resources.online_resources.stats(),
                resources.online_samplers.stats(),
            ],
            upload_pages_created: resources.upload_pages.pages_created(),
            upload_pages_pooled: resources.upload_pages.pooled_count(),
            deferred_pending: resources.deletion_queue.pending_count(),
            device_lost: self.is_lost(),
        }
    }
}

impl Drop for RhiDevice {
    fn drop(&mut self) {
        if !self.is_lost() {
            if let Err(e) = self.wait_idle() {
                log::warn!("RhiDevice: wait for idle at shutdown failed: {e}");
            }
        }
        self.resources.deletion_queue.flush_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;
    use ferrite_core::rhi::{BufferId, ShaderStage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn device() -> (Arc<MockDevice>, RhiDevice) {
        let mock = Arc::new(MockDevice::new());
        let device = RhiDevice::new(mock.clone(), RhiSettings::default()).unwrap();
        (mock, device)
    }

    #[test]
    fn test_new_creates_every_heap_and_null_descriptor() {
        let (mock, device) = device();
        // Null descriptors opened a resource and a sampler segment.
        assert_eq!(mock.live_heaps(), 2 + 2);
        let stats = device.stats();
        assert_eq!(stats.queues.len(), 3);
        assert_eq!(stats.online_heaps.len(), 2);
        let resource = &stats.offline_heaps[DescriptorHeapKind::Resource.index()];
        assert_eq!(resource.in_use, 3);
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let settings = RhiSettings {
            upload_page_size: 0,
            ..Default::default()
        };
        let err = RhiDevice::new(Arc::new(MockDevice::new()), settings).unwrap_err();
        assert!(matches!(err, RhiError::InvalidSettings(_)));
    }

    #[test]
    fn test_heap_creation_failure_aborts_construction() {
        let mock = Arc::new(MockDevice::new());
        mock.fail_heap_creation(true);
        assert!(RhiDevice::new(mock, RhiSettings::default()).is_err());
    }

    #[test]
    fn test_begin_frame_drains_per_queue() {
        let (mock, device) = device();
        let released = Arc::new(AtomicUsize::new(0));
        let direct = device.queue(QueueType::Direct).signal().unwrap();
        let copy = device.queue(QueueType::Copy).signal().unwrap();
        for point in [&direct, &copy] {
            let counter = released.clone();
            device.deferred_delete(
                point.queue(),
                point.value(),
                DeferredPayload::run(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        mock.complete_fence(copy.fence().id(), copy.value());
        assert_eq!(device.begin_frame().unwrap(), 1);
        assert_eq!(device.stats().deferred_pending, 1);

        assert_eq!(device.wait_idle().unwrap(), 1);
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_offline_descriptor_roundtrip() {
        let (_mock, device) = device();
        let kind = DescriptorHeapKind::DepthStencil;
        let descriptor = device.allocate_offline_descriptor(kind).unwrap();
        assert_eq!(device.offline_heap(kind).in_use(), 1);
        device.free_offline_descriptor(kind, descriptor).unwrap();
        assert!(device.free_offline_descriptor(kind, descriptor).is_err());
    }

    #[test]
    fn test_device_removal_and_recreate() {
        let (mock, mut device) = device();
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        device.set_device_removed_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let mut context = device.create_context(QueueType::Direct);
        context.draw(3, 1).unwrap();
        mock.set_lost("page fault");
        assert!(context.execute(false).unwrap_err().is_device_removed());
        assert!(device.begin_frame().unwrap_err().is_device_removed());
        assert!(device.is_lost());
        assert_eq!(device.removal_reason().as_deref(), Some("page fault"));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        drop(context);

        device.recreate().unwrap();
        assert!(!device.is_lost());
        assert!(!device.stats().device_lost);

        let view = device
            .create_view(ViewDesc::ConstantBuffer {
                buffer: BufferId(1),
                offset: 0,
                size: 16,
            })
            .unwrap();
        let mut context = device.create_context(QueueType::Direct);
        context.bind_view(ShaderStage::Pixel, 0, &view).unwrap();
        context.draw(3, 1).unwrap();
        assert_eq!(context.flush().unwrap().value(), 1);
    }

    #[test]
    fn test_create_sampler_uses_sampler_heap() {
        let (_mock, device) = device();
        let sampler = device.create_sampler(SamplerDesc::default()).unwrap();
        assert_eq!(
            device
                .offline_heap(DescriptorHeapKind::Sampler)
                .stats()
                .in_use,
            2
        );
        drop(sampler);
        assert_eq!(device.offline_heap(DescriptorHeapKind::Sampler).in_use(), 1);
    }
}
