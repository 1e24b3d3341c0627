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

//! A deterministic native device for unit tests.
//!
//! The GPU never progresses on its own: tests move fences forward with
//! [`MockDevice::complete_fence`] or [`MockDevice::complete_all`]. CPU waits
//! on a value that was signaled complete it immediately, as if the GPU
//! caught up while the thread slept.

use ferrite_core::rhi::{
    AllocatorId, BufferId, CommandListId, CpuDescriptorHandle, DescriptorHeapDesc,
    DescriptorHeapKind, FenceId, GpuDescriptorHandle, HeapId, HeapInfo, NativeCommand, NativeDevice,
    QueueType, ResourceKind, RhiError, RhiResult, ViewDesc,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) const INCREMENT: u32 = 32;

#[derive(Debug, Default)]
struct MockFence {
    completed: u64,
    signaled: u64,
}

#[derive(Debug, Default)]
struct MockState {
    fences: HashMap<FenceId, MockFence>,
    heaps: HashMap<HeapId, HeapInfo>,
    descriptors: HashMap<CpuDescriptorHandle, ViewDesc>,
    lists: HashMap<CommandListId, Vec<NativeCommand>>,
    buffers: HashMap<BufferId, Vec<u8>>,
    allocator_resets: Vec<AllocatorId>,
    copy_calls: usize,
    executed_lists: usize,
    lost: Option<String>,
    fail_heap_creation: bool,
}

#[derive(Debug, Default)]
pub(crate) struct MockDevice {
    next_id: AtomicU64,
    state: Mutex<MockState>,
}

impl MockDevice {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(MockState::default()),
        }
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_lost(state: &MockState) -> RhiResult<()> {
        match &state.lost {
            Some(reason) => Err(RhiError::DeviceRemoved {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn complete_fence(&self, fence: FenceId, value: u64) {
        let mut state = self.state.lock();
        let entry = state.fences.entry(fence).or_default();
        assert!(value <= entry.signaled, "completing a value never signaled");
        entry.completed = entry.completed.max(value);
    }

    pub(crate) fn complete_all(&self) {
        let mut state = self.state.lock();
        for fence in state.fences.values_mut() {
            fence.completed = fence.signaled;
        }
    }

    pub(crate) fn set_lost(&self, reason: &str) {
        self.state.lock().lost = Some(reason.to_string());
    }

    pub(crate) fn fail_heap_creation(&self, fail: bool) {
        self.state.lock().fail_heap_creation = fail;
    }

    pub(crate) fn commands(&self, list: CommandListId) -> Vec<NativeCommand> {
        self.state.lock().lists.get(&list).cloned().unwrap_or_default()
    }

    pub(crate) fn allocator_resets(&self) -> Vec<AllocatorId> {
        self.state.lock().allocator_resets.clone()
    }

    pub(crate) fn copy_calls(&self) -> usize {
        self.state.lock().copy_calls
    }

    pub(crate) fn executed_lists(&self) -> usize {
        self.state.lock().executed_lists
    }

    pub(crate) fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub(crate) fn buffer_bytes(&self, buffer: BufferId) -> Vec<u8> {
        self.state.lock().buffers.get(&buffer).cloned().unwrap_or_default()
    }

    pub(crate) fn descriptor_at(&self, handle: CpuDescriptorHandle) -> Option<ViewDesc> {
        self.state.lock().descriptors.get(&handle).cloned()
    }

    pub(crate) fn live_heaps(&self) -> usize {
        self.state.lock().heaps.len()
    }
}

/// Builds a device handle over a fresh mock, returning both.
pub(crate) fn mock_handle(
    settings: ferrite_core::rhi::RhiSettings,
) -> (Arc<MockDevice>, Arc<crate::DeviceHandle>) {
    let mock = Arc::new(MockDevice::new());
    let handle = crate::DeviceHandle::new(mock.clone(), settings);
    (mock, handle)
}

impl NativeDevice for MockDevice {
    fn create_command_allocator(&self, _queue: QueueType) -> RhiResult<AllocatorId> {
        Ok(AllocatorId(self.next()))
    }

    fn reset_command_allocator(&self, allocator: AllocatorId) -> RhiResult<()> {
        let mut state = self.state.lock();
        Self::check_lost(&state)?;
        state.allocator_resets.push(allocator);
        Ok(())
    }

    fn destroy_command_allocator(&self, _allocator: AllocatorId) {}

    fn create_command_list(&self, _queue: QueueType) -> RhiResult<CommandListId> {
        let id = CommandListId(self.next());
        self.state.lock().lists.insert(id, Vec::new());
        Ok(id)
    }

    fn reset_command_list(&self, list: CommandListId, _allocator: AllocatorId) -> RhiResult<()> {
        let mut state = self.state.lock();
        Self::check_lost(&state)?;
        state.lists.insert(list, Vec::new());
        Ok(())
    }

    fn record_command(&self, list: CommandListId, command: NativeCommand) -> RhiResult<()> {
        self.state.lock().lists.entry(list).or_default().push(command);
        Ok(())
    }

    fn close_command_list(&self, _list: CommandListId) -> RhiResult<()> {
        Self::check_lost(&self.state.lock())
    }

    fn destroy_command_list(&self, list: CommandListId) {
        self.state.lock().lists.remove(&list);
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> RhiResult<HeapInfo> {
        let mut state = self.state.lock();
        if state.fail_heap_creation {
            return Err(RhiError::creation(
                ResourceKind::DescriptorHeap,
                "mock heap creation failure",
            ));
        }
        let id = HeapId(self.next());
        let info = HeapInfo {
            id,
            kind: desc.kind,
            cpu_start: CpuDescriptorHandle(id.0 << 32),
            gpu_start: desc
                .shader_visible
                .then(|| GpuDescriptorHandle((1 << 63) | (id.0 << 32))),
            increment: INCREMENT,
            capacity: desc.capacity,
        };
        state.heaps.insert(id, info);
        Ok(info)
    }

    fn destroy_descriptor_heap(&self, heap: HeapId) {
        self.state.lock().heaps.remove(&heap);
    }

    fn write_descriptor(&self, dst: CpuDescriptorHandle, view: &ViewDesc) -> RhiResult<()> {
        self.state.lock().descriptors.insert(dst, view.clone());
        Ok(())
    }

    fn copy_descriptors(
        &self,
        _kind: DescriptorHeapKind,
        dst_start: CpuDescriptorHandle,
        sources: &[CpuDescriptorHandle],
    ) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.copy_calls += 1;
        for (i, src) in sources.iter().enumerate() {
            if let Some(view) = state.descriptors.get(src).cloned() {
                state
                    .descriptors
                    .insert(dst_start.offset(i as u32, INCREMENT), view);
            }
        }
        Ok(())
    }

    fn create_fence(&self, initial_value: u64) -> RhiResult<FenceId> {
        let id = FenceId(self.next());
        self.state.lock().fences.insert(
            id,
            MockFence {
                completed: initial_value,
                signaled: initial_value,
            },
        );
        Ok(id)
    }

    fn destroy_fence(&self, fence: FenceId) {
        self.state.lock().fences.remove(&fence);
    }

    fn fence_completed_value(&self, fence: FenceId) -> RhiResult<u64> {
        let state = self.state.lock();
        Self::check_lost(&state)?;
        Ok(state.fences.get(&fence).map_or(0, |f| f.completed))
    }

    fn wait_fence(&self, fence: FenceId, value: u64, _timeout: Option<Duration>) -> RhiResult<()> {
        let mut state = self.state.lock();
        Self::check_lost(&state)?;
        let entry = state.fences.entry(fence).or_default();
        if entry.signaled < value {
            return Err(RhiError::Timeout { value });
        }
        entry.completed = entry.completed.max(value);
        Ok(())
    }

    fn execute_command_lists(&self, _queue: QueueType, lists: &[CommandListId]) -> RhiResult<()> {
        let mut state = self.state.lock();
        Self::check_lost(&state)?;
        state.executed_lists += lists.len();
        Ok(())
    }

    fn queue_signal(&self, _queue: QueueType, fence: FenceId, value: u64) -> RhiResult<()> {
        let mut state = self.state.lock();
        Self::check_lost(&state)?;
        let entry = state.fences.entry(fence).or_default();
        entry.signaled = entry.signaled.max(value);
        Ok(())
    }

    fn queue_wait(&self, _queue: QueueType, _fence: FenceId, _value: u64) -> RhiResult<()> {
        Self::check_lost(&self.state.lock())
    }

    fn create_upload_buffer(&self, size: u64) -> RhiResult<BufferId> {
        let id = BufferId(self.next());
        self.state.lock().buffers.insert(id, vec![0; size as usize]);
        Ok(id)
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> RhiResult<()> {
        let mut state = self.state.lock();
        let bytes = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{buffer:?}")))?;
        let start = offset as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        self.state.lock().buffers.remove(&buffer);
    }

    fn device_removed_reason(&self) -> Option<String> {
        self.state.lock().lost.clone()
    }

    fn recover(&self) -> RhiResult<()> {
        self.state.lock().lost = None;
        Ok(())
    }
}
