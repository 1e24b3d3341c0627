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

//! Defines the `NativeDevice` trait, the boundary to the underlying graphics API.

use crate::rhi::api::{
    AllocatorId, BufferId, CommandListId, CpuDescriptorHandle, DescriptorHeapDesc,
    DescriptorHeapKind, FenceId, HeapId, HeapInfo, NativeCommand, QueueType, ViewDesc,
};
use crate::rhi::error::RhiResult;
use std::fmt::Debug;
use std::time::Duration;

/// The low-level device the RHI pools drive.
///
/// Every object it creates is identified by an opaque id. Implementations must
/// be thread-safe: several recording threads may call into the device
/// concurrently. Calls that touch a queue (`execute_command_lists`,
/// `queue_signal`, `queue_wait`) are serialized per queue by the caller.
///
/// Any call may fail with [`RhiError::DeviceRemoved`](crate::rhi::RhiError::DeviceRemoved)
/// once the GPU is lost. Afterwards only `destroy_*`, `device_removed_reason`
/// and `recover` are meaningful.
pub trait NativeDevice: Send + Sync + Debug + 'static {
    // --- Command allocators ---

    /// Creates a command allocator for the given queue type.
    ///
    /// # Errors
    ///
    /// Returns `ResourceCreationFailure` if the backend is out of memory.
    fn create_command_allocator(&self, queue: QueueType) -> RhiResult<AllocatorId>;

    /// Releases the memory of every command recorded with `allocator`.
    ///
    /// The caller guarantees that no submitted list recorded with it is still
    /// executing. Backends with validation return `AllocatorInFlight` otherwise.
    fn reset_command_allocator(&self, allocator: AllocatorId) -> RhiResult<()>;

    /// Destroys a command allocator.
    fn destroy_command_allocator(&self, allocator: AllocatorId);

    // --- Command lists ---

    /// Creates a command list in the closed state.
    fn create_command_list(&self, queue: QueueType) -> RhiResult<CommandListId>;

    /// Opens a closed or submitted list for recording, backed by `allocator`.
    ///
    /// # Arguments
    ///
    /// * `list` - The list to reopen. Must not be recording.
    /// * `allocator` - The allocator that will back the recorded commands.
    ///   It must belong to the same queue type as the list.
    fn reset_command_list(&self, list: CommandListId, allocator: AllocatorId) -> RhiResult<()>;

    /// Appends a command to a recording list.
    fn record_command(&self, list: CommandListId, command: NativeCommand) -> RhiResult<()>;

    /// Closes a recording list, making it submittable.
    fn close_command_list(&self, list: CommandListId) -> RhiResult<()>;

    /// Destroys a command list.
    fn destroy_command_list(&self, list: CommandListId);

    // --- Descriptor heaps ---

    /// Creates a descriptor heap.
    ///
    /// # Returns
    ///
    /// The heap's CPU (and GPU, when shader visible) base addresses and the
    /// per-descriptor increment.
    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> RhiResult<HeapInfo>;

    /// Destroys a descriptor heap.
    fn destroy_descriptor_heap(&self, heap: HeapId);

    /// Writes a view into a descriptor slot.
    fn write_descriptor(&self, dst: CpuDescriptorHandle, view: &ViewDesc) -> RhiResult<()>;

    /// Copies `sources.len()` descriptors into the contiguous range starting at `dst_start`.
    ///
    /// Sources may be scattered across several heaps of the same kind. This is
    /// the batched copy used to fill a whole descriptor table in one call.
    fn copy_descriptors(
        &self,
        kind: DescriptorHeapKind,
        dst_start: CpuDescriptorHandle,
        sources: &[CpuDescriptorHandle],
    ) -> RhiResult<()>;

    // --- Fences ---

    /// Creates a fence holding `initial_value`.
    fn create_fence(&self, initial_value: u64) -> RhiResult<FenceId>;

    /// Destroys a fence.
    fn destroy_fence(&self, fence: FenceId);

    /// Returns the value the GPU has reached on `fence`. Never blocks.
    fn fence_completed_value(&self, fence: FenceId) -> RhiResult<u64>;

    /// Blocks the calling thread until `fence` reaches `value`.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if `timeout` elapses first, and `DeviceRemoved` if the
    /// GPU is lost while waiting.
    fn wait_fence(&self, fence: FenceId, value: u64, timeout: Option<Duration>) -> RhiResult<()>;

    // --- Queues ---

    /// Submits closed command lists to a queue, in order.
    fn execute_command_lists(&self, queue: QueueType, lists: &[CommandListId]) -> RhiResult<()>;

    /// Enqueues a GPU-side signal of `fence` to `value` after all prior work on `queue`.
    fn queue_signal(&self, queue: QueueType, fence: FenceId, value: u64) -> RhiResult<()>;

    /// Makes `queue` wait on the GPU until `fence` reaches `value`.
    fn queue_wait(&self, queue: QueueType, fence: FenceId, value: u64) -> RhiResult<()>;

    // --- Upload buffers ---

    /// Creates a CPU-writable, GPU-readable buffer of `size` bytes.
    fn create_upload_buffer(&self, size: u64) -> RhiResult<BufferId>;

    /// Writes `data` at `offset` into an upload buffer.
    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> RhiResult<()>;

    /// Destroys an upload buffer.
    fn destroy_buffer(&self, buffer: BufferId);

    // --- Device health ---

    /// Returns diagnostics describing why the device was removed, if it was.
    fn device_removed_reason(&self) -> Option<String>;

    /// Re-initializes the native device after a removal.
    ///
    /// Objects created before the removal stay invalid. The caller recreates
    /// everything it needs afterwards.
    fn recover(&self) -> RhiResult<()>;
}
