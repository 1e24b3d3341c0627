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

//! # Ferrite RHI
//!
//! GPU command submission and descriptor management on top of a
//! [`NativeDevice`](ferrite_core::rhi::NativeDevice).
//!
//! The crate coordinates two timelines, the CPU and one GPU timeline per
//! queue, and guarantees that nothing the GPU may still read is reused or
//! destroyed:
//!
//! - [`fence`]: monotonic fences and the [`SyncPoint`]s that gate reuse.
//! - [`deletion_queue`]: teardown deferred until a fence value completes.
//! - [`descriptors`]: CPU-only descriptor heaps, shader-visible block heaps
//!   and the ref-counted views handed to callers.
//! - [`descriptor_cache`]: per-stage bindings turned into descriptor tables.
//! - [`state_cache`]: vertex, index, render target and root constant bindings.
//! - [`upload`]: the transient linear upload allocator.
//! - [`command`]: allocator/list pools, queues and the recording context.
//! - [`device`]: the [`RhiDevice`] that owns every pool, and device recovery.

#![warn(missing_docs)]

pub mod command;
pub mod deletion_queue;
pub mod descriptor_cache;
pub mod descriptors;
pub mod device;
pub mod fence;
pub mod handle;
pub mod state_cache;
pub mod upload;

#[cfg(test)]
pub(crate) mod mock;

pub use command::{
    CommandAllocator, CommandAllocatorPool, CommandContext, CommandList, CommandListPool,
    CommandListState, CommandQueue, ResourceBarrierBatcher,
};
pub use deletion_queue::{DeferredDeletionQueue, DeferredPayload};
pub use descriptor_cache::{CommitTarget, DescriptorCache, PipelineKind};
pub use descriptors::{
    NullDescriptors, OfflineDescriptor, OfflineDescriptorHeap, OnlineAllocation, OnlineBlock,
    OnlineDescriptorHeap, OnlineDescriptorManager, ResourceView, ViewRef,
};
pub use device::RhiDevice;
pub use fence::{Fence, SyncPoint};
pub use handle::DeviceHandle;
pub use state_cache::PipelineStateCache;
pub use upload::{UploadAllocation, UploadAllocator, UploadPagePool};
