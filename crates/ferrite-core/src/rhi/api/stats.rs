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

//! Point-in-time statistics of the RHI pools, consumed by telemetry.

use super::descriptor::DescriptorHeapKind;
use super::ids::QueueType;

/// Per-queue submission statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// The queue described.
    pub queue: QueueType,
    /// Last value signaled on the queue fence.
    pub last_signaled: u64,
    /// Last completed value observed on the queue fence.
    pub completed: u64,
    /// Command allocators created since startup.
    pub allocators_created: usize,
    /// Command allocators waiting in the pool.
    pub allocators_pooled: usize,
    /// Command lists created since startup.
    pub lists_created: usize,
    /// Command lists waiting in the pool.
    pub lists_pooled: usize,
}

/// Occupancy of a CPU-only descriptor heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfflineHeapStats {
    /// The heap kind.
    pub kind: DescriptorHeapKind,
    /// Number of native segments.
    pub segments: usize,
    /// Total descriptor capacity across segments.
    pub capacity: usize,
    /// Descriptors currently handed out.
    pub in_use: usize,
}

/// Occupancy of a shader-visible descriptor heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnlineHeapStats {
    /// The heap kind.
    pub kind: DescriptorHeapKind,
    /// Total blocks.
    pub block_count: usize,
    /// Blocks ready to be handed out.
    pub free_blocks: usize,
}

/// A snapshot of every pool owned by an RHI device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RhiStats {
    /// One entry per queue type.
    pub queues: Vec<QueueStats>,
    /// One entry per offline heap kind.
    pub offline_heaps: Vec<OfflineHeapStats>,
    /// One entry per shader-visible heap.
    pub online_heaps: Vec<OnlineHeapStats>,
    /// Upload pages created since startup.
    pub upload_pages_created: usize,
    /// Upload pages waiting in the page pool.
    pub upload_pages_pooled: usize,
    /// Entries waiting in the deferred deletion queue.
    pub deferred_pending: usize,
    /// Whether the device has been removed.
    pub device_lost: bool,
}
