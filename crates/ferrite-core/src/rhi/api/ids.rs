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

//! Opaque handles to native objects and the queue taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The hardware queue family a command list is submitted to.
///
/// Each queue type is its own GPU timeline. There is no implicit ordering
/// between queues: cross-queue dependencies are expressed with GPU-side waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueType {
    /// Graphics, compute and copy work.
    Direct,
    /// Compute and copy work.
    Compute,
    /// Copy work only.
    Copy,
}

impl QueueType {
    /// Every queue type, in index order.
    pub const ALL: [QueueType; 3] = [QueueType::Direct, QueueType::Compute, QueueType::Copy];

    /// A dense index usable for per-queue arrays.
    pub fn index(self) -> usize {
        match self {
            QueueType::Direct => 0,
            QueueType::Compute => 1,
            QueueType::Copy => 2,
        }
    }

    /// A short lowercase name used in logs and metric labels.
    pub fn name(self) -> &'static str {
        match self {
            QueueType::Direct => "direct",
            QueueType::Compute => "compute",
            QueueType::Copy => "copy",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An opaque handle to a native command allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocatorId(pub u64);

/// An opaque handle to a native command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandListId(pub u64);

/// An opaque handle to a native descriptor heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(pub u64);

/// An opaque handle to a native fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceId(pub u64);

/// An opaque handle to a native buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// An opaque handle to a GPU resource (texture or buffer) owned outside the RHI,
/// referenced by descriptor views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);
