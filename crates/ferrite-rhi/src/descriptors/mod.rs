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

//! Descriptor storage.
//!
//! - [`OfflineDescriptorHeap`]: CPU-only descriptors allocated one at a time,
//!   where views live for as long as their owner keeps them.
//! - [`OnlineDescriptorHeap`]: the shader-visible heap, carved in fixed-size
//!   blocks handed to one recording context at a time.
//! - [`OnlineDescriptorManager`]: a context's bump allocator over its block.
//! - [`ResourceView`]: a ref-counted view whose offline slot is returned on drop.

mod offline_heap;
mod online_heap;
mod view;

pub use self::offline_heap::{FreeRange, OfflineDescriptor, OfflineDescriptorHeap};
pub use self::online_heap::{
    OnlineAllocation, OnlineBlock, OnlineDescriptorHeap, OnlineDescriptorManager,
};
pub use self::view::{NullDescriptors, ResourceView, ViewRef};
