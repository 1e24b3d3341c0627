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

//! The shader-visible descriptor heap and the per-context block allocator.
//!
//! The native heap is sliced into `block_count` blocks of `block_size`
//! descriptors. A block is owned by exactly one [`OnlineDescriptorManager`]
//! at a time; ownership moves back to the heap either immediately
//! ([`OnlineDescriptorHeap::recycle_block`]) or once a fence value completes
//! ([`OnlineDescriptorHeap::free_block_deferred`]).

use crate::deletion_queue::{DeferredDeletionQueue, DeferredPayload};
use crate::handle::DeviceHandle;
use ferrite_core::rhi::{
    CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapKind, GpuDescriptorHandle, HeapId,
    HeapInfo, OnlineHeapStats, QueueType, ResourceKind, RhiError, RhiResult,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// A contiguous range of the shader-visible heap owned by one context.
///
/// Not `Clone`: moving the value moves ownership.
#[derive(Debug, PartialEq, Eq)]
pub struct OnlineBlock {
    heap: HeapId,
    index: u32,
    base_offset: u32,
    count: u32,
}

impl OnlineBlock {
    /// Index of the block in its heap.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Heap index of the first descriptor of the block.
    pub fn base_offset(&self) -> u32 {
        self.base_offset
    }

    /// Number of descriptors in the block.
    pub fn count(&self) -> u32 {
        self.count
    }
}

/// A shader-visible heap handing out fixed-size blocks.
#[derive(Debug)]
pub struct OnlineDescriptorHeap {
    device: Arc<DeviceHandle>,
    info: HeapInfo,
    gpu_start: GpuDescriptorHandle,
    block_size: u32,
    block_count: u32,
    free_blocks: Mutex<VecDeque<u32>>,
}

impl OnlineDescriptorHeap {
    /// Creates the native shader-visible heap and fills the free-block queue.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a kind that cannot be shader visible, and
    /// `ResourceCreationFailure` if the native heap cannot be created.
    pub fn new(
        device: Arc<DeviceHandle>,
        kind: DescriptorHeapKind,
        block_size: u32,
        block_count: u32,
    ) -> RhiResult<Arc<Self>> {
        if !kind.supports_shader_visibility() {
            return Err(RhiError::InvalidArgument(format!(
                "{kind:?} heaps cannot be shader visible"
            )));
        }
        if block_size == 0 || block_count == 0 {
            return Err(RhiError::InvalidArgument(
                "online heaps need a non-zero block size and count".to_string(),
            ));
        }

        let capacity = block_size.checked_mul(block_count).ok_or_else(|| {
            RhiError::InvalidArgument(format!("{block_count} blocks of {block_size} overflow"))
        })?;
        let info = device
            .native()
            .create_descriptor_heap(&DescriptorHeapDesc {
                kind,
                capacity,
                shader_visible: true,
            })
            .inspect_err(|e| log::error!("OnlineDescriptorHeap({kind:?}): creation failed: {e}"))?;
        let Some(gpu_start) = info.gpu_start else {
            device.native().destroy_descriptor_heap(info.id);
            return Err(RhiError::creation(
                ResourceKind::DescriptorHeap,
                "shader-visible heap has no GPU address",
            ));
        };

        log::debug!(
            "OnlineDescriptorHeap({kind:?}): {block_count} blocks of {block_size} descriptors"
        );
        Ok(Arc::new(Self {
            device,
            info,
            gpu_start,
            block_size,
            block_count,
            free_blocks: Mutex::new((0..block_count).collect()),
        }))
    }

    /// Pops a block from the free queue.
    ///
    /// # Errors
    ///
    /// Returns `AllocationExhausted` when every block is owned or waiting on a fence.
    pub fn allocate_block(&self) -> RhiResult<OnlineBlock> {
        let index = self.free_blocks.lock().pop_front().ok_or_else(|| {
            log::warn!(
                "OnlineDescriptorHeap({:?}): all {} blocks are in use",
                self.info.kind,
                self.block_count
            );
            RhiError::exhausted(format!("online {:?} descriptor blocks", self.info.kind))
        })?;
        Ok(OnlineBlock {
            heap: self.info.id,
            index,
            base_offset: index * self.block_size,
            count: self.block_size,
        })
    }

    /// Returns a block the GPU no longer references.
    pub fn recycle_block(&self, block: OnlineBlock) {
        debug_assert_eq!(block.heap, self.info.id, "block returned to the wrong heap");
        let mut free = self.free_blocks.lock();
        debug_assert!(!free.contains(&block.index), "block recycled twice");
        free.push_back(block.index);
    }

    /// Returns a block once `queue`'s fence reaches `fence_value`.
    pub fn free_block_deferred(
        self: &Arc<Self>,
        block: OnlineBlock,
        queue: QueueType,
        fence_value: u64,
        deletion_queue: &DeferredDeletionQueue,
    ) {
        let heap = Arc::clone(self);
        deletion_queue.enqueue(
            queue,
            fence_value,
            DeferredPayload::run(move || heap.recycle_block(block)),
        );
    }

    /// The descriptor kind.
    pub fn kind(&self) -> DescriptorHeapKind {
        self.info.kind
    }

    /// The native heap.
    pub fn heap_id(&self) -> HeapId {
        self.info.id
    }

    /// Descriptors per block.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Total number of blocks.
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Blocks ready to be handed out.
    pub fn free_block_count(&self) -> usize {
        self.free_blocks.lock().len()
    }

    /// CPU address of the descriptor at heap index `offset`.
    pub fn cpu_handle(&self, offset: u32) -> CpuDescriptorHandle {
        self.info.cpu_handle(offset)
    }

    /// GPU address of the descriptor at heap index `offset`.
    pub fn gpu_handle(&self, offset: u32) -> GpuDescriptorHandle {
        self.gpu_start.offset(offset, self.info.increment)
    }

    /// A snapshot of the block occupancy.
    pub fn stats(&self) -> OnlineHeapStats {
        OnlineHeapStats {
            kind: self.info.kind,
            block_count: self.block_count as usize,
            free_blocks: self.free_block_count(),
        }
    }
}

impl Drop for OnlineDescriptorHeap {
    fn drop(&mut self) {
        self.device.native().destroy_descriptor_heap(self.info.id);
    }
}

/// A range of descriptors sub-allocated from a context's block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnlineAllocation {
    /// Heap index of the first descriptor.
    pub offset: u32,
    /// Number of descriptors.
    pub count: u32,
    /// CPU address of the first descriptor, the copy destination.
    pub cpu: CpuDescriptorHandle,
    /// GPU address of the first descriptor, bound as a table base.
    pub gpu: GpuDescriptorHandle,
}

/// Per-context bump allocator over one block of an [`OnlineDescriptorHeap`].
///
/// Blocks replaced while recording are kept in a retired list until the
/// context submits; [`retire`](Self::retire) then hands them to the deferred
/// deletion queue with the fence value of that submission.
#[derive(Debug)]
pub struct OnlineDescriptorManager {
    heap: Arc<OnlineDescriptorHeap>,
    current: Option<OnlineBlock>,
    cursor: u32,
    retired: Vec<OnlineBlock>,
    generation: u64,
}

impl OnlineDescriptorManager {
    /// Creates a manager. The first block is taken on the first allocation.
    pub fn new(heap: Arc<OnlineDescriptorHeap>) -> Self {
        Self {
            heap,
            current: None,
            cursor: 0,
            retired: Vec::new(),
            generation: 0,
        }
    }

    /// The heap blocks come from.
    pub fn heap(&self) -> &Arc<OnlineDescriptorHeap> {
        &self.heap
    }

    /// Incremented every time the current block changes.
    ///
    /// Anything caching GPU handles into earlier blocks must drop them when
    /// this changes, since those blocks are recycled after the next submission.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Position of the bump cursor in the current block.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Blocks waiting for the next submission to be released.
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Whether `count` more descriptors fit in the current block.
    pub fn has_space(&self, count: u32) -> bool {
        self.current
            .as_ref()
            .is_some_and(|block| self.cursor + count <= block.count)
    }

    /// Sub-allocates `count` contiguous descriptors.
    ///
    /// Succeeds in place iff `cursor + count <= block size`. Otherwise the
    /// current block is retired and a fresh one is taken.
    ///
    /// # Errors
    ///
    /// Returns `AllocationExhausted` if `count` exceeds the block size or if
    /// the heap has no free block left.
    pub fn allocate(&mut self, count: u32) -> RhiResult<OnlineAllocation> {
        if count > self.heap.block_size() {
            return Err(RhiError::exhausted(format!(
                "{count} descriptors requested, online blocks hold {}",
                self.heap.block_size()
            )));
        }
        if !self.has_space(count) {
            self.realloc()?;
        }

        let block = self
            .current
            .as_ref()
            .ok_or_else(|| RhiError::exhausted("online descriptor manager has no block"))?;
        let offset = block.base_offset + self.cursor;
        self.cursor += count;
        Ok(OnlineAllocation {
            offset,
            count,
            cpu: self.heap.cpu_handle(offset),
            gpu: self.heap.gpu_handle(offset),
        })
    }

    /// Retires the current block and takes a fresh one.
    ///
    /// On failure the current block is kept, so the manager stays usable.
    pub fn realloc(&mut self) -> RhiResult<()> {
        let fresh = self.heap.allocate_block()?;
        if let Some(old) = self.current.replace(fresh) {
            self.retired.push(old);
        }
        self.cursor = 0;
        self.generation += 1;
        log::trace!(
            "OnlineDescriptorManager({:?}): switched block, generation {}",
            self.heap.kind(),
            self.generation
        );
        Ok(())
    }

    /// Releases the retired blocks once `fence_value` completes on `queue`.
    pub fn retire(
        &mut self,
        queue: QueueType,
        fence_value: u64,
        deletion_queue: &DeferredDeletionQueue,
    ) {
        for block in self.retired.drain(..) {
            self.heap
                .free_block_deferred(block, queue, fence_value, deletion_queue);
        }
    }

    /// Releases the retired blocks and the current one. Used when the owner goes away.
    pub fn release_all(
        &mut self,
        queue: QueueType,
        fence_value: u64,
        deletion_queue: &DeferredDeletionQueue,
    ) {
        if let Some(block) = self.current.take() {
            self.retired.push(block);
            self.generation += 1;
        }
        self.cursor = 0;
        self.retire(queue, fence_value, deletion_queue);
    }
}
