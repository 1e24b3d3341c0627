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

//! Ref-counted descriptor views.

use super::offline_heap::{OfflineDescriptor, OfflineDescriptorHeap};
use ferrite_core::rhi::{CpuDescriptorHandle, DescriptorType, RhiError, RhiResult, ViewDesc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_VIEW_ID: AtomicU64 = AtomicU64::new(1);

/// A shared view. Cloning shares it, dropping the last clone frees its slot.
pub type ViewRef = Arc<ResourceView>;

/// A descriptor written into an offline heap slot.
///
/// Each view has a process-unique id. Caches key on it rather than on the
/// allocation address, which may be reused once a view is dropped.
#[derive(Debug)]
pub struct ResourceView {
    id: u64,
    desc: ViewDesc,
    descriptor: OfflineDescriptor,
    heap: Arc<OfflineDescriptorHeap>,
}

impl ResourceView {
    /// Allocates a slot in `heap` and writes `desc` into it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `desc` belongs in another heap kind, and
    /// propagates allocation and native write failures.
    pub fn create(heap: &Arc<OfflineDescriptorHeap>, desc: ViewDesc) -> RhiResult<ViewRef> {
        if desc.heap_kind() != heap.kind() {
            return Err(RhiError::InvalidArgument(format!(
                "{desc:?} cannot live in a {:?} heap",
                heap.kind()
            )));
        }

        let descriptor = heap.allocate()?;
        let device = heap.device();
        if let Err(e) = device.check(device.native().write_descriptor(descriptor.handle, &desc)) {
            heap.free(descriptor)?;
            return Err(e);
        }

        Ok(Arc::new(Self {
            id: NEXT_VIEW_ID.fetch_add(1, Ordering::Relaxed),
            desc,
            descriptor,
            heap: Arc::clone(heap),
        }))
    }

    /// The process-unique id. Never zero.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// What the view describes.
    pub fn desc(&self) -> &ViewDesc {
        &self.desc
    }

    /// The CPU address of the view's offline slot.
    pub fn handle(&self) -> CpuDescriptorHandle {
        self.descriptor.handle
    }

    /// The offline slot.
    pub fn descriptor(&self) -> OfflineDescriptor {
        self.descriptor
    }

    /// The table type the view binds as, `None` for render target and depth views.
    pub fn descriptor_type(&self) -> Option<DescriptorType> {
        self.desc.descriptor_type()
    }
}

impl Drop for ResourceView {
    fn drop(&mut self) {
        if let Err(e) = self.heap.free(self.descriptor) {
            log::warn!("ResourceView({}): failed to free its descriptor: {e}", self.id);
        }
    }
}

/// One null descriptor per table type, used to fill unbound slots.
#[derive(Debug)]
pub struct NullDescriptors {
    views: Vec<ViewRef>,
}

impl NullDescriptors {
    /// Writes the null descriptors into the resource and sampler heaps.
    pub fn new(
        resource_heap: &Arc<OfflineDescriptorHeap>,
        sampler_heap: &Arc<OfflineDescriptorHeap>,
    ) -> RhiResult<Self> {
        let views = DescriptorType::ALL
            .iter()
            .map(|&ty| {
                let heap = match ty {
                    DescriptorType::Sampler => sampler_heap,
                    _ => resource_heap,
                };
                ResourceView::create(heap, ViewDesc::Null(ty))
            })
            .collect::<RhiResult<Vec<_>>>()?;
        Ok(Self { views })
    }

    /// The null descriptor of `ty`.
    pub fn handle(&self, ty: DescriptorType) -> CpuDescriptorHandle {
        self.views[ty.index()].handle()
    }
}
