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

//! Descriptor heaps, descriptor handles and view descriptions.

use super::ids::{BufferId, HeapId, ResourceId};

/// The kind of descriptors a native heap stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    /// Constant buffer, shader resource and unordered access views.
    Resource,
    /// Sampler states.
    Sampler,
    /// Render target views.
    RenderTarget,
    /// Depth-stencil views.
    DepthStencil,
}

impl DescriptorHeapKind {
    /// Every heap kind, in index order.
    pub const ALL: [DescriptorHeapKind; 4] = [
        DescriptorHeapKind::Resource,
        DescriptorHeapKind::Sampler,
        DescriptorHeapKind::RenderTarget,
        DescriptorHeapKind::DepthStencil,
    ];

    /// A dense index usable for per-kind arrays.
    pub fn index(self) -> usize {
        match self {
            DescriptorHeapKind::Resource => 0,
            DescriptorHeapKind::Sampler => 1,
            DescriptorHeapKind::RenderTarget => 2,
            DescriptorHeapKind::DepthStencil => 3,
        }
    }

    /// Whether heaps of this kind can be made shader visible.
    pub fn supports_shader_visibility(self) -> bool {
        matches!(
            self,
            DescriptorHeapKind::Resource | DescriptorHeapKind::Sampler
        )
    }
}

/// The kind of a descriptor bound through a descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    /// Constant buffer view.
    ConstantBuffer,
    /// Shader resource view.
    ShaderResource,
    /// Unordered access view.
    UnorderedAccess,
    /// Sampler.
    Sampler,
}

impl DescriptorType {
    /// Every bindable descriptor type, in index order.
    pub const ALL: [DescriptorType; 4] = [
        DescriptorType::ConstantBuffer,
        DescriptorType::ShaderResource,
        DescriptorType::UnorderedAccess,
        DescriptorType::Sampler,
    ];

    /// A dense index usable for per-type arrays.
    pub fn index(self) -> usize {
        match self {
            DescriptorType::ConstantBuffer => 0,
            DescriptorType::ShaderResource => 1,
            DescriptorType::UnorderedAccess => 2,
            DescriptorType::Sampler => 3,
        }
    }

    /// The heap kind descriptors of this type live in.
    pub fn heap_kind(self) -> DescriptorHeapKind {
        match self {
            DescriptorType::Sampler => DescriptorHeapKind::Sampler,
            _ => DescriptorHeapKind::Resource,
        }
    }
}

/// A programmable pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex shader.
    Vertex,
    /// Hull (tessellation control) shader.
    Hull,
    /// Domain (tessellation evaluation) shader.
    Domain,
    /// Geometry shader.
    Geometry,
    /// Pixel (fragment) shader.
    Pixel,
    /// Compute shader.
    Compute,
}

impl ShaderStage {
    /// Every stage, in index order.
    pub const ALL: [ShaderStage; 6] = [
        ShaderStage::Vertex,
        ShaderStage::Hull,
        ShaderStage::Domain,
        ShaderStage::Geometry,
        ShaderStage::Pixel,
        ShaderStage::Compute,
    ];

    /// The stages used by graphics pipelines.
    pub const GRAPHICS: [ShaderStage; 5] = [
        ShaderStage::Vertex,
        ShaderStage::Hull,
        ShaderStage::Domain,
        ShaderStage::Geometry,
        ShaderStage::Pixel,
    ];

    /// A dense index usable for per-stage arrays.
    pub fn index(self) -> usize {
        match self {
            ShaderStage::Vertex => 0,
            ShaderStage::Hull => 1,
            ShaderStage::Domain => 2,
            ShaderStage::Geometry => 3,
            ShaderStage::Pixel => 4,
            ShaderStage::Compute => 5,
        }
    }
}

/// The CPU address of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuDescriptorHandle(pub u64);

impl CpuDescriptorHandle {
    /// Returns the handle `index` descriptors further, given the heap increment.
    pub fn offset(self, index: u32, increment: u32) -> Self {
        CpuDescriptorHandle(self.0 + index as u64 * increment as u64)
    }
}

/// The GPU address of a descriptor in a shader-visible heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuDescriptorHandle(pub u64);

impl GpuDescriptorHandle {
    /// Returns the handle `index` descriptors further, given the heap increment.
    pub fn offset(self, index: u32, increment: u32) -> Self {
        GpuDescriptorHandle(self.0 + index as u64 * increment as u64)
    }
}

/// Describes a native descriptor heap to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    /// What the heap stores.
    pub kind: DescriptorHeapKind,
    /// Number of descriptors.
    pub capacity: u32,
    /// Whether shaders can read from the heap.
    pub shader_visible: bool,
}

/// Properties of a created native descriptor heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapInfo {
    /// The native heap.
    pub id: HeapId,
    /// What the heap stores.
    pub kind: DescriptorHeapKind,
    /// CPU address of the first descriptor.
    pub cpu_start: CpuDescriptorHandle,
    /// GPU address of the first descriptor, for shader-visible heaps.
    pub gpu_start: Option<GpuDescriptorHandle>,
    /// Byte distance between two consecutive descriptors.
    pub increment: u32,
    /// Number of descriptors.
    pub capacity: u32,
}

impl HeapInfo {
    /// CPU address of the descriptor at `index`.
    pub fn cpu_handle(&self, index: u32) -> CpuDescriptorHandle {
        debug_assert!(index < self.capacity);
        self.cpu_start.offset(index, self.increment)
    }

    /// GPU address of the descriptor at `index`, for shader-visible heaps.
    pub fn gpu_handle(&self, index: u32) -> Option<GpuDescriptorHandle> {
        debug_assert!(index < self.capacity);
        self.gpu_start.map(|start| start.offset(index, self.increment))
    }

    /// Returns the index of `handle` in this heap, if it belongs to it.
    pub fn index_of(&self, handle: CpuDescriptorHandle) -> Option<u32> {
        let start = self.cpu_start.0;
        let end = start + self.capacity as u64 * self.increment as u64;
        if handle.0 < start || handle.0 >= end {
            return None;
        }
        let delta = handle.0 - start;
        if delta % self.increment as u64 != 0 {
            return None;
        }
        Some((delta / self.increment as u64) as u32)
    }
}

/// Texture filtering mode of a sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    /// Nearest texel.
    Point,
    /// Bilinear/trilinear filtering.
    #[default]
    Linear,
    /// Anisotropic filtering.
    Anisotropic,
}

/// Texture addressing mode of a sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    /// Tile the texture.
    #[default]
    Wrap,
    /// Tile with mirroring.
    Mirror,
    /// Clamp to the edge texel.
    Clamp,
    /// Use the border color.
    Border,
}

/// Describes a sampler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SamplerDesc {
    /// Filtering mode.
    pub filter: FilterMode,
    /// Addressing mode for all coordinates.
    pub address: AddressMode,
    /// Anisotropy level, used with [`FilterMode::Anisotropic`].
    pub max_anisotropy: u32,
}

/// The content written into a descriptor slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewDesc {
    /// A null descriptor of the given type. Reads return zero.
    Null(DescriptorType),
    /// A constant buffer window.
    ConstantBuffer {
        /// The buffer read by the view.
        buffer: BufferId,
        /// Byte offset of the window.
        offset: u64,
        /// Byte size of the window.
        size: u64,
    },
    /// A read-only view of a resource.
    ShaderResource {
        /// The viewed resource.
        resource: ResourceId,
        /// First visible mip level.
        first_mip: u32,
        /// Number of visible mip levels.
        mip_count: u32,
    },
    /// A read-write view of a resource.
    UnorderedAccess {
        /// The viewed resource.
        resource: ResourceId,
        /// The accessed mip level.
        mip: u32,
    },
    /// A sampler state.
    Sampler(SamplerDesc),
    /// A render target view.
    RenderTarget {
        /// The viewed resource.
        resource: ResourceId,
        /// The rendered mip level.
        mip: u32,
    },
    /// A depth-stencil view.
    DepthStencil {
        /// The viewed resource.
        resource: ResourceId,
        /// Whether depth writes are disabled.
        read_only: bool,
    },
}

impl ViewDesc {
    /// The heap kind this view must be written to.
    pub fn heap_kind(&self) -> DescriptorHeapKind {
        match self {
            ViewDesc::Null(ty) => ty.heap_kind(),
            ViewDesc::ConstantBuffer { .. }
            | ViewDesc::ShaderResource { .. }
            | ViewDesc::UnorderedAccess { .. } => DescriptorHeapKind::Resource,
            ViewDesc::Sampler(_) => DescriptorHeapKind::Sampler,
            ViewDesc::RenderTarget { .. } => DescriptorHeapKind::RenderTarget,
            ViewDesc::DepthStencil { .. } => DescriptorHeapKind::DepthStencil,
        }
    }

    /// The table type this view binds as, or `None` for output-merger views.
    pub fn descriptor_type(&self) -> Option<DescriptorType> {
        match self {
            ViewDesc::Null(ty) => Some(*ty),
            ViewDesc::ConstantBuffer { .. } => Some(DescriptorType::ConstantBuffer),
            ViewDesc::ShaderResource { .. } => Some(DescriptorType::ShaderResource),
            ViewDesc::UnorderedAccess { .. } => Some(DescriptorType::UnorderedAccess),
            ViewDesc::Sampler(_) => Some(DescriptorType::Sampler),
            ViewDesc::RenderTarget { .. } | ViewDesc::DepthStencil { .. } => None,
        }
    }
}
