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

//! Commands recorded into native command lists.

use super::descriptor::{CpuDescriptorHandle, DescriptorType, GpuDescriptorHandle, ShaderStage};
use super::ids::{BufferId, HeapId, ResourceId};

/// Number of input-assembler vertex buffer slots.
pub const MAX_VERTEX_BUFFER_SLOTS: u32 = 32;
/// Number of simultaneously bound render targets.
pub const MAX_RENDER_TARGETS: u32 = 8;
/// Number of 32-bit root constants a pipeline can read.
pub const MAX_SHADER_CONSTANTS: u32 = 32;

/// How the GPU may access a resource between two barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceState {
    /// Shared state, required for presentation and cross-queue use.
    #[default]
    Common,
    /// Read as vertex or constant buffer.
    VertexAndConstantBuffer,
    /// Read as index buffer.
    IndexBuffer,
    /// Written as render target.
    RenderTarget,
    /// Read and written through unordered access views.
    UnorderedAccess,
    /// Written as depth-stencil target.
    DepthWrite,
    /// Read as depth-stencil target.
    DepthRead,
    /// Read by shaders through shader resource views.
    ShaderResource,
    /// Destination of copies.
    CopyDest,
    /// Source of copies.
    CopySource,
}

/// A synchronization point between two accesses of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceBarrier {
    /// Moves every subresource from one state to another.
    Transition {
        /// The transitioned resource.
        resource: ResourceId,
        /// State the resource is in.
        before: ResourceState,
        /// State the resource moves to.
        after: ResourceState,
    },
    /// Orders two unordered-access passes over the same resource.
    UnorderedAccess {
        /// The accessed resource.
        resource: ResourceId,
    },
}

impl ResourceBarrier {
    /// The resource the barrier applies to.
    pub fn resource(&self) -> ResourceId {
        match *self {
            ResourceBarrier::Transition { resource, .. }
            | ResourceBarrier::UnorderedAccess { resource } => resource,
        }
    }
}

/// A window of a buffer read as per-vertex data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBufferView {
    /// The buffer holding the vertices.
    pub buffer: BufferId,
    /// Byte offset of the first vertex.
    pub offset: u64,
    /// Byte size of the window.
    pub size: u32,
    /// Byte distance between two vertices.
    pub stride: u32,
}

/// Width of the indices in an index buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexFormat {
    /// Indices are 16-bit unsigned integers.
    Uint16,
    /// Indices are 32-bit unsigned integers.
    #[default]
    Uint32,
}

/// A window of a buffer read as indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexBufferView {
    /// The buffer holding the indices.
    pub buffer: BufferId,
    /// Byte offset of the first index.
    pub offset: u64,
    /// Byte size of the window.
    pub size: u32,
    /// Width of each index.
    pub format: IndexFormat,
}

/// A single command recorded into a command list.
///
/// Draws and dispatches read the descriptor tables committed before them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeCommand {
    /// Binds the shader-visible heaps used by subsequent table bindings.
    SetDescriptorHeaps {
        /// The shader-visible resource heap.
        resource: HeapId,
        /// The shader-visible sampler heap.
        sampler: HeapId,
    },
    /// Points the root table of a stage and descriptor type at a GPU range.
    SetDescriptorTable {
        /// The stage whose table is set.
        stage: ShaderStage,
        /// Which of the stage's tables is set.
        table: DescriptorType,
        /// First descriptor of the table.
        base: GpuDescriptorHandle,
    },
    /// A batch of resource barriers, executed in order.
    ResourceBarriers(Vec<ResourceBarrier>),
    /// Binds the output-merger targets. Slots past the list are unbound.
    SetRenderTargets {
        /// Offline render target views, one per slot.
        render_targets: Vec<CpuDescriptorHandle>,
        /// Offline depth-stencil view.
        depth_stencil: Option<CpuDescriptorHandle>,
    },
    /// Binds consecutive vertex buffer slots. `None` unbinds a slot.
    SetVertexBuffers {
        /// First slot written.
        start_slot: u32,
        /// One view per slot.
        views: Vec<Option<VertexBufferView>>,
    },
    /// Binds or unbinds the index buffer.
    SetIndexBuffer(Option<IndexBufferView>),
    /// Writes the 32-bit root constants of the graphics or compute root signature.
    SetRootConstants {
        /// Whether the compute root signature receives the constants.
        compute: bool,
        /// The constant values, starting at offset zero.
        values: Vec<u32>,
    },
    /// Copies bytes from an upload buffer into a GPU resource.
    CopyBufferToResource {
        /// Upload buffer holding the source bytes.
        src: BufferId,
        /// Byte offset in the source.
        src_offset: u64,
        /// Destination resource.
        dst: ResourceId,
        /// Byte offset in the destination.
        dst_offset: u64,
        /// Number of bytes.
        size: u64,
    },
    /// Non-indexed draw.
    Draw {
        /// Vertices per instance.
        vertex_count: u32,
        /// Number of instances.
        instance_count: u32,
    },
    /// Compute dispatch.
    Dispatch {
        /// Thread groups along X.
        x: u32,
        /// Thread groups along Y.
        y: u32,
        /// Thread groups along Z.
        z: u32,
    },
    /// A debug marker visible in GPU captures.
    Marker(String),
}
