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

// Ferrite Sandbox
// Records frames from several threads against the null device.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ferrite_core::rhi::{
    FilterMode, QueueType, ResourceId, ResourceState, RhiSettings, SamplerDesc, ShaderStage,
    VertexBufferView, ViewDesc,
};
use ferrite_infra::{NullDevice, NullDeviceConfig, UploadMemoryMonitor};
use ferrite_rhi::{CommandContext, RhiDevice, ViewRef};
use ferrite_telemetry::{RhiMonitor, TelemetryService};

const SETTINGS_PATH: &str = "sandbox/rhi_settings.ron";
const WORKERS: usize = 4;
const MATERIALS_PER_WORKER: u64 = 64;
const FRAMES: u64 = 120;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 3],
}

const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: [0.0, 0.5, 0.0],
        color: [1.0, 0.0, 0.0],
    },
    Vertex {
        position: [-0.5, -0.5, 0.0],
        color: [0.0, 1.0, 0.0],
    },
    Vertex {
        position: [0.5, -0.5, 0.0],
        color: [0.0, 0.0, 1.0],
    },
];

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct FrameConstants {
    frame: u32,
    worker: u32,
    time: f32,
    _pad: f32,
}

struct Material {
    texture: ViewRef,
    sampler: ViewRef,
}

/// The color buffer one worker renders into.
struct RenderTarget {
    resource: ResourceId,
    view: ViewRef,
}

fn load_settings() -> Result<RhiSettings> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| SETTINGS_PATH.to_string());
    if Path::new(&path).exists() {
        log::info!("Loading settings from '{path}'");
        Ok(RhiSettings::load(&path)?)
    } else {
        log::info!("No settings at '{path}', using defaults");
        Ok(RhiSettings::default())
    }
}

/// Creates the materials of every worker in parallel, the offline heap's hot path.
fn create_materials(device: &RhiDevice) -> Result<Vec<Vec<Material>>> {
    std::thread::scope(|scope| {
        let workers: Vec<_> = (0..WORKERS as u64)
            .map(|worker| {
                scope.spawn(move || {
                    (0..MATERIALS_PER_WORKER)
                        .map(|i| {
                            Ok(Material {
                                texture: device.create_view(ViewDesc::ShaderResource {
                                    resource: ResourceId(worker * MATERIALS_PER_WORKER + i),
                                    first_mip: 0,
                                    mip_count: 8,
                                })?,
                                sampler: device.create_sampler(SamplerDesc {
                                    filter: if i % 2 == 0 {
                                        FilterMode::Linear
                                    } else {
                                        FilterMode::Anisotropic
                                    },
                                    max_anisotropy: 8,
                                    ..Default::default()
                                })?,
                            })
                        })
                        .collect::<Result<Vec<_>>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| {
                worker
                    .join()
                    .map_err(|_| anyhow::anyhow!("material worker panicked"))?
            })
            .collect()
    })
}

fn record_frame(
    device: &RhiDevice,
    context: &mut CommandContext,
    materials: &[Material],
    target: &RenderTarget,
    worker: usize,
    frame: u64,
) -> Result<()> {
    context.transition_barrier(target.resource, ResourceState::Common, ResourceState::RenderTarget);
    context.set_render_targets(std::slice::from_ref(&target.view), None)?;
    context.set_shader_constants(&[frame as u32, worker as u32])?;

    let constants = context.linear_allocate(std::mem::size_of::<FrameConstants>() as u64, 256)?;
    constants.write_pod(
        device.handle(),
        &FrameConstants {
            frame: frame as u32,
            worker: worker as u32,
            time: frame as f32 / 60.0,
            _pad: 0.0,
        },
    )?;
    for (i, material) in materials.iter().enumerate().skip(frame as usize % 8).step_by(8) {
        context.bind_view(ShaderStage::Pixel, 0, &material.texture)?;
        context.bind_view(ShaderStage::Pixel, 0, &material.sampler)?;
        context.upload_to_resource(
            ResourceId(10_000 + i as u64),
            0,
            bytemuck::cast_slice(&TRIANGLE),
        )?;
        let vertices = context.linear_allocate(std::mem::size_of_val(&TRIANGLE) as u64, 16)?;
        vertices.write(device.handle(), bytemuck::cast_slice(&TRIANGLE))?;
        context.set_vertex_buffers(
            0,
            &[VertexBufferView {
                buffer: vertices.buffer,
                offset: vertices.offset,
                size: vertices.size as u32,
                stride: std::mem::size_of::<Vertex>() as u32,
            }],
        )?;
        context.draw(TRIANGLE.len() as u32, 1)?;
    }
    context.transition_barrier(target.resource, ResourceState::RenderTarget, ResourceState::Common);
    log::trace!("Worker {worker} recorded frame {frame}");
    Ok(())
}

fn main() -> Result<()> {
    ferrite_telemetry::logging::init();

    let settings = load_settings()?;
    let native = NullDevice::new(NullDeviceConfig::default())?;
    let device = RhiDevice::new(native.clone(), settings)?;
    device.set_device_removed_callback(Box::new(|reason| {
        log::error!("Sandbox: device removed, frames will stop: {reason}");
    }));

    let mut telemetry = TelemetryService::new(Duration::from_millis(250));
    let rhi_monitor = Arc::new(RhiMonitor::new(telemetry.metrics_registry())?);
    telemetry.monitor_registry().register(rhi_monitor.clone());
    telemetry
        .monitor_registry()
        .register(Arc::new(UploadMemoryMonitor::new(&native, "null_upload")));

    let materials = create_materials(&device)?;
    log::info!(
        "Created {} materials on {WORKERS} threads",
        materials.iter().map(Vec::len).sum::<usize>()
    );

    let targets = (0..WORKERS as u64)
        .map(|worker| -> Result<RenderTarget> {
            let resource = ResourceId(20_000 + worker);
            let view = device.create_view(ViewDesc::RenderTarget { resource, mip: 0 })?;
            Ok(RenderTarget { resource, view })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut contexts: Vec<CommandContext> = (0..WORKERS)
        .map(|_| device.create_context(QueueType::Direct))
        .collect();

    let device_ref = &device;
    for frame in 0..FRAMES {
        let released = device.begin_frame()?;
        log::trace!("Frame {frame}: {released} deferred entries released");

        std::thread::scope(|scope| -> Result<()> {
            let workers: Vec<_> = contexts
                .iter_mut()
                .zip(materials.iter().zip(&targets))
                .enumerate()
                .map(|(worker, (context, (materials, target)))| {
                    scope.spawn(move || -> Result<()> {
                        record_frame(device_ref, context, materials, target, worker, frame)?;
                        // Every few frames the CPU waits, otherwise it runs ahead.
                        context.execute(frame % 3 == 2)?;
                        Ok(())
                    })
                })
                .collect();
            for worker in workers {
                worker
                    .join()
                    .map_err(|_| anyhow::anyhow!("frame worker panicked"))??;
            }
            Ok(())
        })?;

        rhi_monitor.record(&device.stats())?;
        telemetry.tick();
    }

    drop(contexts);
    device.wait_idle()?;
    rhi_monitor.record(&device.stats())?;

    let stats = device.stats();
    for queue in &stats.queues {
        log::info!(
            "{} queue: fence {} / {}, {} allocators, {} lists",
            queue.queue,
            queue.completed,
            queue.last_signaled,
            queue.allocators_created,
            queue.lists_created
        );
    }
    for heap in &stats.offline_heaps {
        log::info!(
            "Offline {:?} heap: {} / {} descriptors in {} segments",
            heap.kind,
            heap.in_use,
            heap.capacity,
            heap.segments
        );
    }
    log::info!(
        "Upload: {} pages created, peak {} bytes",
        stats.upload_pages_created,
        native.buffer_peak_bytes()
    );
    log::info!(
        "GPU executed {} commands",
        native.executed_command_count(QueueType::Direct)
    );
    Ok(())
}
