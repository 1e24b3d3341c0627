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

use super::timeline::{run_worker, GpuState, QueueOp};
use crossbeam_channel::Sender;
use ferrite_core::rhi::{
    AllocatorId, BufferId, CommandListId, CpuDescriptorHandle, DescriptorHeapDesc,
    DescriptorHeapKind, FenceId, GpuDescriptorHandle, HeapId, HeapInfo, NativeCommand,
    NativeDevice, QueueType, RhiError, RhiResult, ViewDesc,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Distance in bytes between two descriptors of a null heap.
pub const DESCRIPTOR_INCREMENT: u32 = 32;

const GPU_HANDLE_BIT: u64 = 1 << 63;
const HANDLE_OFFSET_MASK: u64 = 0xffff_ffff;

/// Behavior of a [`NullDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NullDeviceConfig {
    /// Buffer queue work until a test steps it, instead of running worker threads.
    pub manual_timeline: bool,
    /// Reject allocator resets while a batch recorded with the allocator is pending.
    pub validate_allocator_resets: bool,
}

impl Default for NullDeviceConfig {
    fn default() -> Self {
        Self {
            manual_timeline: false,
            validate_allocator_resets: true,
        }
    }
}

impl NullDeviceConfig {
    /// A deterministic configuration: the GPU only moves when told to.
    pub fn manual() -> Self {
        Self {
            manual_timeline: true,
            ..Default::default()
        }
    }
}

/// One allocator reset observed by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorReset {
    /// The allocator.
    pub allocator: AllocatorId,
    /// Its queue.
    pub queue: QueueType,
    /// The last batch recorded with the allocator.
    pub last_batch: u64,
    /// Batches the queue had completed at reset time.
    pub completed_batches: u64,
}

#[derive(Debug)]
struct AllocatorEntry {
    queue: QueueType,
    last_batch: u64,
}

#[derive(Debug)]
struct ListEntry {
    queue: QueueType,
    recording: bool,
    allocator: Option<AllocatorId>,
    commands: Vec<NativeCommand>,
}

#[derive(Debug)]
struct HeapEntry {
    info: HeapInfo,
    shader_visible: bool,
    slots: Vec<Option<ViewDesc>>,
}

/// A software [`NativeDevice`].
///
/// Native objects are entries in id-keyed maps. Each queue type runs on its
/// own simulated timeline (see [`NullDeviceConfig::manual_timeline`]), and
/// heaps store the written [`ViewDesc`]s so descriptor copies can be checked.
#[derive(Debug)]
pub struct NullDevice {
    config: NullDeviceConfig,
    gpu: Arc<GpuState>,
    senders: Mutex<Vec<Sender<QueueOp>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    removal_reason: Mutex<Option<String>>,

    allocators: Mutex<HashMap<AllocatorId, AllocatorEntry>>,
    lists: Mutex<HashMap<CommandListId, ListEntry>>,
    heaps: Mutex<HashMap<HeapId, HeapEntry>>,
    buffers: Mutex<HashMap<BufferId, Vec<u8>>>,
    reset_log: Mutex<Vec<AllocatorReset>>,

    next_allocator_id: AtomicU64,
    next_list_id: AtomicU64,
    next_heap_id: AtomicU64,
    next_fence_id: AtomicU64,
    next_buffer_id: AtomicU64,

    // Upload memory tracking
    buffer_bytes: AtomicU64,
    buffer_peak_bytes: AtomicU64,
}

impl NullDevice {
    /// Creates the device and, in threaded mode, one worker per queue type.
    ///
    /// # Errors
    ///
    /// Returns `DeviceCreationFailure` if a worker thread cannot be spawned.
    pub fn new(config: NullDeviceConfig) -> RhiResult<Arc<Self>> {
        let gpu = Arc::new(GpuState::new());
        let mut senders = Vec::new();
        let mut workers = Vec::new();

        if !config.manual_timeline {
            for queue in QueueType::ALL {
                let (sender, receiver) = crossbeam_channel::unbounded();
                let worker_gpu = gpu.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("null-gpu-{queue}"))
                    .spawn(move || run_worker(worker_gpu, queue, receiver))
                    .map_err(|e| {
                        RhiError::DeviceCreationFailure(format!(
                            "cannot spawn the {queue} timeline: {e}"
                        ))
                    })?;
                senders.push(sender);
                workers.push(handle);
            }
        }

        log::info!(
            "NullDevice: created ({} timeline)",
            if config.manual_timeline { "manual" } else { "threaded" }
        );
        Ok(Arc::new(Self {
            config,
            gpu,
            senders: Mutex::new(senders),
            workers: Mutex::new(workers),
            removal_reason: Mutex::new(None),
            allocators: Mutex::new(HashMap::new()),
            lists: Mutex::new(HashMap::new()),
            heaps: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            reset_log: Mutex::new(Vec::new()),
            next_allocator_id: AtomicU64::new(1),
            next_list_id: AtomicU64::new(1),
            next_heap_id: AtomicU64::new(1),
            next_fence_id: AtomicU64::new(1),
            next_buffer_id: AtomicU64::new(1),
            buffer_bytes: AtomicU64::new(0),
            buffer_peak_bytes: AtomicU64::new(0),
        }))
    }

    /// The configuration the device runs with.
    pub fn config(&self) -> NullDeviceConfig {
        self.config
    }

    // --- Timeline control ---

    /// Runs `queue` until it has processed a signal of at least `value`.
    ///
    /// Only meaningful in manual mode. Returns `false` if the queue ran dry or
    /// stalled on a cross-queue wait first.
    pub fn complete_up_to(&self, queue: QueueType, value: u64) -> bool {
        self.gpu.complete_up_to(queue, value)
    }

    /// Runs every queue until nothing can progress. Returns the number of processed ops.
    pub fn complete_all(&self) -> usize {
        self.gpu.run_until(|_| false)
    }

    /// Ops buffered on a manual timeline.
    pub fn pending_op_count(&self, queue: QueueType) -> usize {
        self.gpu.timeline(queue).pending_count()
    }

    /// Makes every later submission, signal and wait fail with `DeviceRemoved`.
    pub fn inject_device_removal(&self, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!("NullDevice: injecting device removal: {reason}");
        *self.removal_reason.lock() = Some(reason);
        self.gpu.set_lost(true);
    }

    // --- Introspection ---

    /// Every allocator reset so far, in order.
    pub fn allocator_reset_log(&self) -> Vec<AllocatorReset> {
        self.reset_log.lock().clone()
    }

    /// Commands executed by the GPU on `queue`.
    pub fn executed_command_count(&self, queue: QueueType) -> usize {
        self.gpu.timeline(queue).executed_commands()
    }

    /// Batches completed by the GPU on `queue`.
    pub fn completed_batches(&self, queue: QueueType) -> u64 {
        self.gpu.timeline(queue).completed_batches()
    }

    /// The GPU-side value of a fence.
    pub fn fence_value(&self, fence: FenceId) -> Option<u64> {
        self.gpu.fences.value(fence)
    }

    /// Upload buffers alive.
    pub fn live_buffer_count(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Descriptor heaps alive.
    pub fn live_heap_count(&self) -> usize {
        self.heaps.lock().len()
    }

    /// Bytes held by live upload buffers.
    pub fn buffer_bytes(&self) -> u64 {
        self.buffer_bytes.load(Ordering::Relaxed)
    }

    /// Highest value of [`buffer_bytes`](Self::buffer_bytes) seen.
    pub fn buffer_peak_bytes(&self) -> u64 {
        self.buffer_peak_bytes.load(Ordering::Relaxed)
    }

    /// Contents of a buffer.
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<Vec<u8>> {
        self.buffers.lock().get(&buffer).cloned()
    }

    /// Commands recorded in a list since its last reset.
    pub fn recorded_commands(&self, list: CommandListId) -> Vec<NativeCommand> {
        self.lists
            .lock()
            .get(&list)
            .map(|entry| entry.commands.clone())
            .unwrap_or_default()
    }

    /// The descriptor stored at a CPU address.
    pub fn descriptor_at(&self, handle: CpuDescriptorHandle) -> Option<ViewDesc> {
        let (heap, index) = decode_handle(handle.0);
        self.heaps
            .lock()
            .get(&heap)
            .and_then(|entry| entry.slots.get(index as usize).cloned().flatten())
    }

    /// The descriptor stored at a GPU address of a shader-visible heap.
    pub fn descriptor_at_gpu(&self, handle: GpuDescriptorHandle) -> Option<ViewDesc> {
        if handle.0 & GPU_HANDLE_BIT == 0 {
            return None;
        }
        self.descriptor_at(CpuDescriptorHandle(handle.0 & !GPU_HANDLE_BIT))
    }

    // --- Internals ---

    fn check_lost(&self) -> RhiResult<()> {
        if self.gpu.is_lost() {
            let reason = self
                .removal_reason
                .lock()
                .clone()
                .unwrap_or_else(|| "device lost".to_string());
            return Err(RhiError::DeviceRemoved { reason });
        }
        Ok(())
    }

    fn submit(&self, queue: QueueType, op: QueueOp) -> RhiResult<u64> {
        self.check_lost()?;
        let timeline = self.gpu.timeline(queue);
        if self.config.manual_timeline {
            return timeline.submit::<RhiError>(op, |op| {
                timeline.buffer(op);
                Ok(())
            });
        }

        let senders = self.senders.lock();
        let sender = senders.get(queue.index()).ok_or_else(|| RhiError::DeviceRemoved {
            reason: format!("the {queue} timeline is shut down"),
        })?;
        timeline.submit(op, |op| {
            sender.send(op).map_err(|_| RhiError::DeviceRemoved {
                reason: format!("the {queue} timeline stopped"),
            })
        })
    }

    fn track_buffer_bytes(&self, added: u64) {
        let total = self.buffer_bytes.fetch_add(added, Ordering::Relaxed) + added;
        self.buffer_peak_bytes.fetch_max(total, Ordering::Relaxed);
    }
}

fn decode_handle(raw: u64) -> (HeapId, u32) {
    let heap = HeapId((raw & !GPU_HANDLE_BIT) >> 32);
    let index = ((raw & HANDLE_OFFSET_MASK) / DESCRIPTOR_INCREMENT as u64) as u32;
    (heap, index)
}

impl NativeDevice for NullDevice {
    fn create_command_allocator(&self, queue: QueueType) -> RhiResult<AllocatorId> {
        let id = AllocatorId(self.next_allocator_id.fetch_add(1, Ordering::Relaxed));
        self.allocators.lock().insert(
            id,
            AllocatorEntry {
                queue,
                last_batch: 0,
            },
        );
        Ok(id)
    }

    fn reset_command_allocator(&self, allocator: AllocatorId) -> RhiResult<()> {
        self.check_lost()?;
        let allocators = self.allocators.lock();
        let entry = allocators
            .get(&allocator)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{allocator:?}")))?;
        let completed = self.gpu.timeline(entry.queue).completed_batches();
        if self.config.validate_allocator_resets && entry.last_batch > completed {
            log::error!(
                "NullDevice: {allocator:?} reset with batch {} pending ({completed} completed)",
                entry.last_batch
            );
            return Err(RhiError::AllocatorInFlight {
                allocator,
                required: entry.last_batch,
                completed,
            });
        }
        self.reset_log.lock().push(AllocatorReset {
            allocator,
            queue: entry.queue,
            last_batch: entry.last_batch,
            completed_batches: completed,
        });
        Ok(())
    }

    fn destroy_command_allocator(&self, allocator: AllocatorId) {
        self.allocators.lock().remove(&allocator);
    }

    fn create_command_list(&self, queue: QueueType) -> RhiResult<CommandListId> {
        let id = CommandListId(self.next_list_id.fetch_add(1, Ordering::Relaxed));
        self.lists.lock().insert(
            id,
            ListEntry {
                queue,
                recording: false,
                allocator: None,
                commands: Vec::new(),
            },
        );
        Ok(id)
    }

    fn reset_command_list(&self, list: CommandListId, allocator: AllocatorId) -> RhiResult<()> {
        self.check_lost()?;
        let allocator_queue = self
            .allocators
            .lock()
            .get(&allocator)
            .map(|entry| entry.queue)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{allocator:?}")))?;
        let mut lists = self.lists.lock();
        let entry = lists
            .get_mut(&list)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{list:?}")))?;
        if entry.recording {
            return Err(RhiError::InvalidState {
                expected: "Closed",
                found: "Recording",
            });
        }
        if entry.queue != allocator_queue {
            return Err(RhiError::InvalidArgument(format!(
                "{allocator:?} records for the {allocator_queue} queue, {list:?} for the {} queue",
                entry.queue
            )));
        }
        entry.recording = true;
        entry.allocator = Some(allocator);
        entry.commands.clear();
        Ok(())
    }

    fn record_command(&self, list: CommandListId, command: NativeCommand) -> RhiResult<()> {
        let mut lists = self.lists.lock();
        let entry = lists
            .get_mut(&list)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{list:?}")))?;
        if !entry.recording {
            return Err(RhiError::InvalidState {
                expected: "Recording",
                found: "Closed",
            });
        }
        entry.commands.push(command);
        Ok(())
    }

    fn close_command_list(&self, list: CommandListId) -> RhiResult<()> {
        self.check_lost()?;
        let mut lists = self.lists.lock();
        let entry = lists
            .get_mut(&list)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{list:?}")))?;
        if !entry.recording {
            return Err(RhiError::InvalidState {
                expected: "Recording",
                found: "Closed",
            });
        }
        entry.recording = false;
        Ok(())
    }

    fn destroy_command_list(&self, list: CommandListId) {
        self.lists.lock().remove(&list);
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> RhiResult<HeapInfo> {
        if desc.capacity == 0 {
            return Err(RhiError::InvalidArgument(
                "descriptor heaps need a non-zero capacity".to_string(),
            ));
        }
        if desc.shader_visible && !desc.kind.supports_shader_visibility() {
            return Err(RhiError::InvalidArgument(format!(
                "{:?} heaps cannot be shader visible",
                desc.kind
            )));
        }
        let span = desc.capacity as u64 * DESCRIPTOR_INCREMENT as u64;
        if span > HANDLE_OFFSET_MASK {
            return Err(RhiError::InvalidArgument(format!(
                "{} descriptors exceed the addressable heap size",
                desc.capacity
            )));
        }

        let id = HeapId(self.next_heap_id.fetch_add(1, Ordering::Relaxed));
        let base = id.0 << 32;
        let info = HeapInfo {
            id,
            kind: desc.kind,
            cpu_start: CpuDescriptorHandle(base),
            gpu_start: desc
                .shader_visible
                .then_some(GpuDescriptorHandle(GPU_HANDLE_BIT | base)),
            increment: DESCRIPTOR_INCREMENT,
            capacity: desc.capacity,
        };
        self.heaps.lock().insert(
            id,
            HeapEntry {
                info,
                shader_visible: desc.shader_visible,
                slots: vec![None; desc.capacity as usize],
            },
        );
        log::trace!("NullDevice: heap {id:?} ({:?}, {})", desc.kind, desc.capacity);
        Ok(info)
    }

    fn destroy_descriptor_heap(&self, heap: HeapId) {
        self.heaps.lock().remove(&heap);
    }

    fn write_descriptor(&self, dst: CpuDescriptorHandle, view: &ViewDesc) -> RhiResult<()> {
        let (heap, index) = decode_handle(dst.0);
        let mut heaps = self.heaps.lock();
        let entry = heaps
            .get_mut(&heap)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{dst:?}")))?;
        if entry.info.kind != view.heap_kind() {
            return Err(RhiError::InvalidArgument(format!(
                "{view:?} written into a {:?} heap",
                entry.info.kind
            )));
        }
        let slot = entry
            .slots
            .get_mut(index as usize)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{dst:?}")))?;
        *slot = Some(view.clone());
        Ok(())
    }

    fn copy_descriptors(
        &self,
        kind: DescriptorHeapKind,
        dst_start: CpuDescriptorHandle,
        sources: &[CpuDescriptorHandle],
    ) -> RhiResult<()> {
        let mut heaps = self.heaps.lock();
        let contents = sources
            .iter()
            .map(|src| {
                let (heap, index) = decode_handle(src.0);
                let entry = heaps
                    .get(&heap)
                    .ok_or_else(|| RhiError::InvalidHandle(format!("{src:?}")))?;
                if entry.info.kind != kind || entry.shader_visible {
                    return Err(RhiError::InvalidArgument(format!(
                        "{src:?} is not a CPU-only {kind:?} descriptor"
                    )));
                }
                entry
                    .slots
                    .get(index as usize)
                    .cloned()
                    .ok_or_else(|| RhiError::InvalidHandle(format!("{src:?}")))
            })
            .collect::<RhiResult<Vec<_>>>()?;

        let (heap, first) = decode_handle(dst_start.0);
        let entry = heaps
            .get_mut(&heap)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{dst_start:?}")))?;
        if entry.info.kind != kind {
            return Err(RhiError::InvalidArgument(format!(
                "copy of {kind:?} descriptors into a {:?} heap",
                entry.info.kind
            )));
        }
        let first = first as usize;
        let range = entry
            .slots
            .get_mut(first..first + contents.len())
            .ok_or_else(|| {
                RhiError::InvalidArgument(format!(
                    "{} descriptors at {first} overflow a heap of {}",
                    contents.len(),
                    entry.info.capacity
                ))
            })?;
        range.clone_from_slice(&contents);
        Ok(())
    }

    fn create_fence(&self, initial_value: u64) -> RhiResult<FenceId> {
        let id = FenceId(self.next_fence_id.fetch_add(1, Ordering::Relaxed));
        self.gpu.fences.create(id, initial_value);
        Ok(id)
    }

    fn destroy_fence(&self, fence: FenceId) {
        self.gpu.fences.remove(fence);
    }

    fn fence_completed_value(&self, fence: FenceId) -> RhiResult<u64> {
        self.check_lost()?;
        self.gpu
            .fences
            .value(fence)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{fence:?}")))
    }

    fn wait_fence(&self, fence: FenceId, value: u64, timeout: Option<Duration>) -> RhiResult<()> {
        self.check_lost()?;
        let reached = if self.config.manual_timeline {
            self.gpu
                .run_until(|gpu| gpu.fences.is_reached(fence, value));
            self.gpu.fences.is_reached(fence, value)
        } else {
            let deadline = timeout.map(|timeout| Instant::now() + timeout);
            let gpu = &self.gpu;
            gpu.fences.wait(fence, value, deadline, || gpu.is_lost())
        };

        if reached {
            Ok(())
        } else {
            self.check_lost()?;
            Err(RhiError::Timeout { value })
        }
    }

    fn execute_command_lists(&self, queue: QueueType, lists: &[CommandListId]) -> RhiResult<()> {
        self.check_lost()?;
        let mut command_count = 0;
        let mut allocators = Vec::with_capacity(lists.len());
        {
            let entries = self.lists.lock();
            for id in lists {
                let entry = entries
                    .get(id)
                    .ok_or_else(|| RhiError::InvalidHandle(format!("{id:?}")))?;
                if entry.recording {
                    return Err(RhiError::InvalidState {
                        expected: "Closed",
                        found: "Recording",
                    });
                }
                if entry.queue != queue {
                    return Err(RhiError::InvalidArgument(format!(
                        "{id:?} records for the {} queue, submitted to {queue}",
                        entry.queue
                    )));
                }
                command_count += entry.commands.len();
                allocators.extend(entry.allocator);
            }
        }

        let batch = self.submit(
            queue,
            QueueOp::Execute {
                batch: 0,
                command_count,
            },
        )?;
        let mut entries = self.allocators.lock();
        for allocator in allocators {
            if let Some(entry) = entries.get_mut(&allocator) {
                entry.last_batch = entry.last_batch.max(batch);
            }
        }
        Ok(())
    }

    fn queue_signal(&self, queue: QueueType, fence: FenceId, value: u64) -> RhiResult<()> {
        self.submit(queue, QueueOp::Signal { fence, value })
            .map(|_| ())
    }

    fn queue_wait(&self, queue: QueueType, fence: FenceId, value: u64) -> RhiResult<()> {
        self.submit(queue, QueueOp::Wait { fence, value })
            .map(|_| ())
    }

    fn create_upload_buffer(&self, size: u64) -> RhiResult<BufferId> {
        let len = usize::try_from(size).map_err(|_| {
            RhiError::InvalidArgument(format!("{size} bytes do not fit in host memory"))
        })?;
        let id = BufferId(self.next_buffer_id.fetch_add(1, Ordering::Relaxed));
        self.buffers.lock().insert(id, vec![0; len]);
        self.track_buffer_bytes(size);
        Ok(id)
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> RhiResult<()> {
        let mut buffers = self.buffers.lock();
        let bytes = buffers
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{buffer:?}")))?;
        let start = offset as usize;
        let range = bytes.get_mut(start..start + data.len()).ok_or_else(|| {
            RhiError::InvalidArgument(format!(
                "{} bytes at {offset} overflow {buffer:?}",
                data.len()
            ))
        })?;
        range.copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        if let Some(bytes) = self.buffers.lock().remove(&buffer) {
            self.buffer_bytes
                .fetch_sub(bytes.len() as u64, Ordering::Relaxed);
        }
    }

    fn device_removed_reason(&self) -> Option<String> {
        if self.gpu.is_lost() {
            self.removal_reason.lock().clone()
        } else {
            None
        }
    }

    fn recover(&self) -> RhiResult<()> {
        log::info!("NullDevice: recovering, every native object is discarded");
        self.gpu.discard_pending();
        self.gpu.fences.clear();
        self.allocators.lock().clear();
        self.lists.lock().clear();
        self.heaps.lock().clear();
        self.buffers.lock().clear();
        self.buffer_bytes.store(0, Ordering::Relaxed);
        *self.removal_reason.lock() = None;
        self.gpu.set_lost(false);
        Ok(())
    }
}

impl Drop for NullDevice {
    fn drop(&mut self) {
        self.gpu.shut_down();
        // Dropping the senders ends the worker loops.
        self.senders.get_mut().clear();
        for worker in self.workers.get_mut().drain(..) {
            if worker.join().is_err() {
                log::error!("NullDevice: a timeline worker panicked");
            }
        }
    }
}
