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

//! Simulated GPU timelines.
//!
//! Every queue type owns an ordered stream of [`QueueOp`]s. In threaded mode
//! a worker thread consumes the stream as it arrives; in manual mode the
//! stream is buffered until a test steps it.

use crossbeam_channel::Receiver;
use ferrite_core::rhi::{FenceId, QueueType};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// One unit of work on a queue timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum QueueOp {
    /// Run a submitted batch of command lists.
    Execute { batch: u64, command_count: usize },
    /// Raise a fence to a value.
    Signal { fence: FenceId, value: u64 },
    /// Stall the queue until a fence reaches a value.
    Wait { fence: FenceId, value: u64 },
}

/// Fence values as the GPU sees them.
#[derive(Debug, Default)]
pub(crate) struct FenceTable {
    values: Mutex<HashMap<FenceId, u64>>,
    changed: Condvar,
}

impl FenceTable {
    pub(crate) fn create(&self, fence: FenceId, initial_value: u64) {
        self.values.lock().insert(fence, initial_value);
    }

    pub(crate) fn remove(&self, fence: FenceId) {
        self.values.lock().remove(&fence);
    }

    pub(crate) fn clear(&self) {
        self.values.lock().clear();
        self.changed.notify_all();
    }

    pub(crate) fn value(&self, fence: FenceId) -> Option<u64> {
        self.values.lock().get(&fence).copied()
    }

    /// A destroyed fence counts as reached, nothing can signal it anymore.
    pub(crate) fn is_reached(&self, fence: FenceId, value: u64) -> bool {
        self.values.lock().get(&fence).map_or(true, |&v| v >= value)
    }

    fn signal(&self, fence: FenceId, value: u64) {
        let mut values = self.values.lock();
        if let Some(current) = values.get_mut(&fence) {
            *current = (*current).max(value);
        }
        self.changed.notify_all();
    }

    /// Blocks until `fence` reaches `value`.
    ///
    /// Returns `false` if `interrupted` reports true or `deadline` passes first.
    pub(crate) fn wait(
        &self,
        fence: FenceId,
        value: u64,
        deadline: Option<Instant>,
        interrupted: impl Fn() -> bool,
    ) -> bool {
        let mut values = self.values.lock();
        loop {
            if values.get(&fence).map_or(true, |&v| v >= value) {
                return true;
            }
            if interrupted() {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut values, deadline).timed_out() {
                        return values.get(&fence).map_or(true, |&v| v >= value);
                    }
                }
                None => self.changed.wait(&mut values),
            }
        }
    }

    /// Wakes every waiter so it can re-check its interruption condition.
    pub(crate) fn wake_all(&self) {
        let _values = self.values.lock();
        self.changed.notify_all();
    }
}

/// Progress of one queue.
#[derive(Debug)]
pub(crate) struct QueueTimeline {
    queue: QueueType,
    submitted_batches: Mutex<u64>,
    completed_batches: AtomicU64,
    executed_commands: AtomicUsize,
    last_signal: AtomicU64,
    pending: Mutex<VecDeque<QueueOp>>,
}

impl QueueTimeline {
    fn new(queue: QueueType) -> Self {
        Self {
            queue,
            submitted_batches: Mutex::new(0),
            completed_batches: AtomicU64::new(0),
            executed_commands: AtomicUsize::new(0),
            last_signal: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn completed_batches(&self) -> u64 {
        self.completed_batches.load(Ordering::Acquire)
    }

    pub(crate) fn executed_commands(&self) -> usize {
        self.executed_commands.load(Ordering::Relaxed)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Numbers `op` if it is a batch and hands it to `deliver` in submission order.
    ///
    /// Returns the batch serial the op belongs to.
    pub(crate) fn submit<E>(
        &self,
        op: QueueOp,
        deliver: impl FnOnce(QueueOp) -> Result<(), E>,
    ) -> Result<u64, E> {
        let mut submitted = self.submitted_batches.lock();
        let op = match op {
            QueueOp::Execute { command_count, .. } => {
                *submitted += 1;
                QueueOp::Execute {
                    batch: *submitted,
                    command_count,
                }
            }
            other => other,
        };
        deliver(op)?;
        Ok(*submitted)
    }

    pub(crate) fn buffer(&self, op: QueueOp) {
        self.pending.lock().push_back(op);
    }

    fn apply(&self, op: QueueOp, fences: &FenceTable) {
        match op {
            QueueOp::Execute {
                batch,
                command_count,
            } => {
                self.executed_commands
                    .fetch_add(command_count, Ordering::Relaxed);
                self.completed_batches.fetch_max(batch, Ordering::AcqRel);
            }
            QueueOp::Signal { fence, value } => {
                self.last_signal.fetch_max(value, Ordering::AcqRel);
                fences.signal(fence, value);
            }
            // Stalls are resolved by the caller before applying.
            QueueOp::Wait { .. } => {}
        }
    }
}

/// Outcome of stepping a manual timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Applied,
    Blocked,
    Empty,
}

/// Everything the simulated GPU shares with the worker threads.
#[derive(Debug)]
pub(crate) struct GpuState {
    pub(crate) fences: FenceTable,
    timelines: Vec<QueueTimeline>,
    lost: AtomicBool,
    shutdown: AtomicBool,
}

impl GpuState {
    pub(crate) fn new() -> Self {
        Self {
            fences: FenceTable::default(),
            timelines: QueueType::ALL.iter().map(|&q| QueueTimeline::new(q)).collect(),
            lost: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn timeline(&self, queue: QueueType) -> &QueueTimeline {
        &self.timelines[queue.index()]
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub(crate) fn set_lost(&self, lost: bool) {
        self.lost.store(lost, Ordering::Release);
        self.fences.wake_all();
    }

    pub(crate) fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.fences.wake_all();
    }

    fn interrupted(&self) -> bool {
        self.is_lost() || self.shutdown.load(Ordering::Acquire)
    }

    /// Drops buffered work. Used when the device is recovered.
    pub(crate) fn discard_pending(&self) {
        for timeline in &self.timelines {
            timeline.pending.lock().clear();
        }
    }

    /// Applies the next buffered op of `queue`, unless it waits on an unreached fence.
    pub(crate) fn step(&self, queue: QueueType) -> Step {
        if self.is_lost() {
            return Step::Empty;
        }
        let timeline = self.timeline(queue);
        let op = {
            let mut pending = timeline.pending.lock();
            let blocked = match pending.front() {
                None => return Step::Empty,
                Some(QueueOp::Wait { fence, value }) => !self.fences.is_reached(*fence, *value),
                Some(_) => false,
            };
            if blocked {
                return Step::Blocked;
            }
            pending.pop_front()
        };
        if let Some(op) = op {
            timeline.apply(op, &self.fences);
        }
        Step::Applied
    }

    /// Steps `queue` until it has signaled `value` or cannot progress.
    pub(crate) fn complete_up_to(&self, queue: QueueType, value: u64) -> bool {
        let timeline = self.timeline(queue);
        loop {
            if timeline.last_signal.load(Ordering::Acquire) >= value {
                return true;
            }
            if self.step(queue) != Step::Applied {
                return false;
            }
        }
    }

    /// Steps every queue round-robin until `done` holds or nothing progresses.
    pub(crate) fn run_until(&self, done: impl Fn(&Self) -> bool) -> usize {
        let mut applied = 0;
        while !done(self) {
            let mut progressed = false;
            for queue in QueueType::ALL {
                if self.step(queue) == Step::Applied {
                    applied += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        applied
    }
}

/// Body of a threaded-mode queue worker.
pub(crate) fn run_worker(gpu: Arc<GpuState>, queue: QueueType, ops: Receiver<QueueOp>) {
    log::debug!("NullDevice: {queue} timeline started");
    let timeline = gpu.timeline(queue);
    for op in ops.iter() {
        if gpu.is_lost() {
            continue;
        }
        if let QueueOp::Wait { fence, value } = op {
            if !gpu.fences.wait(fence, value, None, || gpu.interrupted()) {
                continue;
            }
        }
        timeline.apply(op, &gpu.fences);
    }
    log::debug!("NullDevice: {} timeline stopped", timeline.queue);
}
