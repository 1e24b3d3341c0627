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

//! Teardown deferred until the GPU is done with a resource.
//!
//! Entries carry the queue whose fence gates them and the fence value that
//! must be reached. Draining releases every entry whose value is covered by
//! the completed value of its queue and leaves all others untouched.

use ferrite_core::rhi::QueueType;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;

/// What to do once an entry's fence value is reached.
pub enum DeferredPayload {
    /// Drop the boxed value, releasing whatever it owns.
    Drop(Box<dyn Any + Send>),
    /// Run a callback, typically returning an object to its pool.
    Run(Box<dyn FnOnce() + Send>),
}

impl DeferredPayload {
    /// A payload running `f`.
    pub fn run(f: impl FnOnce() + Send + 'static) -> Self {
        DeferredPayload::Run(Box::new(f))
    }

    /// A payload dropping `value`.
    pub fn drop_value<T: Send + 'static>(value: T) -> Self {
        DeferredPayload::Drop(Box::new(value))
    }

    fn release(self) {
        match self {
            DeferredPayload::Drop(value) => drop(value),
            DeferredPayload::Run(callback) => callback(),
        }
    }
}

impl fmt::Debug for DeferredPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredPayload::Drop(_) => f.write_str("DeferredPayload::Drop"),
            DeferredPayload::Run(_) => f.write_str("DeferredPayload::Run"),
        }
    }
}

#[derive(Debug)]
struct DeferredEntry {
    queue: QueueType,
    fence_value: u64,
    payload: DeferredPayload,
}

/// A thread-safe list of `(queue, fence value, payload)` entries.
#[derive(Debug, Default)]
pub struct DeferredDeletionQueue {
    entries: Mutex<Vec<DeferredEntry>>,
}

impl DeferredDeletionQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `payload` for release once `queue`'s fence reaches `fence_value`.
    pub fn enqueue(&self, queue: QueueType, fence_value: u64, payload: DeferredPayload) {
        self.entries.lock().push(DeferredEntry {
            queue,
            fence_value,
            payload,
        });
    }

    /// Releases every entry of `queue` with `fence_value <= completed_value`.
    ///
    /// Returns the number of released entries.
    pub fn drain(&self, queue: QueueType, completed_value: u64) -> usize {
        self.drain_where(|entry| entry.queue == queue && entry.fence_value <= completed_value)
    }

    /// Releases every entry whose value is covered by `completed(entry.queue)`.
    pub fn drain_completed(&self, completed: impl Fn(QueueType) -> u64) -> usize {
        self.drain_where(|entry| entry.fence_value <= completed(entry.queue))
    }

    /// Releases everything. Only valid once the GPU is idle or gone.
    pub fn flush_all(&self) -> usize {
        self.drain_where(|_| true)
    }

    /// Number of entries waiting.
    pub fn pending_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Number of entries waiting on `queue`.
    pub fn pending_for(&self, queue: QueueType) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.queue == queue)
            .count()
    }

    fn drain_where(&self, ready: impl Fn(&DeferredEntry) -> bool) -> usize {
        let released: Vec<DeferredEntry> = {
            let mut entries = self.entries.lock();
            let (released, kept) = std::mem::take(&mut *entries)
                .into_iter()
                .partition(|entry| ready(entry));
            *entries = kept;
            released
        };

        // Payloads may enqueue again or take other locks.
        let count = released.len();
        for entry in released {
            entry.payload.release();
        }
        if count > 0 {
            log::trace!("DeferredDeletionQueue: released {count} entries");
        }
        count
    }
}

impl Drop for DeferredDeletionQueue {
    fn drop(&mut self) {
        let pending = self.entries.get_mut().len();
        if pending > 0 {
            log::debug!("DeferredDeletionQueue: releasing {pending} entries at shutdown");
            for entry in self.entries.get_mut().drain(..) {
                entry.payload.release();
            }
        }
    }
}
