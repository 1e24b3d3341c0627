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

//! Command lists and their per-queue pool.

use super::allocator_pool::CommandAllocator;
use crate::handle::DeviceHandle;
use ferrite_core::rhi::{
    AllocatorId, CommandListId, NativeCommand, QueueType, RhiError, RhiResult,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Lifecycle of a [`CommandList`].
///
/// `Closed -> Recording -> Closed -> Submitted -> Recording ...`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandListState {
    /// Not recording. Freshly created lists start here.
    Closed,
    /// Accepting commands.
    Recording,
    /// Handed to the queue. The driver owns a copy, so the list may be reset.
    Submitted,
}

impl CommandListState {
    fn name(self) -> &'static str {
        match self {
            CommandListState::Closed => "Closed",
            CommandListState::Recording => "Recording",
            CommandListState::Submitted => "Submitted",
        }
    }
}

/// A native command list and its recording state.
#[derive(Debug)]
pub struct CommandList {
    id: CommandListId,
    queue: QueueType,
    state: CommandListState,
    recorded_command_count: usize,
    allocator: Option<AllocatorId>,
}

impl CommandList {
    /// The native list.
    pub fn id(&self) -> CommandListId {
        self.id
    }

    /// The queue type the list records for.
    pub fn queue(&self) -> QueueType {
        self.queue
    }

    /// The current state.
    pub fn state(&self) -> CommandListState {
        self.state
    }

    /// Commands recorded since the last reset.
    pub fn recorded_command_count(&self) -> usize {
        self.recorded_command_count
    }

    /// The allocator backing the current recording.
    pub fn allocator(&self) -> Option<AllocatorId> {
        self.allocator
    }

    /// Resets the list against `allocator` and opens it for recording.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the list is already recording and
    /// `InvalidArgument` if the allocator belongs to another queue type.
    pub fn begin(&mut self, device: &DeviceHandle, allocator: &CommandAllocator) -> RhiResult<()> {
        if self.state == CommandListState::Recording {
            log::error!("CommandList({:?}): begin while recording", self.id);
            return Err(self.state_error(CommandListState::Closed));
        }
        if allocator.queue() != self.queue {
            return Err(RhiError::InvalidArgument(format!(
                "{} queue allocator used for a {} queue list",
                allocator.queue(),
                self.queue
            )));
        }

        device.check(device.native().reset_command_list(self.id, allocator.id()))?;
        self.state = CommandListState::Recording;
        self.recorded_command_count = 0;
        self.allocator = Some(allocator.id());
        Ok(())
    }

    /// Records one command.
    pub fn record(&mut self, device: &DeviceHandle, command: NativeCommand) -> RhiResult<()> {
        self.expect(CommandListState::Recording)?;
        device.check(device.native().record_command(self.id, command))?;
        self.recorded_command_count += 1;
        Ok(())
    }

    /// Ends recording.
    pub fn close(&mut self, device: &DeviceHandle) -> RhiResult<()> {
        self.expect(CommandListState::Recording)?;
        device.check(device.native().close_command_list(self.id))?;
        self.state = CommandListState::Closed;
        Ok(())
    }

    pub(crate) fn expect(&self, state: CommandListState) -> RhiResult<()> {
        if self.state == state {
            Ok(())
        } else {
            log::error!(
                "CommandList({:?}): expected {}, found {}",
                self.id,
                state.name(),
                self.state.name()
            );
            Err(self.state_error(state))
        }
    }

    fn state_error(&self, expected: CommandListState) -> RhiError {
        RhiError::InvalidState {
            expected: expected.name(),
            found: self.state.name(),
        }
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.state = CommandListState::Submitted;
    }
}

/// Per-queue pool of command lists.
///
/// Lists may be reused as soon as they were submitted, so the pool needs no
/// fence tracking of its own.
#[derive(Debug)]
pub struct CommandListPool {
    device: Arc<DeviceHandle>,
    queue: QueueType,
    free: Mutex<Vec<CommandList>>,
    created: AtomicUsize,
}

impl CommandListPool {
    /// Creates an empty pool.
    pub fn new(device: Arc<DeviceHandle>, queue: QueueType) -> Self {
        Self {
            device,
            queue,
            free: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// Takes an idle list, or creates one, and opens it against `allocator`.
    pub fn obtain(&self, allocator: &CommandAllocator) -> RhiResult<CommandList> {
        let pooled = self.free.lock().pop();
        let mut list = match pooled {
            Some(list) => list,
            None => self.create()?,
        };

        if let Err(e) = list.begin(&self.device, allocator) {
            self.free.lock().push(list);
            return Err(e);
        }
        Ok(list)
    }

    fn create(&self) -> RhiResult<CommandList> {
        let id = self
            .device
            .check(self.device.native().create_command_list(self.queue))
            .inspect_err(|e| log::error!("CommandListPool({}): creation failed: {e}", self.queue))?;
        let created = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!(
            "CommandListPool({}): created {id:?} ({created} total)",
            self.queue
        );
        Ok(CommandList {
            id,
            queue: self.queue,
            state: CommandListState::Closed,
            recorded_command_count: 0,
            allocator: None,
        })
    }

    /// Returns a list to the pool, closing it first if it is still recording.
    pub fn release(&self, mut list: CommandList) {
        if list.queue != self.queue {
            log::error!(
                "CommandListPool({}): rejected a {} queue list",
                self.queue,
                list.queue
            );
            self.device.native().destroy_command_list(list.id);
            return;
        }
        if list.state == CommandListState::Recording {
            if let Err(e) = list.close(&self.device) {
                log::warn!("CommandListPool({}): closing released list failed: {e}", self.queue);
            }
        }
        list.allocator = None;
        self.free.lock().push(list);
    }

    /// Lists created since startup.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Idle lists.
    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

impl Drop for CommandListPool {
    fn drop(&mut self) {
        for list in self.free.get_mut().drain(..) {
            self.device.native().destroy_command_list(list.id);
        }
    }
}
