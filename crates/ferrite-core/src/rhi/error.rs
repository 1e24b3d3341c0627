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

//! Defines the error taxonomy of the RHI.
//!
//! Errors fall in three families:
//! - fatal ones ([`RhiError::DeviceCreationFailure`], [`RhiError::DeviceRemoved`])
//!   that invalidate the whole device,
//! - resource failures ([`RhiError::ResourceCreationFailure`],
//!   [`RhiError::AllocationExhausted`]) that abort the enclosing operation,
//! - programmer errors (invalid handle, invalid state, non-monotonic fence...)
//!   which are returned as errors and logged at the call site.

use super::api::AllocatorId;
use std::fmt;
use thiserror::Error;

/// The kind of native object whose creation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A command allocator (the memory backing recorded commands).
    CommandAllocator,
    /// A command list.
    CommandList,
    /// A CPU-only or shader-visible descriptor heap.
    DescriptorHeap,
    /// A fence.
    Fence,
    /// An upload buffer.
    Buffer,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::CommandAllocator => "command allocator",
            ResourceKind::CommandList => "command list",
            ResourceKind::DescriptorHeap => "descriptor heap",
            ResourceKind::Fence => "fence",
            ResourceKind::Buffer => "buffer",
        };
        f.write_str(name)
    }
}

/// An error produced by the RHI or by a native backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RhiError {
    /// The native device could not be created. Aborts startup.
    #[error("Device creation failed: {0}")]
    DeviceCreationFailure(String),

    /// A native object could not be created.
    #[error("Failed to create {kind}: {reason}")]
    ResourceCreationFailure {
        /// What was being created.
        kind: ResourceKind,
        /// Backend-provided reason.
        reason: String,
    },

    /// The GPU was lost (hang, driver reset, physical removal).
    #[error("Device removed: {reason}")]
    DeviceRemoved {
        /// Backend-provided diagnostics.
        reason: String,
    },

    /// A bounded pool or heap has no room left.
    #[error("Allocation exhausted: {what}")]
    AllocationExhausted {
        /// Which pool ran out.
        what: String,
    },

    /// A command allocator was reset while the GPU may still read from it.
    #[error(
        "Command allocator {allocator:?} reset while still in flight (requires {required}, completed {completed})"
    )]
    AllocatorInFlight {
        /// The offending allocator.
        allocator: AllocatorId,
        /// The timeline value that must complete before the reset is legal.
        required: u64,
        /// The timeline value completed at the time of the reset.
        completed: u64,
    },

    /// A handle does not belong to the object it was given to.
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// An object was used in a state that does not allow the operation.
    #[error("Invalid state: expected {expected}, found {found}")]
    InvalidState {
        /// The state the operation requires.
        expected: &'static str,
        /// The state the object was in.
        found: &'static str,
    },

    /// A call argument is out of its valid domain.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A fence was asked to signal a value that is not above its last one.
    #[error("Non-monotonic fence signal: last signaled {last}, requested {requested}")]
    NonMonotonicFence {
        /// The last value signaled on the fence.
        last: u64,
        /// The rejected value.
        requested: u64,
    },

    /// A blocking fence wait exceeded the configured GPU timeout.
    #[error("Timed out waiting for fence value {value}")]
    Timeout {
        /// The value that was waited for.
        value: u64,
    },

    /// Settings failed to parse or validate.
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

impl RhiError {
    /// Builds a [`RhiError::ResourceCreationFailure`].
    pub fn creation(kind: ResourceKind, reason: impl Into<String>) -> Self {
        RhiError::ResourceCreationFailure {
            kind,
            reason: reason.into(),
        }
    }

    /// Builds a [`RhiError::AllocationExhausted`].
    pub fn exhausted(what: impl Into<String>) -> Self {
        RhiError::AllocationExhausted { what: what.into() }
    }

    /// Returns `true` if this error reports the loss of the device.
    pub fn is_device_removed(&self) -> bool {
        matches!(self, RhiError::DeviceRemoved { .. })
    }

    /// Returns `true` if the error invalidates the whole device.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RhiError::DeviceCreationFailure(_) | RhiError::DeviceRemoved { .. }
        )
    }
}

/// A specialized `Result` type for RHI operations.
pub type RhiResult<T> = Result<T, RhiError>;
