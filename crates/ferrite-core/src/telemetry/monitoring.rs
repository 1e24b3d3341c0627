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

//! Resource monitors: stateful objects polled for a usage snapshot.

use std::borrow::Cow;
use std::fmt::Debug;

/// A polled view over a scarce resource.
///
/// The telemetry service keeps a list of monitors and calls [`update`](Self::update)
/// on each at a fixed interval.
pub trait ResourceMonitor: Send + Sync + Debug + 'static {
    /// A unique, human-readable identifier for this monitor.
    fn monitor_id(&self) -> Cow<'static, str>;

    /// The kind of resource monitored.
    fn resource_type(&self) -> MonitoredResourceType;

    /// The latest usage snapshot.
    fn usage_report(&self) -> ResourceUsageReport;

    /// Refreshes internal state. Monitors fed by push do nothing here.
    fn update(&self) {}
}

/// Kinds of monitored resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitoredResourceType {
    /// Descriptor heap slots.
    DescriptorHeap,
    /// Command allocators and lists.
    CommandPool,
    /// Upload memory pages.
    UploadMemory,
}

/// A unified usage figure, in the resource's natural unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsageReport {
    /// Units currently in use.
    pub current: u64,
    /// Peak units in use, if tracked.
    pub peak: Option<u64>,
    /// Total capacity, if bounded.
    pub capacity: Option<u64>,
}
