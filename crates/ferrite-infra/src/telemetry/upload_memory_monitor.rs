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

//! Upload memory monitor.
//!
//! Reports the bytes held by the upload buffers of a [`NullDevice`] through
//! the [`ResourceMonitor`] interface, so the telemetry service can track
//! upload memory without depending on a backend.

use crate::graphics::null::NullDevice;
use ferrite_core::telemetry::{MonitoredResourceType, ResourceMonitor, ResourceUsageReport};
use std::borrow::Cow;
use std::sync::{Arc, Weak};

/// Tracks upload buffer memory of a device.
#[derive(Debug)]
pub struct UploadMemoryMonitor {
    /// Weak so the monitor never keeps a device alive
    device: Weak<NullDevice>,
    monitor_id: String,
}

impl UploadMemoryMonitor {
    /// Creates a monitor for `device`.
    pub fn new(device: &Arc<NullDevice>, monitor_id: impl Into<String>) -> Self {
        Self {
            device: Arc::downgrade(device),
            monitor_id: monitor_id.into(),
        }
    }
}

impl ResourceMonitor for UploadMemoryMonitor {
    fn monitor_id(&self) -> Cow<'static, str> {
        Cow::Owned(self.monitor_id.clone())
    }

    fn resource_type(&self) -> MonitoredResourceType {
        MonitoredResourceType::UploadMemory
    }

    fn usage_report(&self) -> ResourceUsageReport {
        match self.device.upgrade() {
            Some(device) => ResourceUsageReport {
                current: device.buffer_bytes(),
                peak: Some(device.buffer_peak_bytes()),
                capacity: None,
            },
            // The device is gone.
            None => ResourceUsageReport::default(),
        }
    }
}
