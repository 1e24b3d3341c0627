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

//! Registry for managing resource monitors.

use ferrite_core::telemetry::ResourceMonitor;
use parking_lot::Mutex;
use std::sync::Arc;

/// A thread-safe list of resource monitors.
#[derive(Debug, Clone, Default)]
pub struct MonitorRegistry {
    monitors: Arc<Mutex<Vec<Arc<dyn ResourceMonitor>>>>,
}

impl MonitorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a monitor.
    pub fn register(&self, monitor: Arc<dyn ResourceMonitor>) {
        log::info!("Registered resource monitor: {}", monitor.monitor_id());
        self.monitors.lock().push(monitor);
    }

    /// Calls [`ResourceMonitor::update`] on every monitor.
    pub fn update_all(&self) {
        for monitor in self.monitors.lock().iter() {
            monitor.update();
        }
    }

    /// A snapshot of the registered monitors.
    pub fn monitors(&self) -> Vec<Arc<dyn ResourceMonitor>> {
        self.monitors.lock().clone()
    }
}
