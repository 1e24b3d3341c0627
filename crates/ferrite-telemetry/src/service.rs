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

//! Service for managing telemetry data and resource monitoring.

use crate::metrics::registry::MetricsRegistry;
use crate::monitoring::registry::MonitorRegistry;
use std::time::{Duration, Instant};

/// Owns the metric and monitor registries and updates monitors periodically.
#[derive(Debug)]
pub struct TelemetryService {
    metrics: MetricsRegistry,
    monitors: MonitorRegistry,
    last_update: Instant,
    update_interval: Duration,
}

impl TelemetryService {
    /// Creates a service updating monitors at most once per `update_interval`.
    pub fn new(update_interval: Duration) -> Self {
        Self {
            metrics: MetricsRegistry::new(),
            monitors: MonitorRegistry::new(),
            last_update: Instant::now(),
            update_interval,
        }
    }

    /// Call once per frame. Returns `true` if the monitors were updated.
    pub fn tick(&mut self) -> bool {
        if self.last_update.elapsed() < self.update_interval {
            return false;
        }
        log::trace!("Updating all resource monitors...");
        self.monitors.update_all();
        for monitor in self.monitors.monitors() {
            let report = monitor.usage_report();
            log::debug!(
                "{} ({:?}): {} in use, peak {:?}, capacity {:?}",
                monitor.monitor_id(),
                monitor.resource_type(),
                report.current,
                report.peak,
                report.capacity
            );
        }
        self.last_update = Instant::now();
        true
    }

    /// The metrics registry.
    pub fn metrics_registry(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// The monitor registry.
    pub fn monitor_registry(&self) -> &MonitorRegistry {
        &self.monitors
    }
}

impl Default for TelemetryService {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_core::telemetry::{MonitoredResourceType, ResourceMonitor, ResourceUsageReport};
    use std::borrow::Cow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct CountingMonitor {
        updates: AtomicUsize,
    }

    impl ResourceMonitor for CountingMonitor {
        fn monitor_id(&self) -> Cow<'static, str> {
            Cow::Borrowed("counting")
        }

        fn resource_type(&self) -> MonitoredResourceType {
            MonitoredResourceType::CommandPool
        }

        fn usage_report(&self) -> ResourceUsageReport {
            ResourceUsageReport::default()
        }

        fn update(&self) {
            self.updates.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_tick_respects_interval() {
        let monitor = Arc::new(CountingMonitor::default());
        let mut service = TelemetryService::new(Duration::ZERO);
        service.monitor_registry().register(monitor.clone());
        assert!(service.tick());
        assert!(service.tick());
        assert_eq!(monitor.updates.load(Ordering::Relaxed), 2);

        let mut slow = TelemetryService::new(Duration::from_secs(3600));
        slow.monitor_registry().register(monitor.clone());
        assert!(!slow.tick());
        assert_eq!(monitor.updates.load(Ordering::Relaxed), 2);
    }
}
