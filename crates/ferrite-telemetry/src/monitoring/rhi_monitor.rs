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

//! Publishes RHI pool and heap statistics as gauges.

use crate::metrics::registry::{GaugeHandle, MetricsRegistry};
use ferrite_core::rhi::{DescriptorHeapKind, QueueType, RhiStats};
use ferrite_core::telemetry::{
    MetricId, MetricsResult, MonitoredResourceType, ResourceMonitor, ResourceUsageReport,
};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::HashMap;

const NAMESPACE: &str = "rhi";

fn kind_label(kind: DescriptorHeapKind) -> &'static str {
    match kind {
        DescriptorHeapKind::Resource => "resource",
        DescriptorHeapKind::Sampler => "sampler",
        DescriptorHeapKind::RenderTarget => "render_target",
        DescriptorHeapKind::DepthStencil => "depth_stencil",
    }
}

#[derive(Debug)]
struct QueueGauges {
    allocators_created: GaugeHandle,
    allocators_pooled: GaugeHandle,
    lists_created: GaugeHandle,
    last_signaled: GaugeHandle,
    completed: GaugeHandle,
}

/// Turns [`RhiStats`] snapshots into `rhi:*` gauges.
///
/// Fed by push: call [`record`](Self::record) with `RhiDevice::stats()`
/// once per frame. As a [`ResourceMonitor`] it reports offline descriptor
/// usage across every heap kind.
#[derive(Debug)]
pub struct RhiMonitor {
    queues: Vec<QueueGauges>,
    offline_in_use: HashMap<DescriptorHeapKind, GaugeHandle>,
    offline_capacity: HashMap<DescriptorHeapKind, GaugeHandle>,
    online_blocks_free: HashMap<DescriptorHeapKind, GaugeHandle>,
    upload_pages_created: GaugeHandle,
    upload_pages_pooled: GaugeHandle,
    deferred_pending: GaugeHandle,
    device_lost: GaugeHandle,
    report: Mutex<ResourceUsageReport>,
}

impl RhiMonitor {
    /// Registers every gauge in `registry`.
    pub fn new(registry: &MetricsRegistry) -> MetricsResult<Self> {
        let gauge = |name: &str, description: &str| {
            registry.register_gauge(MetricId::new(NAMESPACE, name), description, "count")
        };
        let queue_gauge = |name: &str, queue: QueueType, description: &str| {
            registry.register_gauge(
                MetricId::new(NAMESPACE, name).with_label("queue", queue.name()),
                description,
                "count",
            )
        };
        let kind_gauge = |name: &str, kind: DescriptorHeapKind, description: &str| {
            registry
                .register_gauge(
                    MetricId::new(NAMESPACE, name).with_label("kind", kind_label(kind)),
                    description,
                    "count",
                )
                .map(|handle| (kind, handle))
        };

        let queues = QueueType::ALL
            .into_iter()
            .map(|queue| -> MetricsResult<QueueGauges> {
                Ok(QueueGauges {
                    allocators_created: queue_gauge(
                        "allocators_created",
                        queue,
                        "Command allocators created",
                    )?,
                    allocators_pooled: queue_gauge(
                        "allocators_pooled",
                        queue,
                        "Command allocators waiting in the pool",
                    )?,
                    lists_created: queue_gauge("lists_created", queue, "Command lists created")?,
                    last_signaled: queue_gauge(
                        "fence_last_signaled",
                        queue,
                        "Last value signaled on the queue fence",
                    )?,
                    completed: queue_gauge(
                        "fence_completed",
                        queue,
                        "Last completed value observed on the queue fence",
                    )?,
                })
            })
            .collect::<MetricsResult<Vec<_>>>()?;

        let offline_in_use = DescriptorHeapKind::ALL
            .into_iter()
            .map(|kind| {
                kind_gauge(
                    "offline_descriptors_in_use",
                    kind,
                    "Offline descriptors handed out",
                )
            })
            .collect::<MetricsResult<HashMap<_, _>>>()?;
        let offline_capacity = DescriptorHeapKind::ALL
            .into_iter()
            .map(|kind| {
                kind_gauge(
                    "offline_descriptor_capacity",
                    kind,
                    "Offline descriptor capacity across segments",
                )
            })
            .collect::<MetricsResult<HashMap<_, _>>>()?;
        let online_blocks_free = DescriptorHeapKind::ALL
            .into_iter()
            .filter(|kind| kind.supports_shader_visibility())
            .map(|kind| {
                kind_gauge(
                    "online_blocks_free",
                    kind,
                    "Shader-visible descriptor blocks ready for reuse",
                )
            })
            .collect::<MetricsResult<HashMap<_, _>>>()?;

        Ok(Self {
            queues,
            offline_in_use,
            offline_capacity,
            online_blocks_free,
            upload_pages_created: gauge("upload_pages_created", "Upload pages created")?,
            upload_pages_pooled: gauge("upload_pages_pooled", "Upload pages waiting for reuse")?,
            deferred_pending: gauge("deferred_pending", "Deferred deletions waiting on fences")?,
            device_lost: gauge("device_lost", "1 while the device is removed")?,
            report: Mutex::new(ResourceUsageReport::default()),
        })
    }

    /// Publishes a statistics snapshot.
    pub fn record(&self, stats: &RhiStats) -> MetricsResult<()> {
        for queue in &stats.queues {
            let gauges = &self.queues[queue.queue.index()];
            gauges
                .allocators_created
                .set(queue.allocators_created as f64)?;
            gauges
                .allocators_pooled
                .set(queue.allocators_pooled as f64)?;
            gauges.lists_created.set(queue.lists_created as f64)?;
            gauges.last_signaled.set(queue.last_signaled as f64)?;
            gauges.completed.set(queue.completed as f64)?;
        }

        let mut in_use = 0;
        let mut capacity = 0;
        for heap in &stats.offline_heaps {
            if let Some(gauge) = self.offline_in_use.get(&heap.kind) {
                gauge.set(heap.in_use as f64)?;
            }
            if let Some(gauge) = self.offline_capacity.get(&heap.kind) {
                gauge.set(heap.capacity as f64)?;
            }
            in_use += heap.in_use as u64;
            capacity += heap.capacity as u64;
        }
        for heap in &stats.online_heaps {
            if let Some(gauge) = self.online_blocks_free.get(&heap.kind) {
                gauge.set(heap.free_blocks as f64)?;
            }
        }

        self.upload_pages_created
            .set(stats.upload_pages_created as f64)?;
        self.upload_pages_pooled
            .set(stats.upload_pages_pooled as f64)?;
        self.deferred_pending.set(stats.deferred_pending as f64)?;
        self.device_lost
            .set(if stats.device_lost { 1.0 } else { 0.0 })?;

        let mut report = self.report.lock();
        report.current = in_use;
        report.peak = Some(report.peak.unwrap_or(0).max(in_use));
        report.capacity = Some(capacity);
        Ok(())
    }
}

impl ResourceMonitor for RhiMonitor {
    fn monitor_id(&self) -> Cow<'static, str> {
        Cow::Borrowed("rhi_descriptors")
    }

    fn resource_type(&self) -> MonitoredResourceType {
        MonitoredResourceType::DescriptorHeap
    }

    fn usage_report(&self) -> ResourceUsageReport {
        *self.report.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_core::rhi::{OfflineHeapStats, OnlineHeapStats, QueueStats};

    fn stats(in_use: usize) -> RhiStats {
        RhiStats {
            queues: vec![QueueStats {
                queue: QueueType::Compute,
                last_signaled: 9,
                completed: 7,
                allocators_created: 3,
                allocators_pooled: 1,
                lists_created: 2,
                lists_pooled: 2,
            }],
            offline_heaps: vec![OfflineHeapStats {
                kind: DescriptorHeapKind::Resource,
                segments: 1,
                capacity: 64,
                in_use,
            }],
            online_heaps: vec![OnlineHeapStats {
                kind: DescriptorHeapKind::Sampler,
                block_count: 8,
                free_blocks: 5,
            }],
            upload_pages_created: 4,
            upload_pages_pooled: 2,
            deferred_pending: 6,
            device_lost: false,
        }
    }

    fn gauge(registry: &MetricsRegistry, id: MetricId) -> f64 {
        registry.metric(&id).unwrap().value.as_gauge().unwrap()
    }

    #[test]
    fn test_record_publishes_gauges() {
        let registry = MetricsRegistry::new();
        let monitor = RhiMonitor::new(&registry).unwrap();
        monitor.record(&stats(10)).unwrap();

        let allocators =
            MetricId::new("rhi", "allocators_created").with_label("queue", "compute");
        assert_eq!(gauge(&registry, allocators), 3.0);
        let free = MetricId::new("rhi", "online_blocks_free").with_label("kind", "sampler");
        assert_eq!(gauge(&registry, free), 5.0);
        assert_eq!(gauge(&registry, MetricId::new("rhi", "deferred_pending")), 6.0);
    }

    #[test]
    fn test_usage_report_tracks_peak() {
        let registry = MetricsRegistry::new();
        let monitor = RhiMonitor::new(&registry).unwrap();
        monitor.record(&stats(10)).unwrap();
        monitor.record(&stats(4)).unwrap();

        let report = monitor.usage_report();
        assert_eq!(report.current, 4);
        assert_eq!(report.peak, Some(10));
        assert_eq!(report.capacity, Some(64));
    }
}
