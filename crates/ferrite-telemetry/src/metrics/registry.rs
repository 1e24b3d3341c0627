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

//! Registry for managing metrics.

use crate::storage::{backend::MetricsBackend, memory_backend::InMemoryBackend};
use ferrite_core::telemetry::{Metric, MetricId, MetricType, MetricsError, MetricsResult};
use std::sync::Arc;

/// Entry point of the metrics system.
///
/// Registration returns a typed handle that updates the metric without going
/// through the registry again.
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    backend: Arc<dyn MetricsBackend>,
}

impl MetricsRegistry {
    /// Creates a registry over an [`InMemoryBackend`].
    pub fn new() -> Self {
        Self {
            backend: Arc::new(InMemoryBackend::new()),
        }
    }

    /// Creates a registry over a custom backend.
    pub fn with_backend(backend: Arc<dyn MetricsBackend>) -> Self {
        Self { backend }
    }

    /// Registers a counter starting at zero.
    pub fn register_counter(
        &self,
        id: MetricId,
        description: impl Into<String>,
    ) -> MetricsResult<CounterHandle> {
        self.backend
            .put_metric(Metric::new_counter(id.clone(), description, 0))?;
        Ok(CounterHandle {
            id,
            backend: self.backend.clone(),
        })
    }

    /// Registers a gauge starting at zero.
    pub fn register_gauge(
        &self,
        id: MetricId,
        description: impl Into<String>,
        unit: impl Into<String>,
    ) -> MetricsResult<GaugeHandle> {
        self.backend
            .put_metric(Metric::new_gauge(id.clone(), description, unit, 0.0))?;
        Ok(GaugeHandle {
            id,
            backend: self.backend.clone(),
        })
    }

    /// Returns a copy of a metric.
    pub fn metric(&self, id: &MetricId) -> MetricsResult<Metric> {
        self.backend.get_metric(id)
    }

    /// Whether a metric is registered under `id`.
    pub fn contains_metric(&self, id: &MetricId) -> bool {
        self.backend.contains_metric(id)
    }

    /// Every metric of a namespace.
    pub fn namespace_metrics(&self, namespace: &str) -> Vec<Metric> {
        self.backend
            .list_all_metrics()
            .into_iter()
            .filter(|metric| metric.metadata.id.namespace == namespace)
            .collect()
    }

    /// Number of registered metrics.
    pub fn metric_count(&self) -> usize {
        self.backend.metric_count()
    }

    /// Removes every metric.
    pub fn clear_all(&self) -> MetricsResult<()> {
        self.backend.clear_all()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered counter.
#[derive(Debug, Clone)]
pub struct CounterHandle {
    id: MetricId,
    backend: Arc<dyn MetricsBackend>,
}

impl CounterHandle {
    /// Adds one.
    pub fn increment(&self) -> MetricsResult<u64> {
        self.backend.increment_counter(&self.id, 1)
    }

    /// Adds `amount`.
    pub fn increment_by(&self, amount: u64) -> MetricsResult<u64> {
        self.backend.increment_counter(&self.id, amount)
    }

    /// The current value.
    pub fn get(&self) -> MetricsResult<u64> {
        let metric = self.backend.get_metric(&self.id)?;
        metric
            .value
            .as_counter()
            .ok_or(MetricsError::TypeMismatch {
                expected: MetricType::Counter,
                found: metric.value.metric_type(),
            })
    }

    /// The metric id.
    pub fn id(&self) -> &MetricId {
        &self.id
    }
}

/// Handle to a registered gauge.
#[derive(Debug, Clone)]
pub struct GaugeHandle {
    id: MetricId,
    backend: Arc<dyn MetricsBackend>,
}

impl GaugeHandle {
    /// Sets the value.
    pub fn set(&self, value: f64) -> MetricsResult<()> {
        self.backend.set_gauge(&self.id, value)
    }

    /// The current value.
    pub fn get(&self) -> MetricsResult<f64> {
        let metric = self.backend.get_metric(&self.id)?;
        metric.value.as_gauge().ok_or(MetricsError::TypeMismatch {
            expected: MetricType::Gauge,
            found: metric.value.metric_type(),
        })
    }

    /// The metric id.
    pub fn id(&self) -> &MetricId {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_creation() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.metric_count(), 0);
    }

    #[test]
    fn test_counter_registration_and_operations() {
        let registry = MetricsRegistry::new();
        let counter = registry
            .register_counter(MetricId::new("rhi", "frames"), "Frames begun")
            .unwrap();

        assert_eq!(counter.increment().unwrap(), 1);
        assert_eq!(counter.increment_by(5).unwrap(), 6);
        assert_eq!(counter.get().unwrap(), 6);
        assert!(registry.contains_metric(counter.id()));
    }

    #[test]
    fn test_gauge_registration_and_operations() {
        let registry = MetricsRegistry::new();
        let gauge = registry
            .register_gauge(
                MetricId::new("rhi", "deferred_pending"),
                "Deferred deletions waiting",
                "count",
            )
            .unwrap();

        gauge.set(12.0).unwrap();
        assert_eq!(gauge.get().unwrap(), 12.0);
    }

    #[test]
    fn test_labeled_metrics_are_distinct() {
        let registry = MetricsRegistry::new();
        let id = MetricId::new("rhi", "online_blocks_free");
        registry
            .register_gauge(id.clone().with_label("kind", "resource"), "free", "count")
            .unwrap();
        registry
            .register_gauge(id.with_label("kind", "sampler"), "free", "count")
            .unwrap();
        registry
            .register_counter(MetricId::new("upload", "pages"), "pages")
            .unwrap();

        assert_eq!(registry.metric_count(), 3);
        assert_eq!(registry.namespace_metrics("rhi").len(), 2);
        registry.clear_all().unwrap();
        assert_eq!(registry.metric_count(), 0);
    }
}
