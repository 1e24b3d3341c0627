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

use crate::storage::backend::MetricsBackend;
use ferrite_core::telemetry::{
    Metric, MetricId, MetricType, MetricValue, MetricsError, MetricsResult,
};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Metrics kept in a map behind a reader-writer lock.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    storage: RwLock<HashMap<MetricId, Metric>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics whose id is in `namespace`.
    pub fn metrics_by_namespace(&self, namespace: &str) -> Vec<Metric> {
        self.storage
            .read()
            .values()
            .filter(|metric| metric.metadata.id.namespace == namespace)
            .cloned()
            .collect()
    }

    /// Metrics of one type.
    pub fn metrics_by_type(&self, metric_type: MetricType) -> Vec<Metric> {
        self.storage
            .read()
            .values()
            .filter(|metric| metric.metadata.metric_type == metric_type)
            .cloned()
            .collect()
    }
}

impl MetricsBackend for InMemoryBackend {
    fn put_metric(&self, metric: Metric) -> MetricsResult<()> {
        self.storage
            .write()
            .insert(metric.metadata.id.clone(), metric);
        Ok(())
    }

    fn get_metric(&self, id: &MetricId) -> MetricsResult<Metric> {
        self.storage
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| MetricsError::MetricNotFound(id.clone()))
    }

    fn contains_metric(&self, id: &MetricId) -> bool {
        self.storage.read().contains_key(id)
    }

    fn remove_metric(&self, id: &MetricId) -> MetricsResult<()> {
        self.storage
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| MetricsError::MetricNotFound(id.clone()))
    }

    fn list_all_metrics(&self) -> Vec<Metric> {
        self.storage.read().values().cloned().collect()
    }

    fn clear_all(&self) -> MetricsResult<()> {
        self.storage.write().clear();
        Ok(())
    }

    fn metric_count(&self) -> usize {
        self.storage.read().len()
    }

    // Overridden to update in place under one write lock.
    fn increment_counter(&self, id: &MetricId, delta: u64) -> MetricsResult<u64> {
        let mut storage = self.storage.write();
        let metric = storage
            .get_mut(id)
            .ok_or_else(|| MetricsError::MetricNotFound(id.clone()))?;
        match metric.value {
            MetricValue::Counter(ref mut value) => {
                *value = value.saturating_add(delta);
                let result = *value;
                metric.touch();
                Ok(result)
            }
            _ => Err(MetricsError::TypeMismatch {
                expected: MetricType::Counter,
                found: metric.value.metric_type(),
            }),
        }
    }
}
