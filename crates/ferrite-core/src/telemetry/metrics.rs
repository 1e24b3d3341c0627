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

//! Metric identifiers, values and errors.

use std::fmt::{self, Display};
use std::time::Instant;
use thiserror::Error;

/// A structured metric identifier: `namespace:name[label=value,...]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricId {
    /// The broad category of the metric (e.g., "rhi").
    pub namespace: String,
    /// The metric name (e.g., "allocators_created").
    pub name: String,
    /// Key-value labels, kept sorted by key.
    pub labels: Vec<(String, String)>,
}

impl MetricId {
    /// Creates an unlabeled id.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            labels: Vec::new(),
        }
    }

    /// Adds a label, keeping labels sorted so equal ids hash equally.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self.labels.sort_by(|a, b| a.0.cmp(&b.0));
        self
    }
}

impl Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)?;
        if !self.labels.is_empty() {
            let labels = self
                .labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            write!(f, "[{labels}]")?;
        }
        Ok(())
    }
}

/// The fundamental type of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    /// Monotonic count.
    Counter,
    /// Value that can go up or down.
    Gauge,
}

/// The current value of a metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    /// Counter value.
    Counter(u64),
    /// Gauge value.
    Gauge(f64),
}

impl MetricValue {
    /// Returns the [`MetricType`] of this value.
    pub fn metric_type(&self) -> MetricType {
        match self {
            MetricValue::Counter(_) => MetricType::Counter,
            MetricValue::Gauge(_) => MetricType::Gauge,
        }
    }

    /// Returns the value if this is a counter.
    pub fn as_counter(&self) -> Option<u64> {
        match self {
            MetricValue::Counter(v) => Some(*v),
            MetricValue::Gauge(_) => None,
        }
    }

    /// Returns the value if this is a gauge.
    pub fn as_gauge(&self) -> Option<f64> {
        match self {
            MetricValue::Gauge(v) => Some(*v),
            MetricValue::Counter(_) => None,
        }
    }
}

/// Descriptive metadata of a registered metric.
#[derive(Debug, Clone)]
pub struct MetricMetadata {
    /// The metric id.
    pub id: MetricId,
    /// The metric type.
    pub metric_type: MetricType,
    /// Human-readable description.
    pub description: String,
    /// Unit of measurement (e.g., "count", "bytes").
    pub unit: String,
    /// Last update time.
    pub last_updated: Instant,
}

/// A registered metric and its current value.
#[derive(Debug, Clone)]
pub struct Metric {
    /// Static description.
    pub metadata: MetricMetadata,
    /// Current value.
    pub value: MetricValue,
}

impl Metric {
    /// Creates a counter starting at `initial_value`.
    pub fn new_counter(id: MetricId, description: impl Into<String>, initial_value: u64) -> Self {
        Self {
            metadata: MetricMetadata {
                id,
                metric_type: MetricType::Counter,
                description: description.into(),
                unit: "count".to_string(),
                last_updated: Instant::now(),
            },
            value: MetricValue::Counter(initial_value),
        }
    }

    /// Creates a gauge starting at `initial_value`.
    pub fn new_gauge(
        id: MetricId,
        description: impl Into<String>,
        unit: impl Into<String>,
        initial_value: f64,
    ) -> Self {
        Self {
            metadata: MetricMetadata {
                id,
                metric_type: MetricType::Gauge,
                description: description.into(),
                unit: unit.into(),
                last_updated: Instant::now(),
            },
            value: MetricValue::Gauge(initial_value),
        }
    }

    /// Marks the metric as updated now.
    pub fn touch(&mut self) {
        self.metadata.last_updated = Instant::now();
    }
}

/// A specialized `Result` type for metric operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// An error of the metrics system.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricsError {
    /// No metric is registered under this id.
    #[error("Metric not found: {0}")]
    MetricNotFound(MetricId),
    /// The operation does not apply to the metric's type.
    #[error("Type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch {
        /// The type the operation needs.
        expected: MetricType,
        /// The type of the stored metric.
        found: MetricType,
    },
    /// The storage backend failed.
    #[error("Storage error: {0}")]
    StorageError(String),
}
