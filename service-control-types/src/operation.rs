// Copyright 2021-Present Datadog, Inc.
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

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::distribution::Distribution;
use crate::money::Money;
use crate::timestamp::Timestamp;

/// How a metric behaves over time, as declared in the service configuration.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Additive over time: values with the same identity are summed.
    #[default]
    Delta,
    /// Monotonic: the value with the most recent end time wins.
    Cumulative,
    /// Instantaneous: the value with the most recent end time wins.
    Gauge,
}

/// Classification deciding whether an operation may be cached and aggregated.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    /// The operation may be buffered, merged, and delivered later.
    #[default]
    Low,
    /// The operation must be sent to the server right away.
    High,
}

/// The typed payload of a [`MetricValue`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricValuePayload {
    /// A signed 64-bit integer value.
    Int64(i64),
    /// A double-precision floating point value.
    Double(f64),
    /// A monetary amount.
    Money(Money),
    /// A histogram of samples.
    Distribution(Distribution),
}

/// A single measurement of a metric, qualified by labels and a time window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    /// Labels qualifying this measurement, keyed by label name.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Start of the time window this value covers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Timestamp>,
    /// End of the time window this value covers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Timestamp>,
    /// The measured value.
    pub payload: MetricValuePayload,
}

impl MetricValue {
    /// Builds a bare metric value with no labels or time window.
    pub fn new(payload: MetricValuePayload) -> Self {
        MetricValue {
            labels: BTreeMap::new(),
            start_time: None,
            end_time: None,
            payload,
        }
    }
}

/// All the measurements reported for one metric.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValueSet {
    /// Name of the metric.
    pub metric_name: String,
    /// The reported values.
    pub metric_values: Vec<MetricValue>,
}

/// A log entry attached to an operation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Name of the log this entry belongs to.
    pub name: String,
    /// When the logged event happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// Labels qualifying the entry.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Free-form structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// One unit of reported activity: who did what, when, with which metric
/// values and log entries attached.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Opaque identifier of this operation instance.
    pub operation_id: String,
    /// Name of the operation, e.g. the RPC method being controlled.
    pub operation_name: String,
    /// Identity of the consumer the operation is accounted to.
    pub consumer_id: String,
    /// Start of the time window the operation covers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Timestamp>,
    /// End of the time window the operation covers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Timestamp>,
    /// Labels qualifying the operation, keyed by label name.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Metric values grouped by metric name.
    #[serde(default)]
    pub metric_value_sets: Vec<MetricValueSet>,
    /// Log entries produced during the operation.
    #[serde(default)]
    pub log_entries: Vec<LogEntry>,
    /// Whether the operation may be cached and aggregated.
    #[serde(default)]
    pub importance: Importance,
}
