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

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::Arc;

use service_control_types::{MetricKind, MetricValue, MetricValuePayload, MetricValueSet, Operation};
use tracing::warn;

use crate::signature::{metric_value_signature, Signature};

/// Accumulates operations sharing the same signature into a single operation.
///
/// Scalar fields come from the first operation; the time window widens to
/// cover every merged operation; log entries append; metric values are
/// re-indexed by `(metric name, value signature)` and merged according to the
/// metric's kind.
pub(crate) struct OperationAggregator {
    /// Everything but the metric value sets, which live re-indexed below.
    operation: Operation,
    /// Aggregated metric values, keyed by metric name, then by the signature
    /// of the value's labels.
    metric_value_sets: BTreeMap<String, BTreeMap<Signature, MetricValue>>,
    /// Metric kinds by metric name; metrics not listed default to delta.
    metric_kinds: Arc<HashMap<String, MetricKind>>,
}

impl OperationAggregator {
    pub fn new(mut operation: Operation, metric_kinds: Arc<HashMap<String, MetricKind>>) -> Self {
        let metric_value_sets = mem::take(&mut operation.metric_value_sets);
        let mut aggregator = OperationAggregator {
            operation,
            metric_value_sets: BTreeMap::new(),
            metric_kinds,
        };
        aggregator.merge_metric_value_sets(metric_value_sets);
        aggregator
    }

    /// Merges an operation assumed to carry the same signature as the one
    /// this aggregator was created from.
    pub fn merge_operation(&mut self, operation: Operation) {
        if let Some(start_time) = operation.start_time {
            if self
                .operation
                .start_time
                .is_none_or(|current| start_time < current)
            {
                self.operation.start_time = Some(start_time);
            }
        }
        if let Some(end_time) = operation.end_time {
            if self
                .operation
                .end_time
                .is_none_or(|current| current < end_time)
            {
                self.operation.end_time = Some(end_time);
            }
        }
        self.operation.log_entries.extend(operation.log_entries);
        self.merge_metric_value_sets(operation.metric_value_sets);
    }

    /// Flattens the aggregator back into an operation. Metric value sets come
    /// out sorted by metric name, values ordered by signature; log entries
    /// keep their insertion order.
    pub fn into_operation(self) -> Operation {
        let mut operation = self.operation;
        operation.metric_value_sets = self
            .metric_value_sets
            .into_iter()
            .map(|(metric_name, metric_values)| MetricValueSet {
                metric_name,
                metric_values: metric_values.into_values().collect(),
            })
            .collect();
        operation
    }

    fn merge_metric_value_sets(&mut self, metric_value_sets: Vec<MetricValueSet>) {
        for metric_value_set in metric_value_sets {
            let metric_kind = self
                .metric_kinds
                .get(&metric_value_set.metric_name)
                .copied()
                .unwrap_or_default();
            let metric_values = self
                .metric_value_sets
                .entry(metric_value_set.metric_name)
                .or_default();
            for metric_value in metric_value_set.metric_values {
                let signature = metric_value_signature(&metric_value);
                match metric_values.entry(signature) {
                    Entry::Vacant(entry) => {
                        entry.insert(metric_value);
                    }
                    Entry::Occupied(mut entry) => {
                        merge_metric_value(metric_kind, metric_value, entry.get_mut());
                    }
                }
            }
        }
    }
}

fn merge_metric_value(metric_kind: MetricKind, from: MetricValue, to: &mut MetricValue) {
    match metric_kind {
        MetricKind::Delta => merge_delta_metric_value(from, to),
        MetricKind::Cumulative | MetricKind::Gauge => {
            merge_cumulative_or_gauge_metric_value(from, to)
        }
    }
}

/// For cumulative and gauge metrics the value with the most recent end time
/// wins; a missing end time counts as the epoch.
fn merge_cumulative_or_gauge_metric_value(from: MetricValue, to: &mut MetricValue) {
    if from.end_time.unwrap_or_default() < to.end_time.unwrap_or_default() {
        return;
    }
    *to = from;
}

/// For delta metrics the time windows merge to their union and the values add
/// pointwise. Gaps or overlaps between the two windows are fine.
fn merge_delta_metric_value(from: MetricValue, to: &mut MetricValue) {
    if mem::discriminant(&from.payload) != mem::discriminant(&to.payload) {
        warn!(?from, ?to, "dropping metric value with a mismatched payload variant");
        return;
    }

    if let Some(start_time) = from.start_time {
        if to.start_time.is_none_or(|current| start_time < current) {
            to.start_time = Some(start_time);
        }
    }
    if let Some(end_time) = from.end_time {
        if to.end_time.is_none_or(|current| current < end_time) {
            to.end_time = Some(end_time);
        }
    }

    match (&mut to.payload, from.payload) {
        (MetricValuePayload::Int64(to_value), MetricValuePayload::Int64(from_value)) => {
            *to_value += from_value;
        }
        (MetricValuePayload::Double(to_value), MetricValuePayload::Double(from_value)) => {
            *to_value += from_value;
        }
        (
            MetricValuePayload::Distribution(to_value),
            MetricValuePayload::Distribution(from_value),
        ) => {
            if let Err(error) = to_value.merge_from(&from_value) {
                warn!(%error, "dropping distribution value with incompatible buckets");
            }
        }
        (MetricValuePayload::Money(to_value), MetricValuePayload::Money(from_value)) => {
            if to_value.currency_code != from_value.currency_code {
                warn!(
                    left = %to_value.currency_code,
                    right = %from_value.currency_code,
                    "dropping money value with a mismatched currency",
                );
            } else {
                *to_value = to_value.saturating_add(&from_value);
            }
        }
        _ => unreachable!("payload variants checked above"),
    }
}
