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
use std::fmt;

use service_control_types::{MetricValue, Operation};

/// Byte separating fields folded into a signature, so that adjacent fields
/// cannot alias each other.
const DELIMITER: &[u8] = b"\0";

/// A 16-byte digest identifying semantically equivalent operations, metric
/// values, or check requests for the purpose of aggregation.
///
/// Signatures are deterministic across processes for byte-identical inputs:
/// labels are folded in key order, so two operations differing only in label
/// or metric-value-set insertion order hash identically.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct Signature([u8; 16]);

impl fmt::Debug for Signature {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        for byte in &self.0 {
            write!(formatter, "{byte:02x}")?;
        }
        Ok(())
    }
}

fn consume_labels(context: &mut md5::Context, labels: &BTreeMap<String, String>) {
    for (key, value) in labels {
        context.consume(DELIMITER);
        context.consume(key.as_bytes());
        context.consume(DELIMITER);
        context.consume(value.as_bytes());
    }
}

/// Computes the identity of an operation on the report path: consumer,
/// operation name, and labels.
pub(crate) fn operation_signature(operation: &Operation) -> Signature {
    let mut context = md5::Context::new();
    context.consume(operation.consumer_id.as_bytes());
    context.consume(DELIMITER);
    context.consume(operation.operation_name.as_bytes());
    consume_labels(&mut context, &operation.labels);
    Signature(context.compute().0)
}

/// Computes the identity of a metric value within its metric: the labels
/// alone, since the value itself is what gets merged.
pub(crate) fn metric_value_signature(metric_value: &MetricValue) -> Signature {
    let mut context = md5::Context::new();
    consume_labels(&mut context, &metric_value.labels);
    Signature(context.compute().0)
}

/// Computes the identity of a check request: the operation identity plus the
/// names and value identities of every metric value set.
pub(crate) fn check_signature(operation: &Operation) -> Signature {
    let mut context = md5::Context::new();
    context.consume(operation.operation_name.as_bytes());
    context.consume(DELIMITER);
    context.consume(operation.consumer_id.as_bytes());
    context.consume(DELIMITER);
    consume_labels(&mut context, &operation.labels);
    for metric_value_set in &operation.metric_value_sets {
        context.consume(DELIMITER);
        context.consume(metric_value_set.metric_name.as_bytes());
        for metric_value in &metric_value_set.metric_values {
            consume_labels(&mut context, &metric_value.labels);
        }
    }
    context.consume(DELIMITER);
    Signature(context.compute().0)
}
