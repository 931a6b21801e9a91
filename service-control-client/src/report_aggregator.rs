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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use service_control_types::{Importance, MetricKind, ReportRequest};
use tokio::time::Instant;
use tracing::debug;

use crate::cache::{EvictingCache, EvictionPolicy};
use crate::config::ReportAggregationConfig;
use crate::error::{ClientError, ClientResult};
use crate::flush_buffer::{FlushBuffer, FlushCallbackSlot};
use crate::operation_aggregator::OperationAggregator;
use crate::signature::{operation_signature, Signature};

/// A report request can carry many operations: outbound requests produced by
/// a single locked section merge until they reach this many operations.
/// An operation serializes to roughly 4 KiB and the server caps requests at
/// 1 MiB, so 100 leaves comfortable headroom.
pub const MAX_OPERATIONS_PER_REQUEST: usize = 100;

/// What the caller must do with a report after offering it to the aggregator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReportDecision {
    /// The operations were buffered; they will reach the server through a
    /// later flush.
    Aggregated,
    /// The request cannot be buffered (high-importance operations or caching
    /// disabled) and must be sent to the server directly.
    SendDirectly,
}

/// Buffers and merges low-importance report operations, keyed by their
/// signature, and batches them into few upstream requests on the way out.
///
/// Entries leave the cache when they age past the flush interval, when
/// capacity evicts them, or on shutdown; every departure turns into an
/// outbound request handed to the flush callback.
pub struct ReportAggregator {
    service_name: String,
    metric_kinds: Arc<HashMap<String, MetricKind>>,
    /// `None` when caching is disabled.
    cache: Option<Mutex<EvictingCache<Signature, OperationAggregator>>>,
    flush_callback: FlushCallbackSlot<ReportRequest>,
    flush_interval: Duration,
}

impl ReportAggregator {
    /// Creates an aggregator for `service_name`. Metrics absent from
    /// `metric_kinds` aggregate as deltas.
    pub fn new(
        service_name: &str,
        config: ReportAggregationConfig,
        metric_kinds: Arc<HashMap<String, MetricKind>>,
    ) -> Self {
        let cache = config.caching_enabled().then(|| {
            Mutex::new(EvictingCache::new(
                config.num_entries,
                EvictionPolicy::MaxAge(config.flush_interval()),
            ))
        });
        ReportAggregator {
            service_name: service_name.to_string(),
            metric_kinds,
            cache,
            flush_callback: FlushCallbackSlot::new(),
            flush_interval: config.flush_interval(),
        }
    }

    /// Registers the callback receiving the requests emitted by evictions.
    pub fn set_flush_callback(&self, callback: impl Fn(ReportRequest) + Send + Sync + 'static) {
        self.flush_callback.set(callback);
    }

    /// Detaches the flush callback; subsequent evictions emit nothing.
    pub fn clear_flush_callback(&self) {
        self.flush_callback.clear();
    }

    /// Offers a report to the cache.
    ///
    /// Low-importance operations are merged into the entry sharing their
    /// signature, or inserted fresh. Capacity evictions triggered by the
    /// inserts go out through the flush callback before this returns.
    pub fn report(&self, request: &ReportRequest) -> ClientResult<ReportDecision> {
        if request.service_name != self.service_name {
            return Err(ClientError::invalid_argument(format!(
                "invalid service name `{}`, expecting `{}`",
                request.service_name, self.service_name
            )));
        }
        let Some(cache) = &self.cache else {
            return Ok(ReportDecision::SendDirectly);
        };
        if request
            .operations
            .iter()
            .any(|operation| operation.importance != Importance::Low)
        {
            return Ok(ReportDecision::SendDirectly);
        }

        let mut buffer = FlushBuffer::new();
        {
            let mut cache_guard = cache.lock().unwrap();
            for operation in &request.operations {
                let signature = operation_signature(operation);
                if let Some(aggregator) = cache_guard.peek_mut(&signature) {
                    aggregator.merge_operation(operation.clone());
                } else {
                    let aggregator =
                        OperationAggregator::new(operation.clone(), self.metric_kinds.clone());
                    let mut evicted = Vec::new();
                    cache_guard.insert(signature, aggregator, &mut evicted);
                    self.buffer_evicted(evicted, &mut buffer);
                }
            }
        }
        self.flush_callback.deliver(buffer);
        Ok(ReportDecision::Aggregated)
    }

    /// When the next [`ReportAggregator::flush`] should run, or `None` for
    /// never (caching disabled).
    pub fn next_flush_interval(&self) -> Option<Duration> {
        self.cache.as_ref().map(|_| self.flush_interval)
    }

    /// Sends the operations that aged past the flush interval out through
    /// the flush callback, batched up to [`MAX_OPERATIONS_PER_REQUEST`].
    pub fn flush(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let mut buffer = FlushBuffer::new();
        {
            let mut cache_guard = cache.lock().unwrap();
            let evicted = cache_guard.remove_expired(Instant::now());
            self.buffer_evicted(evicted, &mut buffer);
        }
        self.flush_callback.deliver(buffer);
    }

    /// Drains every buffered operation through the flush callback. Called on
    /// shutdown, after the callback has been detached when the drain must be
    /// silent.
    pub fn flush_all(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let mut buffer = FlushBuffer::new();
        {
            let mut cache_guard = cache.lock().unwrap();
            debug!(service_name = %self.service_name, num_entries = cache_guard.len(), "removing all report cache entries");
            let evicted = cache_guard.drain();
            self.buffer_evicted(evicted, &mut buffer);
        }
        self.flush_callback.deliver(buffer);
    }

    fn buffer_evicted(
        &self,
        evicted: Vec<OperationAggregator>,
        buffer: &mut FlushBuffer<ReportRequest>,
    ) {
        for aggregator in evicted {
            let request = ReportRequest {
                service_name: self.service_name.clone(),
                operations: vec![aggregator.into_operation()],
            };
            buffer.push_merged(request, merge_report_requests);
        }
    }
}

/// Appends the operations of `request` to `tail` when both target the same
/// service and the combined operation count stays within the batching cap;
/// otherwise gives `request` back to be sent separately.
fn merge_report_requests(tail: &mut ReportRequest, request: ReportRequest) -> Option<ReportRequest> {
    if tail.service_name != request.service_name
        || tail.operations.len() + request.operations.len() > MAX_OPERATIONS_PER_REQUEST
    {
        return Some(request);
    }
    tail.operations.extend(request.operations);
    None
}

#[cfg(test)]
mod tests {
    use service_control_types::{MetricValue, MetricValuePayload, MetricValueSet, Operation};

    use super::*;

    const SERVICE_NAME: &str = "pets.test.local";
    const METRIC_NAME: &str = "api/consumer/request_count";

    fn report_request(operation_name: &str, count: i64) -> ReportRequest {
        ReportRequest {
            service_name: SERVICE_NAME.to_string(),
            operations: vec![Operation {
                operation_id: "operation-1".to_string(),
                operation_name: operation_name.to_string(),
                consumer_id: "project:1234".to_string(),
                metric_value_sets: vec![MetricValueSet {
                    metric_name: METRIC_NAME.to_string(),
                    metric_values: vec![MetricValue::new(MetricValuePayload::Int64(count))],
                }],
                ..Default::default()
            }],
        }
    }

    fn aggregator_with_options(config: ReportAggregationConfig) -> Arc<ReportAggregator> {
        Arc::new(ReportAggregator::new(
            SERVICE_NAME,
            config,
            Arc::new(HashMap::new()),
        ))
    }

    fn test_aggregator() -> (Arc<ReportAggregator>, Arc<Mutex<Vec<ReportRequest>>>) {
        let aggregator = aggregator_with_options(ReportAggregationConfig::new(1, 1_000));
        let flushed: Arc<Mutex<Vec<ReportRequest>>> = Arc::default();
        let flushed_clone = flushed.clone();
        aggregator.set_flush_callback(move |request| {
            flushed_clone.lock().unwrap().push(request);
        });
        (aggregator, flushed)
    }

    fn request_count(request: &ReportRequest, operation_index: usize) -> i64 {
        match &request.operations[operation_index].metric_value_sets[0].metric_values[0].payload {
            MetricValuePayload::Int64(count) => *count,
            other => panic!("expected an int64 count, got {other:?}"),
        }
    }

    #[test]
    fn test_mismatched_service_name_is_rejected() {
        let (aggregator, flushed) = test_aggregator();
        let mut request = report_request("Pets.List", 1);
        request.service_name = "some-other-service-name".to_string();
        let error = aggregator.report(&request).unwrap_err();
        assert_eq!(error.kind(), crate::ClientErrorKind::InvalidArgument);
        assert!(flushed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_report_without_operations_is_accepted() {
        let (aggregator, flushed) = test_aggregator();
        let request = ReportRequest {
            service_name: SERVICE_NAME.to_string(),
            operations: Vec::new(),
        };
        assert_eq!(
            aggregator.report(&request).unwrap(),
            ReportDecision::Aggregated
        );
        assert!(flushed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_high_importance_reports_are_sent_directly() {
        let (aggregator, flushed) = test_aggregator();
        let mut request = report_request("Pets.List", 1);
        request.operations[0].importance = Importance::High;
        assert_eq!(
            aggregator.report(&request).unwrap(),
            ReportDecision::SendDirectly
        );
        aggregator.flush_all();
        assert!(flushed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disabled_cache_sends_directly() {
        let aggregator = aggregator_with_options(ReportAggregationConfig::new(0, 1_000));
        let request = report_request("Pets.List", 1);
        assert_eq!(
            aggregator.report(&request).unwrap(),
            ReportDecision::SendDirectly
        );
        assert_eq!(aggregator.next_flush_interval(), None);
    }

    #[test]
    fn test_aggregated_report_goes_out_on_flush_all() {
        let (aggregator, flushed) = test_aggregator();
        let request = report_request("Pets.List", 7);
        assert_eq!(
            aggregator.report(&request).unwrap(),
            ReportDecision::Aggregated
        );
        assert!(flushed.lock().unwrap().is_empty());

        aggregator.flush_all();
        let flushed = flushed.lock().unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0], request);
    }

    #[test]
    fn test_same_signature_reports_merge() {
        let (aggregator, flushed) = test_aggregator();
        aggregator
            .report(&report_request("Pets.List", 7))
            .unwrap();
        aggregator
            .report(&report_request("Pets.List", 5))
            .unwrap();
        assert!(flushed.lock().unwrap().is_empty());

        aggregator.flush_all();
        let flushed = flushed.lock().unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].operations.len(), 1);
        assert_eq!(request_count(&flushed[0], 0), 12);
    }

    #[test]
    fn test_capacity_eviction_flushes_the_oldest_entry() {
        let (aggregator, flushed) = test_aggregator();
        let request1 = report_request("Pets.List", 7);
        let mut request2 = report_request("Pets.List", 3);
        request2.operations[0]
            .labels
            .insert("key1".to_string(), "value1".to_string());

        aggregator.report(&request1).unwrap();
        assert!(flushed.lock().unwrap().is_empty());

        // The distinct signature exceeds the single-entry capacity and
        // pushes the first operation out immediately.
        aggregator.report(&request2).unwrap();
        {
            let flushed = flushed.lock().unwrap();
            assert_eq!(flushed.len(), 1);
            assert_eq!(flushed[0], request1);
        }

        aggregator.flush_all();
        let flushed = flushed.lock().unwrap();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[1], request2);
    }

    #[tokio::test]
    async fn test_entries_age_out_after_the_flush_interval() {
        tokio::time::pause();
        let (aggregator, flushed) = test_aggregator();
        let request = report_request("Pets.List", 7);
        aggregator.report(&request).unwrap();

        aggregator.flush();
        assert!(flushed.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_millis(1_200)).await;
        aggregator.flush();
        let flushed = flushed.lock().unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0], request);
    }

    #[tokio::test]
    async fn test_merging_does_not_extend_an_entry_lifetime() {
        tokio::time::pause();
        let (aggregator, flushed) = test_aggregator();
        aggregator.report(&report_request("Pets.List", 1)).unwrap();

        // Keep merging into the entry while it ages: age-based eviction
        // still fires at the original insertion time.
        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(400)).await;
            aggregator.report(&report_request("Pets.List", 1)).unwrap();
        }
        aggregator.flush();
        let flushed = flushed.lock().unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(request_count(&flushed[0], 0), 4);
    }

    #[test]
    fn test_flushed_requests_batch_up_to_the_operation_cap() {
        let aggregator = aggregator_with_options(ReportAggregationConfig::new(500, 1_000));
        let flushed: Arc<Mutex<Vec<ReportRequest>>> = Arc::default();
        let flushed_clone = flushed.clone();
        aggregator.set_flush_callback(move |request| {
            flushed_clone.lock().unwrap().push(request);
        });

        // 250 distinct signatures, all buffered.
        for index in 0..250 {
            aggregator
                .report(&report_request(&format!("Pets.Get/{index}"), 1))
                .unwrap();
        }
        aggregator.flush_all();

        let flushed = flushed.lock().unwrap();
        assert_eq!(flushed.len(), 3);
        assert!(flushed
            .iter()
            .all(|request| request.operations.len() <= MAX_OPERATIONS_PER_REQUEST));
        let total_operations: usize = flushed
            .iter()
            .map(|request| request.operations.len())
            .sum();
        assert_eq!(total_operations, 250);
    }

    #[test]
    fn test_flush_callback_may_reenter_the_aggregator() {
        let aggregator = aggregator_with_options(ReportAggregationConfig::new(1, 1_000));
        let flushed: Arc<Mutex<Vec<ReportRequest>>> = Arc::default();
        let flushed_clone = flushed.clone();
        let aggregator_clone = aggregator.clone();
        aggregator.set_flush_callback(move |request| {
            // Re-entering the aggregator from the callback must not deadlock.
            aggregator_clone.flush();
            flushed_clone.lock().unwrap().push(request);
        });

        let request1 = report_request("Pets.List", 7);
        let mut request2 = report_request("Pets.List", 3);
        request2.operations[0]
            .labels
            .insert("key1".to_string(), "value1".to_string());
        aggregator.report(&request1).unwrap();
        aggregator.report(&request2).unwrap();
        assert_eq!(flushed.lock().unwrap().len(), 1);
    }
}
