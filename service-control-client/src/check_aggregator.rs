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

use service_control_types::{CheckRequest, CheckResponse, Importance, MetricKind};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{EvictingCache, EvictionPolicy};
use crate::config::CheckAggregationConfig;
use crate::error::{ClientError, ClientResult};
use crate::flush_buffer::{FlushBuffer, FlushCallbackSlot};
use crate::operation_aggregator::OperationAggregator;
use crate::signature::{check_signature, Signature};

/// Caches check responses and aggregates the quota activity of the checks
/// served from the cache.
///
/// The typical flows, per key:
///
/// - First check: [`CheckAggregator::check`] returns `Ok(None)`, the caller
///   dispatches the request upstream and stores the verdict with
///   [`CheckAggregator::cache_response`]. Subsequent checks are served from
///   the cache and their quota usage accumulates in the entry.
/// - Refresh: once an entry is older than the flush interval, exactly one
///   check gets `Ok(None)` to refresh the verdict upstream while concurrent
///   checks keep being served the stale response.
/// - Expiration: [`CheckAggregator::flush`] drops entries idle longer than
///   the expiration; an entry with accumulated activity is handed to the
///   flush callback as a final check request on its way out.
pub struct CheckAggregator {
    service_name: String,
    metric_kinds: Arc<HashMap<String, MetricKind>>,
    /// `None` when caching is disabled.
    cache: Option<Mutex<EvictingCache<Signature, CacheElem>>>,
    flush_callback: FlushCallbackSlot<CheckRequest>,
    flush_interval: Duration,
    expiration: Duration,
}

/// Cache entry: the last verdict observed upstream plus the activity
/// aggregated since.
struct CacheElem {
    check_response: CheckResponse,
    /// The last time the response was updated. During a refresh this is set
    /// to the refresh dispatch time so that one refresh, not one per check,
    /// goes upstream per flush interval.
    last_check_time: Instant,
    /// Ratio of tokens granted upstream to tokens requested. Carried for
    /// response scaling, which is reserved.
    #[allow(dead_code)]
    quota_scale: i64,
    /// Whether a refresh for this entry is in flight.
    is_flushing: bool,
    operation_aggregator: Option<OperationAggregator>,
}

impl CacheElem {
    fn new(check_response: CheckResponse, now: Instant) -> Self {
        CacheElem {
            check_response,
            last_check_time: now,
            quota_scale: 0,
            is_flushing: false,
            operation_aggregator: None,
        }
    }

    fn aggregate(&mut self, request: &CheckRequest, metric_kinds: &Arc<HashMap<String, MetricKind>>) {
        let Some(operation) = request.operation.clone() else {
            return;
        };
        match &mut self.operation_aggregator {
            Some(aggregator) => aggregator.merge_operation(operation),
            None => {
                self.operation_aggregator =
                    Some(OperationAggregator::new(operation, metric_kinds.clone()));
            }
        }
    }

    /// Takes the accumulated activity out of the entry as a check request,
    /// or `None` when no check was served since the last refresh.
    fn take_pending_request(&mut self, service_name: &str) -> Option<CheckRequest> {
        let aggregator = self.operation_aggregator.take()?;
        Some(CheckRequest {
            service_name: service_name.to_string(),
            operation: Some(aggregator.into_operation()),
        })
    }
}

impl CheckAggregator {
    /// Creates an aggregator for `service_name`. Metrics absent from
    /// `metric_kinds` aggregate as deltas.
    pub fn new(
        service_name: &str,
        config: CheckAggregationConfig,
        metric_kinds: Arc<HashMap<String, MetricKind>>,
    ) -> Self {
        let cache = config.caching_enabled().then(|| {
            Mutex::new(EvictingCache::new(
                config.num_entries,
                EvictionPolicy::IdleTimeout(config.expiration()),
            ))
        });
        CheckAggregator {
            service_name: service_name.to_string(),
            metric_kinds,
            cache,
            flush_callback: FlushCallbackSlot::new(),
            flush_interval: config.flush_interval(),
            expiration: config.expiration(),
        }
    }

    /// Registers the callback receiving the requests emitted by evictions.
    pub fn set_flush_callback(&self, callback: impl Fn(CheckRequest) + Send + Sync + 'static) {
        self.flush_callback.set(callback);
    }

    /// Detaches the flush callback; subsequent evictions emit nothing.
    pub fn clear_flush_callback(&self) {
        self.flush_callback.clear();
    }

    /// Answers a check from the cache.
    ///
    /// Returns `Ok(None)` when the caller must dispatch the request upstream
    /// instead: caching is disabled, the operation is not low-importance, the
    /// key is unknown, or a refresh is due. A non-`None` verdict is the
    /// cached response, stale up to the expiration bound.
    pub fn check(&self, request: &CheckRequest) -> ClientResult<Option<CheckResponse>> {
        if request.service_name != self.service_name {
            return Err(ClientError::invalid_argument(format!(
                "invalid service name `{}`, expecting `{}`",
                request.service_name, self.service_name
            )));
        }
        let Some(operation) = &request.operation else {
            return Err(ClientError::invalid_argument(
                "the operation field is required",
            ));
        };
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        if operation.importance != Importance::Low {
            return Ok(None);
        }

        let signature = check_signature(operation);
        let mut cache_guard = cache.lock().unwrap();
        let Some(elem) = cache_guard.get_mut(&signature) else {
            return Ok(None);
        };
        let now = Instant::now();

        if !elem.check_response.is_pass() {
            // A cached denial is assumed to still hold: serve it without
            // aggregating, and refresh it upstream once per flush interval.
            if now.duration_since(elem.last_check_time) >= self.flush_interval {
                elem.last_check_time = now;
                return Ok(None);
            }
            return Ok(Some(elem.check_response.clone()));
        }

        elem.aggregate(request, &self.metric_kinds);

        if now.duration_since(elem.last_check_time) >= self.flush_interval {
            if elem.is_flushing {
                warn!(
                    service_name = %self.service_name,
                    "the last refresh of a cached check response has not completed yet"
                );
            }
            elem.is_flushing = true;
            // Block further refreshes until the next flush interval.
            elem.last_check_time = now;
            return Ok(None);
        }

        Ok(Some(elem.check_response.clone()))
    }

    /// Stores a verdict received from upstream, making it the served response
    /// for its key and rearming the refresh clock.
    ///
    /// Inserting a new entry may evict older entries beyond capacity; their
    /// pending activity goes out through the flush callback.
    pub fn cache_response(&self, request: &CheckRequest, response: &CheckResponse) {
        let Some(cache) = &self.cache else {
            return;
        };
        let Some(operation) = &request.operation else {
            return;
        };
        let signature = check_signature(operation);
        let mut buffer = FlushBuffer::new();
        {
            let mut cache_guard = cache.lock().unwrap();
            let now = Instant::now();
            if let Some(elem) = cache_guard.get_mut(&signature) {
                elem.last_check_time = now;
                elem.check_response = response.clone();
                elem.quota_scale = 0;
                elem.is_flushing = false;
            } else {
                let mut evicted = Vec::new();
                cache_guard.insert(signature, CacheElem::new(response.clone(), now), &mut evicted);
                self.buffer_evicted(evicted, &mut buffer);
            }
        }
        self.flush_callback.deliver(buffer);
    }

    /// When the next [`CheckAggregator::flush`] should run, or `None` for
    /// never (caching disabled).
    pub fn next_flush_interval(&self) -> Option<Duration> {
        self.cache.as_ref().map(|_| self.expiration)
    }

    /// Drops the entries that have been idle past the expiration, emitting
    /// their pending activity through the flush callback.
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

    /// Drops every entry, emitting pending activity through the flush
    /// callback. Called on shutdown, after the callback has been detached
    /// when the drain must be silent.
    pub fn flush_all(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let mut buffer = FlushBuffer::new();
        {
            let mut cache_guard = cache.lock().unwrap();
            debug!(service_name = %self.service_name, num_entries = cache_guard.len(), "removing all check cache entries");
            let evicted = cache_guard.drain();
            self.buffer_evicted(evicted, &mut buffer);
        }
        self.flush_callback.deliver(buffer);
    }

    fn buffer_evicted(&self, evicted: Vec<CacheElem>, buffer: &mut FlushBuffer<CheckRequest>) {
        for mut elem in evicted {
            // Check requests never merge with each other.
            if let Some(request) = elem.take_pending_request(&self.service_name) {
                buffer.push(request);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use service_control_types::{
        CheckError, CheckErrorCode, MetricValue, MetricValuePayload, MetricValueSet, Operation,
    };

    use super::*;

    const SERVICE_NAME: &str = "pets.test.local";
    const QUOTA_METRIC: &str = "api/consumer/quota_used_count";

    fn quota_request(tokens: i64) -> CheckRequest {
        CheckRequest {
            service_name: SERVICE_NAME.to_string(),
            operation: Some(Operation {
                operation_id: "operation-1".to_string(),
                operation_name: "check-quota".to_string(),
                consumer_id: "project:1234".to_string(),
                metric_value_sets: vec![MetricValueSet {
                    metric_name: QUOTA_METRIC.to_string(),
                    metric_values: vec![MetricValue {
                        labels: [("/quota_group_name".to_string(), "ReadGroup".to_string())]
                            .into(),
                        start_time: None,
                        end_time: None,
                        payload: MetricValuePayload::Int64(tokens),
                    }],
                }],
                ..Default::default()
            }),
        }
    }

    fn pass_response() -> CheckResponse {
        CheckResponse {
            operation_id: "operation-1".to_string(),
            check_errors: Vec::new(),
        }
    }

    fn error_response() -> CheckResponse {
        CheckResponse {
            operation_id: "operation-1".to_string(),
            check_errors: vec![CheckError {
                code: CheckErrorCode::PermissionDenied,
                detail: "dummy error".to_string(),
            }],
        }
    }

    fn aggregator_with_options(config: CheckAggregationConfig) -> Arc<CheckAggregator> {
        Arc::new(CheckAggregator::new(
            SERVICE_NAME,
            config,
            Arc::new(HashMap::new()),
        ))
    }

    fn test_aggregator() -> (Arc<CheckAggregator>, Arc<Mutex<Vec<CheckRequest>>>) {
        let aggregator = aggregator_with_options(CheckAggregationConfig::new(1, 100, 200));
        let flushed: Arc<Mutex<Vec<CheckRequest>>> = Arc::default();
        let flushed_clone = flushed.clone();
        aggregator.set_flush_callback(move |request| {
            flushed_clone.lock().unwrap().push(request);
        });
        (aggregator, flushed)
    }

    fn quota_tokens(request: &CheckRequest) -> i64 {
        let operation = request.operation.as_ref().unwrap();
        match &operation.metric_value_sets[0].metric_values[0].payload {
            MetricValuePayload::Int64(tokens) => *tokens,
            other => panic!("expected an int64 quota value, got {other:?}"),
        }
    }

    #[test]
    fn test_mismatched_service_name_is_rejected() {
        let (aggregator, _) = test_aggregator();
        let mut request = quota_request(1_000);
        request.service_name = "some-other-service-name".to_string();
        let error = aggregator.check(&request).unwrap_err();
        assert_eq!(error.kind(), crate::ClientErrorKind::InvalidArgument);
    }

    #[test]
    fn test_missing_operation_is_rejected() {
        let (aggregator, _) = test_aggregator();
        let mut request = quota_request(1_000);
        request.operation = None;
        let error = aggregator.check(&request).unwrap_err();
        assert_eq!(error.kind(), crate::ClientErrorKind::InvalidArgument);
    }

    #[test]
    fn test_high_importance_bypasses_the_cache() {
        let (aggregator, _) = test_aggregator();
        let mut request = quota_request(1_000);
        request.operation.as_mut().unwrap().importance = Importance::High;
        assert!(aggregator.check(&request).unwrap().is_none());
        aggregator.cache_response(&quota_request(1_000), &pass_response());
        assert!(aggregator.check(&request).unwrap().is_none());
    }

    #[test]
    fn test_disabled_cache_always_misses() {
        let aggregator = aggregator_with_options(CheckAggregationConfig::new(0, 100, 200));
        let request = quota_request(1_000);
        assert!(aggregator.check(&request).unwrap().is_none());
        aggregator.cache_response(&request, &pass_response());
        assert!(aggregator.check(&request).unwrap().is_none());
        assert_eq!(aggregator.next_flush_interval(), None);
    }

    #[test]
    fn test_cached_pass_response_is_served_and_flushed() {
        let (aggregator, flushed) = test_aggregator();
        let request = quota_request(1_000);
        assert!(aggregator.check(&request).unwrap().is_none());

        aggregator.cache_response(&request, &pass_response());
        assert_eq!(aggregator.check(&request).unwrap(), Some(pass_response()));
        assert!(flushed.lock().unwrap().is_empty());

        aggregator.flush_all();
        let flushed = flushed.lock().unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].service_name, SERVICE_NAME);
        assert_eq!(quota_tokens(&flushed[0]), 1_000);
    }

    #[test]
    fn test_cached_error_response_is_served_without_aggregation() {
        let (aggregator, flushed) = test_aggregator();
        let request = quota_request(1_000);
        assert!(aggregator.check(&request).unwrap().is_none());

        aggregator.cache_response(&request, &error_response());
        assert_eq!(aggregator.check(&request).unwrap(), Some(error_response()));

        // Denied entries never accumulate activity, so nothing goes out.
        aggregator.flush_all();
        assert!(flushed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_capacity_eviction_flushes_pending_activity() {
        let (aggregator, flushed) = test_aggregator();
        let request1 = quota_request(1_000);
        let mut request2 = quota_request(2_000);
        request2
            .operation
            .as_mut()
            .unwrap()
            .labels
            .insert("key1".to_string(), "value1".to_string());

        aggregator.cache_response(&request1, &pass_response());
        assert!(aggregator.check(&request1).unwrap().is_some());

        // The second key pushes the first out of the single-entry cache.
        aggregator.cache_response(&request2, &pass_response());
        assert!(aggregator.check(&request2).unwrap().is_some());
        {
            let flushed = flushed.lock().unwrap();
            assert_eq!(flushed.len(), 1);
            assert_eq!(quota_tokens(&flushed[0]), 1_000);
        }

        aggregator.flush_all();
        let flushed = flushed.lock().unwrap();
        assert_eq!(flushed.len(), 2);
        assert_eq!(quota_tokens(&flushed[1]), 2_000);
    }

    #[tokio::test]
    async fn test_refresh_after_flush_interval() {
        tokio::time::pause();
        let (aggregator, flushed) = test_aggregator();
        let request = quota_request(1_000);
        assert!(aggregator.check(&request).unwrap().is_none());

        aggregator.cache_response(&request, &pass_response());
        assert_eq!(aggregator.check(&request).unwrap(), Some(pass_response()));

        tokio::time::advance(Duration::from_millis(120)).await;

        // The first check past the flush interval goes upstream to refresh
        // the verdict; the next one is served the stale response.
        assert!(aggregator.check(&request).unwrap().is_none());
        assert_eq!(aggregator.check(&request).unwrap(), Some(pass_response()));
        assert!(flushed.lock().unwrap().is_empty());

        // All three cache-served checks accumulated into the entry.
        aggregator.flush_all();
        let flushed = flushed.lock().unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(quota_tokens(&flushed[0]), 3_000);
    }

    #[tokio::test]
    async fn test_cached_error_refresh_after_flush_interval() {
        tokio::time::pause();
        let (aggregator, flushed) = test_aggregator();
        let request = quota_request(1_000);
        aggregator.cache_response(&request, &error_response());
        assert_eq!(aggregator.check(&request).unwrap(), Some(error_response()));

        tokio::time::advance(Duration::from_millis(120)).await;
        assert!(aggregator.check(&request).unwrap().is_none());
        assert_eq!(aggregator.check(&request).unwrap(), Some(error_response()));

        aggregator.flush_all();
        assert!(flushed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_entries_are_flushed() {
        tokio::time::pause();
        let (aggregator, flushed) = test_aggregator();
        let request = quota_request(1_000);
        assert!(aggregator.check(&request).unwrap().is_none());
        aggregator.cache_response(&request, &pass_response());
        assert!(aggregator.check(&request).unwrap().is_some());
        assert!(flushed.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_millis(220)).await;
        aggregator.flush();

        // The entry expired and its pending activity went out; the next
        // check is a miss again.
        assert_eq!(flushed.lock().unwrap().len(), 1);
        assert!(aggregator.check(&request).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flush_keeps_fresh_entries() {
        tokio::time::pause();
        let (aggregator, flushed) = test_aggregator();
        let request = quota_request(1_000);
        aggregator.cache_response(&request, &pass_response());
        assert!(aggregator.check(&request).unwrap().is_some());

        tokio::time::advance(Duration::from_millis(50)).await;
        aggregator.flush();
        assert!(flushed.lock().unwrap().is_empty());
        assert!(aggregator.check(&request).unwrap().is_some());
    }

    #[test]
    fn test_flush_callback_may_reenter_the_aggregator() {
        let aggregator = aggregator_with_options(CheckAggregationConfig::new(1, 100, 200));
        let flushed: Arc<Mutex<Vec<CheckRequest>>> = Arc::default();
        let flushed_clone = flushed.clone();
        let aggregator_clone = aggregator.clone();
        aggregator.set_flush_callback(move |request| {
            // Re-enter the aggregator from the callback: this must not
            // deadlock because deliveries happen outside the cache lock.
            aggregator_clone.cache_response(&request, &pass_response());
            flushed_clone.lock().unwrap().push(request);
        });

        let request = quota_request(1_000);
        aggregator.cache_response(&request, &pass_response());
        assert!(aggregator.check(&request).unwrap().is_some());

        aggregator.flush_all();
        assert_eq!(flushed.lock().unwrap().len(), 1);
        // The callback re-cached the response, so the next check hits.
        assert!(aggregator.check(&request).unwrap().is_some());
    }

    #[test]
    fn test_next_flush_interval_is_the_expiration() {
        let (aggregator, _) = test_aggregator();
        assert_eq!(
            aggregator.next_flush_interval(),
            Some(Duration::from_millis(200))
        );
    }
}
