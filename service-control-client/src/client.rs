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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use service_control_types::{CheckRequest, CheckResponse, ReportRequest, ReportResponse};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::error;

use crate::check_aggregator::CheckAggregator;
use crate::config::ClientConfig;
use crate::error::{ClientErrorKind, ClientResult};
use crate::report_aggregator::{ReportAggregator, ReportDecision};
use crate::transport::{CheckTransport, ReportTransport};

#[derive(Debug, Default)]
struct ClientStatistics {
    total_checks: AtomicU64,
    checks_by_flush: AtomicU64,
    checks_in_flight: AtomicU64,
    total_reports: AtomicU64,
    reports_by_flush: AtomicU64,
    reports_in_flight: AtomicU64,
    report_operations: AtomicU64,
}

/// A point-in-time copy of the client counters.
///
/// `report_operations / total_reports` reflects how well report aggregation
/// is doing: each incoming report carries one operation, while each report
/// sent upstream may carry up to a hundred.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    /// Number of check calls received.
    pub total_checks: u64,
    /// Check requests sent upstream by cache flushes.
    pub checks_by_flush: u64,
    /// Check requests sent upstream during check calls (cache misses).
    pub checks_in_flight: u64,
    /// Number of report calls received.
    pub total_reports: u64,
    /// Report requests sent upstream by cache flushes.
    pub reports_by_flush: u64,
    /// Report requests sent upstream during report calls.
    pub reports_in_flight: u64,
    /// Operations carried by the report requests sent upstream.
    pub report_operations: u64,
}

struct InnerClient {
    check_aggregator: Arc<CheckAggregator>,
    report_aggregator: Arc<ReportAggregator>,
    check_transport: Arc<dyn CheckTransport>,
    report_transport: Arc<dyn ReportTransport>,
    statistics: Arc<ClientStatistics>,
    runtime: Handle,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for InnerClient {
    fn drop(&mut self) {
        if let Some(flush_task) = self.flush_task.lock().unwrap().take() {
            flush_task.abort();
        }
    }
}

/// The client façade: a cached, aggregating front for the service control
/// Check and Report calls.
///
/// Cloning is cheap and every clone shares the same caches, transports, and
/// statistics. The client must be created from within a tokio runtime; the
/// runtime handle is captured for the background flush task and the blocking
/// call variants.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use service_control_client::{ClientConfig, ServiceControlClient};
/// # async fn example(
/// #     check_transport: Arc<dyn service_control_client::CheckTransport>,
/// #     report_transport: Arc<dyn service_control_client::ReportTransport>,
/// # ) -> service_control_client::ClientResult<()> {
/// let client = ServiceControlClient::new(
///     "pets.example.com",
///     ClientConfig::default(),
///     check_transport,
///     report_transport,
/// );
/// let response = client.check(build_check_request()).await?;
/// if response.is_pass() {
///     client.report(build_report_request()).await?;
/// }
/// # Ok(())
/// # }
/// # fn build_check_request() -> service_control_types::CheckRequest { todo!() }
/// # fn build_report_request() -> service_control_types::ReportRequest { todo!() }
/// ```
#[derive(Clone)]
pub struct ServiceControlClient {
    inner: Arc<InnerClient>,
}

impl ServiceControlClient {
    /// Creates a client for `service_name` with its aggregators wired to the
    /// given transports.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(
        service_name: &str,
        config: ClientConfig,
        check_transport: Arc<dyn CheckTransport>,
        report_transport: Arc<dyn ReportTransport>,
    ) -> Self {
        let runtime = Handle::current();
        let metric_kinds = Arc::new(config.metric_kinds.clone());
        let check_aggregator = Arc::new(CheckAggregator::new(
            service_name,
            config.check,
            metric_kinds.clone(),
        ));
        let report_aggregator = Arc::new(ReportAggregator::new(
            service_name,
            config.report,
            metric_kinds,
        ));
        let statistics = Arc::new(ClientStatistics::default());

        // Flushed check requests go upstream fire-and-forget: the entry that
        // produced them is already gone, so the verdict is not cached.
        {
            let statistics = statistics.clone();
            let check_transport = check_transport.clone();
            let runtime = runtime.clone();
            check_aggregator.set_flush_callback(move |request: CheckRequest| {
                statistics.checks_by_flush.fetch_add(1, Ordering::Relaxed);
                let check_transport = check_transport.clone();
                runtime.spawn(async move {
                    if let Err(client_error) = check_transport.check(request).await {
                        error!(error = %client_error, "flushed check call failed");
                    }
                });
            });
        }
        {
            let statistics = statistics.clone();
            let report_transport = report_transport.clone();
            let runtime = runtime.clone();
            report_aggregator.set_flush_callback(move |request: ReportRequest| {
                statistics.reports_by_flush.fetch_add(1, Ordering::Relaxed);
                statistics
                    .report_operations
                    .fetch_add(request.operations.len() as u64, Ordering::Relaxed);
                let report_transport = report_transport.clone();
                runtime.spawn(async move {
                    if let Err(client_error) = report_transport.report(request).await {
                        error!(error = %client_error, "flushed report call failed");
                    }
                });
            });
        }

        let flush_task = config
            .background_flush
            .then(|| {
                spawn_flush_task(&runtime, check_aggregator.clone(), report_aggregator.clone())
            })
            .flatten();

        ServiceControlClient {
            inner: Arc::new(InnerClient {
                check_aggregator,
                report_aggregator,
                check_transport,
                report_transport,
                statistics,
                runtime,
                flush_task: Mutex::new(flush_task),
            }),
        }
    }

    /// Checks an operation, serving from the cache when possible.
    ///
    /// On a cache miss the configured check transport is called and its
    /// verdict cached before being returned. Transport failures bubble up
    /// unchanged and nothing is cached.
    pub async fn check(&self, check_request: CheckRequest) -> ClientResult<CheckResponse> {
        let check_transport = self.inner.check_transport.clone();
        self.check_with_transport(check_request, &*check_transport)
            .await
    }

    /// Like [`ServiceControlClient::check`], with a per-call transport.
    /// Useful when a request context has to travel into the transport layer.
    pub async fn check_with_transport(
        &self,
        check_request: CheckRequest,
        check_transport: &dyn CheckTransport,
    ) -> ClientResult<CheckResponse> {
        let statistics = &self.inner.statistics;
        statistics.total_checks.fetch_add(1, Ordering::Relaxed);

        if let Some(check_response) = self.inner.check_aggregator.check(&check_request)? {
            return Ok(check_response);
        }
        statistics.checks_in_flight.fetch_add(1, Ordering::Relaxed);
        let check_response = check_transport.check(check_request.clone()).await?;
        self.inner
            .check_aggregator
            .cache_response(&check_request, &check_response);
        Ok(check_response)
    }

    /// Blocking variant of [`ServiceControlClient::check`] for callers
    /// outside the async world.
    ///
    /// Must not be called from an async context: it parks the current thread
    /// while the call runs on the captured runtime.
    pub fn blocking_check(&self, check_request: CheckRequest) -> ClientResult<CheckResponse> {
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        let client = self.clone();
        self.inner.runtime.spawn(async move {
            // The receiver is dropped when the caller gave up waiting.
            let _ = result_tx.send(client.check(check_request).await);
        });
        result_rx
            .blocking_recv()
            .map_err(|_| ClientErrorKind::Internal.with_error(anyhow::anyhow!("the check task was dropped")))?
    }

    /// Reports operations, buffering low-importance ones for batched
    /// delivery.
    ///
    /// A buffered report returns an empty response immediately; a report
    /// that cannot be buffered is sent through the configured transport.
    pub async fn report(&self, report_request: ReportRequest) -> ClientResult<ReportResponse> {
        let report_transport = self.inner.report_transport.clone();
        self.report_with_transport(report_request, &*report_transport)
            .await
    }

    /// Like [`ServiceControlClient::report`], with a per-call transport.
    pub async fn report_with_transport(
        &self,
        report_request: ReportRequest,
        report_transport: &dyn ReportTransport,
    ) -> ClientResult<ReportResponse> {
        let statistics = &self.inner.statistics;
        statistics.total_reports.fetch_add(1, Ordering::Relaxed);

        match self.inner.report_aggregator.report(&report_request)? {
            ReportDecision::Aggregated => Ok(ReportResponse::default()),
            ReportDecision::SendDirectly => {
                statistics.reports_in_flight.fetch_add(1, Ordering::Relaxed);
                statistics
                    .report_operations
                    .fetch_add(report_request.operations.len() as u64, Ordering::Relaxed);
                report_transport.report(report_request).await
            }
        }
    }

    /// Blocking variant of [`ServiceControlClient::report`].
    ///
    /// Must not be called from an async context.
    pub fn blocking_report(&self, report_request: ReportRequest) -> ClientResult<ReportResponse> {
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        let client = self.clone();
        self.inner.runtime.spawn(async move {
            let _ = result_tx.send(client.report(report_request).await);
        });
        result_rx
            .blocking_recv()
            .map_err(|_| ClientErrorKind::Internal.with_error(anyhow::anyhow!("the report task was dropped")))?
    }

    /// Runs one flush pass over both aggregators, sending out whatever has
    /// expired. The background flush task calls this periodically; it is
    /// exposed for setups driving flushes themselves.
    pub fn flush(&self) {
        self.inner.check_aggregator.flush();
        self.inner.report_aggregator.flush();
    }

    /// Tears the client down: detaches the flush callbacks, silently drains
    /// both caches, and stops the background flush task.
    ///
    /// In-flight transport completions keep their handle on the check
    /// aggregator, so a verdict arriving after shutdown is cached into a
    /// drained cache and simply expires unused.
    pub fn shutdown(&self) {
        self.inner.check_aggregator.clear_flush_callback();
        self.inner.report_aggregator.clear_flush_callback();
        self.inner.check_aggregator.flush_all();
        self.inner.report_aggregator.flush_all();
        if let Some(flush_task) = self.inner.flush_task.lock().unwrap().take() {
            flush_task.abort();
        }
    }

    /// Returns a copy of the client counters.
    pub fn statistics(&self) -> StatisticsSnapshot {
        let statistics = &self.inner.statistics;
        StatisticsSnapshot {
            total_checks: statistics.total_checks.load(Ordering::Relaxed),
            checks_by_flush: statistics.checks_by_flush.load(Ordering::Relaxed),
            checks_in_flight: statistics.checks_in_flight.load(Ordering::Relaxed),
            total_reports: statistics.total_reports.load(Ordering::Relaxed),
            reports_by_flush: statistics.reports_by_flush.load(Ordering::Relaxed),
            reports_in_flight: statistics.reports_in_flight.load(Ordering::Relaxed),
            report_operations: statistics.report_operations.load(Ordering::Relaxed),
        }
    }
}

/// Flushes both aggregators on a cadence driven by their next-flush
/// intervals. Returns `None` when both caches are disabled and there is
/// nothing to flush, ever.
fn spawn_flush_task(
    runtime: &Handle,
    check_aggregator: Arc<CheckAggregator>,
    report_aggregator: Arc<ReportAggregator>,
) -> Option<JoinHandle<()>> {
    next_interval(&check_aggregator, &report_aggregator)?;
    let flush_task = runtime.spawn(async move {
        loop {
            let Some(interval) = next_interval(&check_aggregator, &report_aggregator) else {
                return;
            };
            tokio::time::sleep(interval).await;
            check_aggregator.flush();
            report_aggregator.flush();
        }
    });
    Some(flush_task)
}

fn next_interval(
    check_aggregator: &CheckAggregator,
    report_aggregator: &ReportAggregator,
) -> Option<Duration> {
    match (
        check_aggregator.next_flush_interval(),
        report_aggregator.next_flush_interval(),
    ) {
        (Some(check_interval), Some(report_interval)) => {
            Some(check_interval.min(report_interval))
        }
        (check_interval, report_interval) => check_interval.or(report_interval),
    }
}
