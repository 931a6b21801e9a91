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

//! A caching, aggregating client for the service control API.
//!
//! The client fronts the remote Check and Report calls with a two-level
//! aggregation engine:
//!
//! - the check side caches verdicts per request signature, serves stale
//!   verdicts while a single refresh per key goes upstream, and accumulates
//!   the quota activity of every check it served;
//! - the report side merges operations sharing a signature and batches them
//!   into few upstream requests, bounded by age and capacity.
//!
//! Both sides absorb many small client calls and emit a much smaller stream
//! of upstream RPCs without adding latency to the hot path: answers come
//! straight from in-memory caches guarded by plain mutexes, and everything
//! leaving the caches is handed to the transports outside those locks.

mod cache;
mod check_aggregator;
mod client;
mod config;
mod error;
mod flush_buffer;
mod operation_aggregator;
mod report_aggregator;
mod signature;
mod transport;

pub use check_aggregator::CheckAggregator;
pub use client::{ServiceControlClient, StatisticsSnapshot};
pub use config::{CheckAggregationConfig, ClientConfig, ReportAggregationConfig};
pub use error::{ClientError, ClientErrorKind, ClientResult};
pub use report_aggregator::{
    ReportAggregator, ReportDecision, MAX_OPERATIONS_PER_REQUEST,
};
pub use transport::{CheckTransport, ReportTransport};
