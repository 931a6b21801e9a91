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

use async_trait::async_trait;
use service_control_types::{CheckRequest, CheckResponse, ReportRequest, ReportResponse};

use crate::error::ClientResult;

/// Sends check requests to the service control server.
///
/// Implementations own the wire protocol, authentication, and timeouts. They
/// are expected to serialize equal requests identically, so that signatures
/// computed on two equal operations stay equal on the wire. Completions may
/// run on any task or thread.
#[async_trait]
pub trait CheckTransport: Send + Sync + 'static {
    /// Sends one check request and awaits the verdict.
    async fn check(&self, request: CheckRequest) -> ClientResult<CheckResponse>;
}

/// Sends report requests to the service control server.
///
/// The aggregation layer delivers flushed requests in no particular order;
/// the service control API is idempotent at this layer, so retries and
/// reordering inside the transport are safe.
#[async_trait]
pub trait ReportTransport: Send + Sync + 'static {
    /// Sends one report request and awaits the outcome.
    async fn report(&self, request: ReportRequest) -> ClientResult<ReportResponse>;
}
