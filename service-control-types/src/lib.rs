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

//! Wire-model types shared by the service control client: operations, metric
//! values and their merge-level arithmetic (money, distributions), and the
//! check/report request and response envelopes.

#![warn(missing_docs)]

mod distribution;
mod money;
mod operation;
mod requests;
mod timestamp;

pub use distribution::{BucketScheme, Distribution, DistributionError};
pub use money::{Money, MoneyError, MAX_NANOS};
pub use operation::{
    Importance, LogEntry, MetricKind, MetricValue, MetricValuePayload, MetricValueSet, Operation,
};
pub use requests::{
    CheckError, CheckErrorCode, CheckRequest, CheckResponse, ReportError, ReportRequest,
    ReportResponse,
};
pub use timestamp::Timestamp;
