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

use serde::{Deserialize, Serialize};

use crate::operation::Operation;

/// Reasons a check may be denied.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckErrorCode {
    /// The consumer does not exist.
    NotFound,
    /// The consumer is not allowed to call the service.
    PermissionDenied,
    /// The consumer exhausted its quota.
    ResourceExhausted,
    /// The consumer exceeded its spending budget.
    BudgetExceeded,
    /// The service is not activated for the consumer.
    ServiceNotActivated,
    /// Billing is disabled for the consumer.
    BillingDisabled,
    /// The consumer project has been deleted.
    ProjectDeleted,
    /// The caller IP address is blocked.
    IpAddressBlocked,
    /// Any other denial reason.
    Other,
}

/// A single reason a check did not pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckError {
    /// The denial reason.
    pub code: CheckErrorCode,
    /// Human-readable detail.
    #[serde(default)]
    pub detail: String,
}

/// An access-control check for exactly one operation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    /// Name of the service the operation targets.
    pub service_name: String,
    /// The operation being checked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
}

/// The verdict of a check. An empty `check_errors` list means the operation
/// is allowed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckResponse {
    /// Echo of the checked operation's identifier.
    #[serde(default)]
    pub operation_id: String,
    /// The denial reasons; empty on a pass.
    #[serde(default)]
    pub check_errors: Vec<CheckError>,
}

impl CheckResponse {
    /// Returns whether the check passed.
    pub fn is_pass(&self) -> bool {
        self.check_errors.is_empty()
    }
}

/// A batch of operations reported for accounting.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportRequest {
    /// Name of the service the operations target.
    pub service_name: String,
    /// The reported operations.
    #[serde(default)]
    pub operations: Vec<Operation>,
}

/// A per-operation report failure.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportError {
    /// Identifier of the rejected operation.
    pub operation_id: String,
    /// Why the operation was rejected.
    pub message: String,
}

/// The outcome of a report. An empty `report_errors` list means every
/// operation was accepted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportResponse {
    /// Operations the server rejected, if any.
    #[serde(default)]
    pub report_errors: Vec<ReportError>,
}
