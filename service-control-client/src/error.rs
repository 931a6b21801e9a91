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

use std::fmt;
use std::sync::Arc;

use service_control_types::{DistributionError, MoneyError};
use thiserror::Error;

/// Client error kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientErrorKind {
    /// The request violates the client contract (wrong service name, missing
    /// operation, malformed value).
    InvalidArgument,
    /// The requested entity does not exist upstream.
    NotFound,
    /// A numeric value overflowed its representable range.
    OutOfRange,
    /// The caller is not allowed to perform the operation.
    PermissionDenied,
    /// The upstream service cannot be reached.
    Unavailable,
    /// The transport gave up waiting for the upstream service.
    Timeout,
    /// Any other internal error.
    Internal,
}

impl ClientErrorKind {
    /// Creates a [`ClientError`] of this kind wrapping the given source.
    pub fn with_error(self, source: impl Into<anyhow::Error>) -> ClientError {
        ClientError {
            kind: self,
            source: Arc::new(source.into()),
        }
    }
}

/// Generic client error: a kind for dispatch plus the underlying cause.
#[derive(Debug, Clone, Error)]
#[error("client error (kind={kind:?}, source={source})")]
pub struct ClientError {
    /// What went wrong, coarsely.
    pub kind: ClientErrorKind,
    #[source]
    source: Arc<anyhow::Error>,
}

/// Generic `Result` type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    /// Shorthand for an [`ClientErrorKind::InvalidArgument`] error with the
    /// given message.
    pub fn invalid_argument(message: impl fmt::Display) -> Self {
        ClientErrorKind::InvalidArgument.with_error(anyhow::anyhow!("{message}"))
    }

    /// Adds some context to the error.
    pub fn add_context<C>(self, ctx: C) -> Self
    where C: fmt::Display + Send + Sync + 'static {
        ClientError {
            kind: self.kind,
            source: Arc::new(anyhow::anyhow!("{ctx}").context(self.source)),
        }
    }

    /// Returns the corresponding [`ClientErrorKind`] for this error.
    pub fn kind(&self) -> ClientErrorKind {
        self.kind
    }
}

impl From<MoneyError> for ClientError {
    fn from(error: MoneyError) -> ClientError {
        match error {
            MoneyError::Overflow { .. } => ClientErrorKind::OutOfRange.with_error(error),
            _ => ClientErrorKind::InvalidArgument.with_error(error),
        }
    }
}

impl From<DistributionError> for ClientError {
    fn from(error: DistributionError) -> ClientError {
        ClientErrorKind::InvalidArgument.with_error(error)
    }
}
