// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Execution error taxonomy.
//!
//! Responsibilities:
//! - Defines the error codes surfaced by tasks, stages and queries.
//! - Classifies codes into transport, data-corruption, resource and internal categories.
//!
//! Key exported interfaces:
//! - Types: `ErrorCode`, `ErrorType`, `ExecError`, `ExecutionFailureInfo`.
//! - Aliases: `Result`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad class of an error code.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    UserError,
    InternalError,
    InsufficientResources,
    External,
}

/// Distinguishable failure reasons reported to the coordinator.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    // transport
    PageTransportError,
    PageTransportTimeout,
    RemoteTaskError,
    RemoteHostGone,
    // data corruption
    CorruptPage,
    // resource exhaustion
    ExceededQueryMemoryLimit,
    ExceededNodeMemoryLimit,
    ExceededSplitBufferingLimit,
    ExceededOutputBufferLimit,
    NoNodesAvailable,
    // internal
    GenericInternalError,
    InvariantViolation,
    ServerShuttingDown,
    // user / request
    InvalidPlan,
    NotSupported,
    UserCanceled,
    AbandonedTask,
    TaskNotFound,
    // connectors
    ConnectorError,
}

impl ErrorCode {
    pub fn error_type(self) -> ErrorType {
        match self {
            ErrorCode::PageTransportError
            | ErrorCode::PageTransportTimeout
            | ErrorCode::RemoteTaskError
            | ErrorCode::RemoteHostGone
            | ErrorCode::ConnectorError => ErrorType::External,
            ErrorCode::ExceededQueryMemoryLimit
            | ErrorCode::ExceededNodeMemoryLimit
            | ErrorCode::ExceededSplitBufferingLimit
            | ErrorCode::ExceededOutputBufferLimit
            | ErrorCode::NoNodesAvailable => ErrorType::InsufficientResources,
            ErrorCode::CorruptPage
            | ErrorCode::GenericInternalError
            | ErrorCode::InvariantViolation
            | ErrorCode::ServerShuttingDown
            | ErrorCode::AbandonedTask => ErrorType::InternalError,
            ErrorCode::InvalidPlan
            | ErrorCode::NotSupported
            | ErrorCode::UserCanceled
            | ErrorCode::TaskNotFound => ErrorType::UserError,
        }
    }

    /// Transport failures may be retried until the max error duration elapses.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::PageTransportError | ErrorCode::RemoteTaskError | ErrorCode::RemoteHostGone
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::PageTransportError => "PAGE_TRANSPORT_ERROR",
            ErrorCode::PageTransportTimeout => "PAGE_TRANSPORT_TIMEOUT",
            ErrorCode::RemoteTaskError => "REMOTE_TASK_ERROR",
            ErrorCode::RemoteHostGone => "REMOTE_HOST_GONE",
            ErrorCode::CorruptPage => "CORRUPT_PAGE",
            ErrorCode::ExceededQueryMemoryLimit => "EXCEEDED_QUERY_MEMORY_LIMIT",
            ErrorCode::ExceededNodeMemoryLimit => "EXCEEDED_NODE_MEMORY_LIMIT",
            ErrorCode::ExceededSplitBufferingLimit => "EXCEEDED_SPLIT_BUFFERING_LIMIT",
            ErrorCode::ExceededOutputBufferLimit => "EXCEEDED_OUTPUT_BUFFER_LIMIT",
            ErrorCode::NoNodesAvailable => "NO_NODES_AVAILABLE",
            ErrorCode::GenericInternalError => "GENERIC_INTERNAL_ERROR",
            ErrorCode::InvariantViolation => "INVARIANT_VIOLATION",
            ErrorCode::ServerShuttingDown => "SERVER_SHUTTING_DOWN",
            ErrorCode::InvalidPlan => "INVALID_PLAN",
            ErrorCode::NotSupported => "NOT_SUPPORTED",
            ErrorCode::UserCanceled => "USER_CANCELED",
            ErrorCode::AbandonedTask => "ABANDONED_TASK",
            ErrorCode::TaskNotFound => "TASK_NOT_FOUND",
            ErrorCode::ConnectorError => "CONNECTOR_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error value carried through every execution API.
///
/// `location` names the remote host or split the error originated from, when known.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ExecError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub location: Option<String>,
}

impl ExecError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            location: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::GenericInternalError, message)
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvariantViolation, message)
    }

    pub fn invalid_plan(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidPlan, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotSupported, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl From<arrow::error::ArrowError> for ExecError {
    fn from(err: arrow::error::ArrowError) -> Self {
        ExecError::internal(format!("arrow: {}", err))
    }
}

/// Serializable failure record attached to task and stage status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailureInfo {
    pub error_code: ErrorCode,
    pub error_type: ErrorType,
    pub message: String,
    #[serde(default)]
    pub location: Option<String>,
}

impl From<&ExecError> for ExecutionFailureInfo {
    fn from(err: &ExecError) -> Self {
        Self {
            error_code: err.code,
            error_type: err.code.error_type(),
            message: err.message.clone(),
            location: err.location.clone(),
        }
    }
}

impl From<ExecutionFailureInfo> for ExecError {
    fn from(info: ExecutionFailureInfo) -> Self {
        Self {
            code: info.error_code,
            message: info.message,
            location: info.location,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_codes_are_retryable() {
        assert!(ErrorCode::PageTransportError.is_retryable());
        assert!(!ErrorCode::PageTransportTimeout.is_retryable());
        assert!(!ErrorCode::CorruptPage.is_retryable());
        assert_eq!(
            ErrorCode::ExceededSplitBufferingLimit.error_type(),
            ErrorType::InsufficientResources
        );
    }

    #[test]
    fn display_includes_code_name() {
        let err = ExecError::new(ErrorCode::CorruptPage, "bad checksum").with_location("node-1");
        assert_eq!(err.to_string(), "CORRUPT_PAGE: bad checksum");
        let info = ExecutionFailureInfo::from(&err);
        assert_eq!(ExecError::from(info), err);
    }
}
