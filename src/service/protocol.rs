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
//! Task protocol wire format shared by the HTTP server and client.
//!
//! Responsibilities:
//! - Names the request and response headers of the task and results endpoints.
//! - Encodes size-bounded task update payloads and maps error codes to HTTP statuses.
//!
//! Key exported interfaces:
//! - Types: `NodeStatus`, `ErrorResponse`.
//! - Functions: `encode_task_update`, `decode_task_update`, `format_duration`, `parse_duration`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::status::{ErrorCode, ExecError, ExecutionFailureInfo, Result};
use crate::runtime::task_info::TaskUpdateRequest;

pub const CURRENT_STATE: &str = "x-current-state";
pub const MAX_WAIT: &str = "x-max-wait";
pub const MAX_SIZE: &str = "x-max-size";
pub const PAGE_TOKEN: &str = "x-page-token";
pub const PAGE_NEXT_TOKEN: &str = "x-page-next-token";
pub const BUFFER_COMPLETE: &str = "x-buffer-complete";
pub const TASK_INSTANCE_ID: &str = "x-task-instance-id";

pub const PAGES_CONTENT_TYPE: &str = "application/x-novaexec-pages";

/// Reply of `GET /v1/info/state`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub environment: String,
    pub coordinator: bool,
    /// `active` or `shutting_down`.
    pub state: String,
    pub catalogs: Vec<String>,
    pub task_count: usize,
    pub memory_max_bytes: i64,
    pub memory_reserved_bytes: i64,
}

/// Body of every non-2xx reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub failure: ExecutionFailureInfo,
}

impl From<&ExecError> for ErrorResponse {
    fn from(err: &ExecError) -> Self {
        Self {
            failure: ExecutionFailureInfo::from(err),
        }
    }
}

pub fn http_status(code: ErrorCode) -> u16 {
    match code {
        ErrorCode::TaskNotFound => 404,
        ErrorCode::InvalidPlan | ErrorCode::NotSupported => 400,
        ErrorCode::ServerShuttingDown => 503,
        ErrorCode::ExceededNodeMemoryLimit | ErrorCode::ExceededQueryMemoryLimit => 507,
        _ => 500,
    }
}

pub fn encode_task_update(request: &TaskUpdateRequest, max_bytes: usize) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(request)
        .map_err(|e| ExecError::internal(format!("encode task update: {}", e)))?;
    check_update_size(body.len(), max_bytes)?;
    Ok(body)
}

pub fn decode_task_update(body: &[u8], max_bytes: usize) -> Result<TaskUpdateRequest> {
    check_update_size(body.len(), max_bytes)?;
    serde_json::from_slice(body)
        .map_err(|e| ExecError::invalid_plan(format!("malformed task update: {}", e)))
}

fn check_update_size(len: usize, max_bytes: usize) -> Result<()> {
    if len > max_bytes {
        return Err(ExecError::invalid_plan(format!(
            "task update of {} bytes exceeds the {} byte limit",
            len, max_bytes
        )));
    }
    Ok(())
}

pub fn format_duration(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}

/// Accepts `250ms`, `2s` or a bare millisecond count.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Some(ms) = value.strip_suffix("ms") {
        return ms.trim().parse().ok().map(Duration::from_millis);
    }
    if let Some(secs) = value.strip_suffix('s') {
        return secs.trim().parse::<f64>().ok().filter(|s| *s >= 0.0).map(Duration::from_secs_f64);
    }
    value.parse().ok().map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::output_buffer::OutputBuffers;

    #[test]
    fn durations_accept_units() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("2s"), Some(Duration::from_secs(2)));
        assert_eq!(parse_duration("40"), Some(Duration::from_millis(40)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(&format_duration(Duration::from_millis(1500))), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn oversized_updates_are_rejected_on_both_sides() {
        let request = TaskUpdateRequest::new(None, Vec::new(), OutputBuffers::partitioned(4));
        let body = encode_task_update(&request, 1024).unwrap();
        assert_eq!(decode_task_update(&body, 1024).unwrap(), request);
        let err = encode_task_update(&request, 4).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPlan);
        assert!(decode_task_update(&body, body.len() - 1).is_err());
    }

    #[test]
    fn error_codes_map_to_statuses() {
        assert_eq!(http_status(ErrorCode::TaskNotFound), 404);
        assert_eq!(http_status(ErrorCode::ServerShuttingDown), 503);
        assert_eq!(http_status(ErrorCode::CorruptPage), 500);
    }
}
