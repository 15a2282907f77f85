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
//! HTTP client side of the task protocol.
//!
//! `HttpTransport` speaks to the endpoints of `http_server` with a blocking `reqwest`
//! client. Connection failures map to retryable transport codes; error bodies decode back
//! into the worker's `ExecError`.

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};

use crate::common::ids::TaskId;
use crate::common::status::{ErrorCode, ExecError, Result};
use crate::exec::page::PagesSerde;
use crate::runtime::exchange_client::ExchangeTransport;
use crate::runtime::output_buffer::BufferResult;
use crate::runtime::task_info::{TaskInfo, TaskStatus, TaskUpdateRequest};
use crate::runtime::task_state::TaskState;
use crate::scheduler::node_manager::InternalNode;
use crate::scheduler::remote_task::TaskTransport;
use crate::scheduler::split::TaskLocation;
use crate::service::protocol::{self, ErrorResponse};

/// Extra time granted on top of a long-poll wait before the request itself times out.
const LONG_POLL_SLACK: Duration = Duration::from_secs(10);

pub struct HttpTransport {
    client: Client,
    serde: PagesSerde,
    max_task_update_bytes: usize,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(compression: bool, max_task_update_bytes: usize, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| ExecError::internal(format!("build http client: {}", e)))?;
        Ok(Self {
            client,
            serde: PagesSerde::new(compression),
            max_task_update_bytes,
            request_timeout,
        })
    }

    fn task_url(node: &InternalNode, task_id: &TaskId) -> String {
        format!("{}/v1/task/{}", node.uri.trim_end_matches('/'), task_id)
    }

    fn results_url(location: &TaskLocation) -> String {
        format!("{}{}", location.uri.trim_end_matches('/'), location.results_path())
    }

    fn send(&self, request: RequestBuilder, what: &str, code: ErrorCode) -> Result<Response> {
        let response = request
            .send()
            .map_err(|e| ExecError::new(request_error_code(&e, code), format!("{}: {}", what, e)))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.bytes().unwrap_or_default();
        match serde_json::from_slice::<ErrorResponse>(&body) {
            Ok(err) => Err(ExecError::from(err.failure)),
            Err(_) => Err(ExecError::new(
                code,
                format!("{}: http {} {}", what, status, String::from_utf8_lossy(&body)),
            )),
        }
    }

    fn json<T: serde::de::DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        response.json::<T>().map_err(|e| {
            ExecError::new(ErrorCode::RemoteTaskError, format!("{}: malformed reply: {}", what, e))
        })
    }
}

/// A refused task-control connection means nothing serves the node any more; page reads keep
/// their retryable transport code.
fn request_error_code(err: &reqwest::Error, code: ErrorCode) -> ErrorCode {
    if err.is_connect() && code == ErrorCode::RemoteTaskError {
        ErrorCode::RemoteHostGone
    } else {
        code
    }
}

fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

fn required_u64(response: &Response, name: &str, location: &TaskLocation) -> Result<u64> {
    header(response, name)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            ExecError::new(
                ErrorCode::PageTransportError,
                format!("results reply from {} lacks header {}", location, name),
            )
        })
}

impl TaskTransport for HttpTransport {
    fn update_task(
        &self,
        node: &InternalNode,
        task_id: &TaskId,
        request: &TaskUpdateRequest,
    ) -> Result<TaskStatus> {
        let body = protocol::encode_task_update(request, self.max_task_update_bytes)?;
        let response = self.send(
            self.client
                .post(Self::task_url(node, task_id))
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .timeout(self.request_timeout)
                .body(body),
            &format!("update task {}", task_id),
            ErrorCode::RemoteTaskError,
        )?;
        Self::json(response, "update task")
    }

    fn get_task_status(
        &self,
        node: &InternalNode,
        task_id: &TaskId,
        current_state: Option<TaskState>,
        max_wait: Duration,
    ) -> Result<TaskStatus> {
        let mut request = self
            .client
            .get(format!("{}/status", Self::task_url(node, task_id)))
            .header(protocol::MAX_WAIT, protocol::format_duration(max_wait))
            .timeout(max_wait + LONG_POLL_SLACK);
        if let Some(state) = current_state {
            request = request.header(protocol::CURRENT_STATE, state.name());
        }
        let response = self.send(
            request,
            &format!("task status {}", task_id),
            ErrorCode::RemoteTaskError,
        )?;
        Self::json(response, "task status")
    }

    fn get_task_info(&self, node: &InternalNode, task_id: &TaskId) -> Result<TaskInfo> {
        let response = self.send(
            self.client
                .get(Self::task_url(node, task_id))
                .timeout(self.request_timeout),
            &format!("task info {}", task_id),
            ErrorCode::RemoteTaskError,
        )?;
        Self::json(response, "task info")
    }

    fn cancel_task(&self, node: &InternalNode, task_id: &TaskId, abort: bool) -> Result<TaskStatus> {
        let response = self.send(
            self.client
                .delete(format!("{}?abort={}", Self::task_url(node, task_id), abort))
                .timeout(self.request_timeout),
            &format!("cancel task {}", task_id),
            ErrorCode::RemoteTaskError,
        )?;
        Self::json(response, "cancel task")
    }
}

impl ExchangeTransport for HttpTransport {
    fn get_results(
        &self,
        location: &TaskLocation,
        token: u64,
        max_bytes: u64,
        max_wait: Duration,
    ) -> Result<BufferResult> {
        let response = self.send(
            self.client
                .get(format!("{}/{}", Self::results_url(location), token))
                .header(protocol::MAX_SIZE, max_bytes.to_string())
                .header(protocol::MAX_WAIT, protocol::format_duration(max_wait))
                .timeout(max_wait + LONG_POLL_SLACK),
            &format!("get results from {}", location),
            ErrorCode::PageTransportError,
        )?;
        let reply_token = required_u64(&response, protocol::PAGE_TOKEN, location)?;
        let next_token = required_u64(&response, protocol::PAGE_NEXT_TOKEN, location)?;
        let buffer_complete = header(&response, protocol::BUFFER_COMPLETE) == Some("true");
        let task_instance_id = header(&response, protocol::TASK_INSTANCE_ID)
            .unwrap_or_default()
            .to_string();
        let body = response.bytes().map_err(|e| {
            ExecError::new(
                ErrorCode::PageTransportError,
                format!("read results body from {}: {}", location, e),
            )
        })?;
        let pages = self.serde.deserialize(&body, &location.to_string())?;
        Ok(BufferResult {
            task_instance_id,
            token: reply_token,
            next_token,
            pages,
            buffer_complete,
        })
    }

    fn acknowledge_results(&self, location: &TaskLocation, token: u64) -> Result<()> {
        self.send(
            self.client
                .get(format!("{}/{}/acknowledge", Self::results_url(location), token))
                .timeout(self.request_timeout),
            &format!("acknowledge results of {}", location),
            ErrorCode::PageTransportError,
        )?;
        Ok(())
    }

    fn abort_results(&self, location: &TaskLocation) -> Result<()> {
        self.send(
            self.client
                .delete(Self::results_url(location))
                .timeout(self.request_timeout),
            &format!("delete results of {}", location),
            ErrorCode::PageTransportError,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::{NodeId, QueryId, StageId};

    #[test]
    fn urls_follow_the_task_protocol() {
        let node = InternalNode::new(NodeId::new("w1"), "http://127.0.0.1:9001/");
        let task_id = TaskId::new(QueryId::new("q1").unwrap(), StageId(2), 3);
        assert_eq!(
            HttpTransport::task_url(&node, &task_id),
            "http://127.0.0.1:9001/v1/task/q1.2.3"
        );
        let location = TaskLocation {
            node_id: node.node_id.clone(),
            uri: node.uri.clone(),
            task_id,
            buffer_id: 1,
        };
        assert_eq!(
            HttpTransport::results_url(&location),
            "http://127.0.0.1:9001/v1/task/q1.2.3/results/1"
        );
    }

    #[test]
    fn unreachable_worker_is_a_retryable_transport_error() {
        let transport = HttpTransport::new(false, 1024, Duration::from_millis(200)).unwrap();
        let location = TaskLocation {
            node_id: NodeId::new("w1"),
            uri: "http://127.0.0.1:1".to_string(),
            task_id: TaskId::new(QueryId::local(), StageId(0), 0),
            buffer_id: 0,
        };
        let err = transport
            .get_results(&location, 0, 1024, Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PageTransportError);
        assert!(err.is_retryable());
    }

    #[test]
    fn refused_task_update_reports_host_gone() {
        let transport = HttpTransport::new(false, 1 << 20, Duration::from_millis(200)).unwrap();
        let node = InternalNode::new(NodeId::new("w1"), "http://127.0.0.1:1");
        let task_id = TaskId::new(QueryId::local(), StageId(0), 0);
        let err = transport
            .cancel_task(&node, &task_id, true)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RemoteHostGone);
    }
}
