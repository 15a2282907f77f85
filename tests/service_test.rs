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
//! Integration tests for the HTTP task protocol.

use std::sync::Arc;
use std::time::Duration;

use novaexec::common::ids::{PlanNodeId, QueryId, StageId, TaskId};
use novaexec::connector::ConnectorRegistry;
use novaexec::exec::page::{ColumnType, Value};
use novaexec::exec::plan::{OutputPartitioning, PartitioningHandle, PlanFragment, PlanNode};
use novaexec::runtime::exchange_client::ExchangeTransport;
use novaexec::runtime::node_context::NodeContext;
use novaexec::runtime::output_buffer::OutputBuffers;
use novaexec::runtime::task_info::TaskUpdateRequest;
use novaexec::runtime::task_state::TaskState;
use novaexec::scheduler::node_manager::InternalNode;
use novaexec::scheduler::remote_task::TaskTransport;
use novaexec::scheduler::split::TaskLocation;
use novaexec::service::http_client::HttpTransport;
use novaexec::service::http_server::{HttpServerHandle, start_http_server};
use novaexec::service::protocol::NodeStatus;
use novaexec::ErrorCode;

use crate::common::{longs, test_config};

mod common;

struct Worker {
    node: Arc<NodeContext>,
    server: HttpServerHandle,
    client: HttpTransport,
}

impl Worker {
    fn start() -> Self {
        let config = test_config();
        let client = assert_ok!(HttpTransport::new(
            config.runtime.exchange_compression,
            config.server.max_task_update_bytes,
            Duration::from_secs(5),
        ));
        let transport = Arc::new(assert_ok!(HttpTransport::new(
            config.runtime.exchange_compression,
            config.server.max_task_update_bytes,
            Duration::from_secs(5),
        )));
        let node = NodeContext::new(config, ConnectorRegistry::with_builtin(), transport);
        let server = assert_ok!(start_http_server(Arc::clone(&node), "127.0.0.1", 0));
        Self {
            node,
            server,
            client,
        }
    }

    fn internal_node(&self) -> InternalNode {
        InternalNode::new(self.node.node_id().clone(), self.server.uri())
    }

    fn location(&self, task_id: &TaskId) -> TaskLocation {
        TaskLocation {
            node_id: self.node.node_id().clone(),
            uri: self.server.uri(),
            task_id: task_id.clone(),
            buffer_id: 0,
        }
    }
}

fn values_fragment() -> PlanFragment {
    assert_ok!(PlanFragment::new(
        StageId(0),
        PlanNode::Values {
            id: PlanNodeId(1),
            output_types: vec![ColumnType::Int64],
            rows: (1..=5).map(|v| vec![Value::Int64(v)]).collect(),
        },
        PartitioningHandle::Single,
        OutputPartitioning::Single,
    ))
}

#[test]
fn test_node_state_endpoint() {
    let worker = Worker::start();
    let url = format!("{}/v1/info/state", worker.server.uri());
    let status: NodeStatus = reqwest::blocking::get(url)
        .expect("state request")
        .json()
        .expect("state body");
    assert_eq!(status.node_id, "test-node");
    assert_eq!(status.environment, "test");
    assert_eq!(status.state, "active");
    assert!(status.catalogs.iter().any(|c| c == "sequence"));
    assert_eq!(status.task_count, 0);
}

#[test]
fn test_task_lifecycle_over_http() {
    let worker = Worker::start();
    let node = worker.internal_node();
    let task_id = TaskId::new(assert_ok!(QueryId::new("q_http")), StageId(0), 0);

    let request = TaskUpdateRequest::new(Some(values_fragment()), Vec::new(), OutputBuffers::single());
    let status = assert_ok!(worker.client.update_task(&node, &task_id, &request));
    assert_eq!(status.task_id, task_id);
    assert!(!status.state.is_done());

    let location = worker.location(&task_id);
    let mut token = 0;
    let mut pages = Vec::new();
    loop {
        let result = assert_ok!(worker.client.get_results(
            &location,
            token,
            1 << 20,
            Duration::from_millis(200)
        ));
        assert_eq!(result.token, token);
        assert_eq!(result.task_instance_id, status.task_instance_id);
        pages.extend(result.pages);
        token = result.next_token;
        if result.buffer_complete {
            break;
        }
    }
    assert_eq!(longs(&pages, 0), vec![1, 2, 3, 4, 5]);
    assert_ok!(worker.client.abort_results(&location));
    // deleting twice is fine
    assert_ok!(worker.client.abort_results(&location));

    let mut state = status.state;
    let finished = common::wait_for(
        || {
            let polled = worker
                .client
                .get_task_status(&node, &task_id, Some(state), Duration::from_millis(100))
                .expect("status poll");
            state = polled.state;
            state == TaskState::Finished
        },
        Duration::from_secs(10),
    );
    assert!(finished, "task ended in {:?}", state);

    let info = assert_ok!(worker.client.get_task_info(&node, &task_id));
    let buffers = info.output_buffers.expect("output buffer info");
    assert_eq!(buffers.partitions[0].rows_added, 5);
}

#[test]
fn test_errors_travel_as_codes() {
    let worker = Worker::start();
    let node = worker.internal_node();
    let unknown = TaskId::new(QueryId::local(), StageId(7), 0);

    let err = assert_err!(worker.client.get_task_info(&node, &unknown));
    assert_eq!(err.code(), ErrorCode::TaskNotFound);

    // cancel of a task the node never saw still reports a final state
    let status = assert_ok!(worker.client.cancel_task(&node, &unknown, false));
    assert!(status.state.is_done());
}

#[test]
fn test_cancel_over_http_is_final() {
    let worker = Worker::start();
    let node = worker.internal_node();
    let task_id = TaskId::new(assert_ok!(QueryId::new("q_cancel")), StageId(0), 0);
    let request = TaskUpdateRequest::new(Some(values_fragment()), Vec::new(), OutputBuffers::single());
    assert_ok!(worker.client.update_task(&node, &task_id, &request));

    let status = assert_ok!(worker.client.cancel_task(&node, &task_id, true));
    assert_eq!(status.state, TaskState::Aborted);
    let again = assert_ok!(worker.client.get_task_status(&node, &task_id, None, Duration::ZERO));
    assert_eq!(again.state, TaskState::Aborted);
}
