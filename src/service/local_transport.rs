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
//! In-process task and exchange transport.
//!
//! Responsibilities:
//! - Routes coordinator task calls and consumer page reads to the `TaskManager` of the
//!   addressed node without a network hop.
//! - Lets tests take nodes offline or fail a bounded number of calls per node.
//!
//! Key exported interfaces:
//! - Types: `InProcessTransport`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::common::ids::{NodeId, TaskId};
use crate::common::status::{ErrorCode, ExecError, Result};
use crate::exec::page::PagesSerde;
use crate::novaexec_logging::debug;
use crate::runtime::exchange_client::ExchangeTransport;
use crate::runtime::output_buffer::BufferResult;
use crate::runtime::task_info::{TaskInfo, TaskStatus, TaskUpdateRequest};
use crate::runtime::task_manager::TaskManager;
use crate::runtime::task_state::TaskState;
use crate::scheduler::node_manager::InternalNode;
use crate::scheduler::remote_task::TaskTransport;
use crate::scheduler::split::TaskLocation;

#[derive(Default)]
struct Faults {
    unreachable: bool,
    /// Calls still to fail with a transient transport error.
    transient: usize,
}

#[derive(Default)]
pub struct InProcessTransport {
    nodes: Mutex<HashMap<NodeId, Weak<TaskManager>>>,
    faults: Mutex<HashMap<NodeId, Faults>>,
    /// When set, result pages are encoded and decoded as they would be on the wire.
    serde: Option<PagesSerde>,
}

impl InProcessTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_page_serde(serde: PagesSerde) -> Arc<Self> {
        Arc::new(Self {
            serde: Some(serde),
            ..Self::default()
        })
    }

    pub fn register(&self, task_manager: &Arc<TaskManager>) {
        self.nodes
            .lock()
            .expect("in-process transport lock")
            .insert(task_manager.node_id().clone(), Arc::downgrade(task_manager));
    }

    pub fn unregister(&self, node_id: &NodeId) {
        self.nodes
            .lock()
            .expect("in-process transport lock")
            .remove(node_id);
    }

    /// Every call to `node_id` fails with `RemoteHostGone` until reset.
    pub fn set_unreachable(&self, node_id: &NodeId, unreachable: bool) {
        self.faults
            .lock()
            .expect("in-process faults lock")
            .entry(node_id.clone())
            .or_default()
            .unreachable = unreachable;
    }

    /// The next `count` calls to `node_id` fail with a retryable `PageTransportError`.
    pub fn fail_next_calls(&self, node_id: &NodeId, count: usize) {
        self.faults
            .lock()
            .expect("in-process faults lock")
            .entry(node_id.clone())
            .or_default()
            .transient = count;
    }

    fn manager(&self, node_id: &NodeId) -> Result<Arc<TaskManager>> {
        {
            let mut faults = self.faults.lock().expect("in-process faults lock");
            if let Some(fault) = faults.get_mut(node_id) {
                if fault.unreachable {
                    return Err(ExecError::new(
                        ErrorCode::RemoteHostGone,
                        format!("node {} is unreachable", node_id),
                    ));
                }
                if fault.transient > 0 {
                    fault.transient -= 1;
                    debug!("injected transport failure for node {}", node_id);
                    return Err(ExecError::new(
                        ErrorCode::PageTransportError,
                        format!("injected transport failure for node {}", node_id),
                    ));
                }
            }
        }
        self.nodes
            .lock()
            .expect("in-process transport lock")
            .get(node_id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                ExecError::new(ErrorCode::RemoteHostGone, format!("node {} is not registered", node_id))
            })
    }
}

impl TaskTransport for InProcessTransport {
    fn update_task(
        &self,
        node: &InternalNode,
        task_id: &TaskId,
        request: &TaskUpdateRequest,
    ) -> Result<TaskStatus> {
        self.manager(&node.node_id)?.update_task(task_id, request)
    }

    fn get_task_status(
        &self,
        node: &InternalNode,
        task_id: &TaskId,
        current_state: Option<TaskState>,
        max_wait: Duration,
    ) -> Result<TaskStatus> {
        self.manager(&node.node_id)?
            .get_task_status(task_id, current_state, max_wait)
    }

    fn get_task_info(&self, node: &InternalNode, task_id: &TaskId) -> Result<TaskInfo> {
        self.manager(&node.node_id)?.get_task_info(task_id)
    }

    fn cancel_task(&self, node: &InternalNode, task_id: &TaskId, abort: bool) -> Result<TaskStatus> {
        Ok(self.manager(&node.node_id)?.cancel_task(task_id, abort))
    }
}

impl ExchangeTransport for InProcessTransport {
    fn get_results(
        &self,
        location: &TaskLocation,
        token: u64,
        max_bytes: u64,
        max_wait: Duration,
    ) -> Result<BufferResult> {
        let mut result = self.manager(&location.node_id)?.get_results(
            &location.task_id,
            location.buffer_id,
            token,
            max_bytes,
            max_wait,
        )?;
        if let Some(serde) = &self.serde {
            let payload = serde.serialize(&result.pages)?;
            result.pages = serde.deserialize(&payload, &location.to_string())?;
        }
        Ok(result)
    }

    fn acknowledge_results(&self, location: &TaskLocation, token: u64) -> Result<()> {
        self.manager(&location.node_id)?
            .acknowledge_results(&location.task_id, location.buffer_id, token)
    }

    fn abort_results(&self, location: &TaskLocation) -> Result<()> {
        self.manager(&location.node_id)?
            .destroy_results(&location.task_id, location.buffer_id)
    }
}
