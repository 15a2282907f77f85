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
//! In-memory remote tasks for scheduler tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::future::SettableFuture;
use crate::common::ids::{PlanNodeId, TaskId};
use crate::common::status::{ErrorCode, ExecError, Result};
use crate::exec::plan::PlanFragment;
use crate::runtime::output_buffer::OutputBuffers;
use crate::runtime::task_info::TaskStatus;
use crate::runtime::task_state::TaskState;
use crate::scheduler::node_manager::{InternalNode, NodeAnnouncement, NodeManager, NodeState, StaticNodeDiscovery};
use crate::scheduler::remote_task::{RemoteTask, RemoteTaskFactory, TaskStatusListener};
use crate::scheduler::split::Split;

pub(crate) struct FakeTask {
    pub id: TaskId,
    pub node: InternalNode,
    pub output_buffers: OutputBuffers,
    pub fail_start: bool,
    pub splits: Mutex<Vec<(PlanNodeId, Split)>>,
    pub no_more: Mutex<BTreeSet<PlanNodeId>>,
    pub status: Mutex<TaskStatus>,
    pub listeners: Mutex<Vec<TaskStatusListener>>,
    pub aborted: AtomicBool,
    /// Simulated queued split count; grows with `add_splits`.
    pub queued: AtomicUsize,
    pub space: Mutex<Option<SettableFuture<()>>>,
}

impl FakeTask {
    pub fn new(id: TaskId, node: InternalNode) -> Self {
        Self {
            status: Mutex::new(TaskStatus::initial(id.clone(), node.node_id.clone())),
            id,
            node,
            output_buffers: OutputBuffers::single(),
            fail_start: false,
            splits: Mutex::new(Vec::new()),
            no_more: Mutex::new(BTreeSet::new()),
            listeners: Mutex::new(Vec::new()),
            aborted: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
            space: Mutex::new(None),
        }
    }

    pub fn set_state(&self, state: TaskState) {
        let status = {
            let mut status = self.status.lock().unwrap();
            status.state = state;
            status.version += 1;
            status.clone()
        };
        for listener in self.listeners.lock().unwrap().clone() {
            listener(&status);
        }
    }

    pub fn split_count(&self) -> usize {
        self.splits.lock().unwrap().len()
    }

    /// Simulate the worker completing every queued split.
    pub fn drain(&self) {
        self.queued.store(0, Ordering::SeqCst);
        if let Some(space) = self.space.lock().unwrap().take() {
            space.set(());
        }
    }
}

impl RemoteTask for FakeTask {
    fn task_id(&self) -> &TaskId {
        &self.id
    }

    fn node(&self) -> &InternalNode {
        &self.node
    }

    fn start(&self) -> Result<()> {
        if self.fail_start {
            Err(ExecError::new(ErrorCode::RemoteHostGone, "connection refused"))
        } else {
            Ok(())
        }
    }

    fn add_splits(&self, plan_node_id: PlanNodeId, splits: Vec<Split>) -> Result<()> {
        self.queued.fetch_add(splits.len(), Ordering::SeqCst);
        let mut guard = self.splits.lock().unwrap();
        guard.extend(splits.into_iter().map(|s| (plan_node_id, s)));
        Ok(())
    }

    fn no_more_splits(&self, plan_node_id: PlanNodeId) -> Result<()> {
        self.no_more.lock().unwrap().insert(plan_node_id);
        Ok(())
    }

    fn task_status(&self) -> TaskStatus {
        self.status.lock().unwrap().clone()
    }

    fn add_state_change_listener(&self, listener: TaskStatusListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn when_split_queue_has_space(&self, max_queued: usize) -> SettableFuture<()> {
        if self.queued.load(Ordering::SeqCst) < max_queued {
            return SettableFuture::completed(());
        }
        self.space
            .lock()
            .unwrap()
            .get_or_insert_with(SettableFuture::new)
            .clone()
    }

    fn queued_split_count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct FakeTaskFactory {
    pub created: Mutex<Vec<Arc<FakeTask>>>,
    pub failing_nodes: BTreeSet<String>,
}

impl FakeTaskFactory {
    pub fn failing_on(nodes: &[&str]) -> Self {
        Self {
            failing_nodes: nodes.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn created(&self) -> Vec<Arc<FakeTask>> {
        self.created.lock().unwrap().clone()
    }
}

impl RemoteTaskFactory for FakeTaskFactory {
    fn create_remote_task(
        &self,
        node: &InternalNode,
        task_id: TaskId,
        _fragment: &PlanFragment,
        output_buffers: OutputBuffers,
    ) -> Arc<dyn RemoteTask> {
        let mut task = FakeTask::new(task_id, node.clone());
        task.output_buffers = output_buffers;
        task.fail_start = self.failing_nodes.contains(node.node_id.as_str());
        let task = Arc::new(task);
        self.created.lock().unwrap().push(Arc::clone(&task));
        task
    }
}

pub(crate) fn node(id: &str) -> InternalNode {
    InternalNode::new(crate::common::ids::NodeId::new(id), "")
}

pub(crate) fn node_manager(nodes: &[&str]) -> Arc<NodeManager> {
    let discovery = StaticNodeDiscovery::new(
        nodes
            .iter()
            .map(|n| NodeAnnouncement {
                node: node(n),
                state: NodeState::Active,
            })
            .collect(),
    );
    NodeManager::new(Arc::new(discovery), std::time::Duration::from_secs(60))
}
