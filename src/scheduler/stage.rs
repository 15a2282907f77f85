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
//! Stage execution: the tasks of one plan fragment across the cluster.
//!
//! Responsibilities:
//! - Creates and tracks one remote task per partition and aggregates their states into the
//!   stage state machine.
//! - Wires exchange inputs: each task of this stage reads buffer `partition` of every task of
//!   the child stages it consumes, delivered as remote splits.
//! - The first task failure fails the stage and aborts the remaining tasks.
//!
//! Key exported interfaces:
//! - Types: `StageExecution`, `StageState`, `StageInfo`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

use crate::common::ids::{FragmentId, PlanNodeId, QueryId, StageId, TaskId};
use crate::common::status::{ErrorCode, ExecError, Result};
use crate::exec::plan::PlanFragment;
use crate::novaexec_logging::{debug, info, warn};
use crate::runtime::output_buffer::OutputBuffers;
use crate::runtime::state_machine::StateMachine;
use crate::runtime::task_info::TaskStatus;
use crate::runtime::task_state::TaskState;
use crate::scheduler::node_manager::InternalNode;
use crate::scheduler::node_selector::NodeTaskMap;
use crate::scheduler::remote_task::{RemoteTask, RemoteTaskFactory};
use crate::scheduler::split::{Split, TaskLocation};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    Planned,
    Scheduling,
    Scheduled,
    Running,
    Finished,
    Canceled,
    Aborted,
    Failed,
}

impl StageState {
    pub fn is_done(self) -> bool {
        matches!(
            self,
            StageState::Finished | StageState::Canceled | StageState::Aborted | StageState::Failed
        )
    }

    /// Every task of the stage has been created.
    pub fn is_scheduled(self) -> bool {
        matches!(
            self,
            StageState::Scheduled | StageState::Running | StageState::Finished
        )
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageInfo {
    pub stage_id: StageId,
    pub state: StageState,
    pub tasks: Vec<TaskStatus>,
    pub failure: Option<String>,
}

type TaskCreatedListener = Arc<dyn Fn(&Arc<dyn RemoteTask>) + Send + Sync>;

#[derive(Default)]
struct StageTasks {
    by_partition: BTreeMap<u32, Arc<dyn RemoteTask>>,
    finished: BTreeSet<u32>,
    running: BTreeSet<u32>,
}

#[derive(Default)]
struct ExchangeInputs {
    /// Child task locations (buffer id unset) by child fragment.
    child_tasks: BTreeMap<FragmentId, Vec<TaskLocation>>,
    /// Child fragments whose task set is complete.
    complete: BTreeSet<FragmentId>,
}

pub struct StageExecution {
    query_id: QueryId,
    fragment: PlanFragment,
    output_buffers: OutputBuffers,
    /// Remote source nodes with the child fragments they read.
    remote_sources: Vec<(PlanNodeId, Vec<FragmentId>)>,
    state: StateMachine<StageState>,
    failure: Mutex<Option<ExecError>>,
    tasks: Mutex<StageTasks>,
    inputs: Mutex<ExchangeInputs>,
    task_created_listeners: Mutex<Vec<TaskCreatedListener>>,
    remote_task_factory: Arc<dyn RemoteTaskFactory>,
    node_task_map: Arc<NodeTaskMap>,
    self_ref: Weak<StageExecution>,
}

impl StageExecution {
    pub fn new(
        query_id: QueryId,
        fragment: PlanFragment,
        output_buffers: OutputBuffers,
        remote_task_factory: Arc<dyn RemoteTaskFactory>,
        node_task_map: Arc<NodeTaskMap>,
    ) -> Arc<Self> {
        let name = format!("stage {}.{}", query_id, fragment.id);
        let remote_sources = fragment.root.remote_sources();
        Arc::new_cyclic(|self_ref| Self {
            query_id,
            fragment,
            output_buffers,
            remote_sources,
            state: StateMachine::new(name, StageState::Planned, |s: &StageState| s.is_done()),
            failure: Mutex::new(None),
            tasks: Mutex::new(StageTasks::default()),
            inputs: Mutex::new(ExchangeInputs::default()),
            task_created_listeners: Mutex::new(Vec::new()),
            remote_task_factory,
            node_task_map,
            self_ref: self_ref.clone(),
        })
    }

    pub fn stage_id(&self) -> StageId {
        self.fragment.id
    }

    pub fn fragment(&self) -> &PlanFragment {
        &self.fragment
    }

    pub fn state(&self) -> StageState {
        self.state.get()
    }

    pub fn failure(&self) -> Option<ExecError> {
        self.failure.lock().expect("stage failure lock").clone()
    }

    pub fn add_state_change_listener(&self, listener: impl Fn(&StageState) + Send + Sync + 'static) {
        self.state.add_state_change_listener(listener);
    }

    /// Called for every task after it started, in creation order.
    pub fn add_task_created_listener(&self, listener: impl Fn(&Arc<dyn RemoteTask>) + Send + Sync + 'static) {
        self.task_created_listeners
            .lock()
            .expect("stage listeners lock")
            .push(Arc::new(listener));
    }

    pub fn tasks(&self) -> Vec<Arc<dyn RemoteTask>> {
        self.tasks
            .lock()
            .expect("stage tasks lock")
            .by_partition
            .values()
            .cloned()
            .collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().expect("stage tasks lock").by_partition.len()
    }

    pub fn begin_scheduling(&self) {
        self.state
            .compare_and_set(&StageState::Planned, StageState::Scheduling);
    }

    /// Create the task of `partition` on `node` and start it. On error nothing is registered
    /// and a best-effort abort is sent, so the caller may retry the partition elsewhere.
    pub fn schedule_task(&self, node: &InternalNode, partition: u32) -> Result<Arc<dyn RemoteTask>> {
        if self.state().is_done() {
            return Err(ExecError::invariant(format!(
                "stage {} is {} and cannot schedule tasks",
                self.stage_id(),
                self.state()
            )));
        }
        if self
            .tasks
            .lock()
            .expect("stage tasks lock")
            .by_partition
            .contains_key(&partition)
        {
            return Err(ExecError::invariant(format!(
                "stage {} already has a task for partition {}",
                self.stage_id(),
                partition
            )));
        }
        let task_id = TaskId::new(self.query_id.clone(), self.stage_id(), partition);
        let task = self.remote_task_factory.create_remote_task(
            node,
            task_id,
            &self.fragment,
            self.output_buffers.clone(),
        );
        self.add_initial_exchange_splits(&task, partition)?;
        if let Err(err) = task.start() {
            warn!(
                "task {} could not be started on node {}: {}",
                task.task_id(),
                node.node_id,
                err
            );
            task.abort();
            return Err(err);
        }
        info!("stage {} scheduled task {} on node {}", self.stage_id(), task.task_id(), node.node_id);
        self.tasks
            .lock()
            .expect("stage tasks lock")
            .by_partition
            .insert(partition, Arc::clone(&task));
        self.node_task_map.add_task(&task);
        let weak = self.self_ref.clone();
        task.add_state_change_listener(Arc::new(move |status: &TaskStatus| {
            if let Some(stage) = weak.upgrade() {
                stage.on_task_status(partition, status);
            }
        }));
        let listeners = self
            .task_created_listeners
            .lock()
            .expect("stage listeners lock")
            .clone();
        for listener in listeners {
            listener(&task);
        }
        if self.state().is_done() {
            task.abort();
        }
        Ok(task)
    }

    fn add_initial_exchange_splits(&self, task: &Arc<dyn RemoteTask>, partition: u32) -> Result<()> {
        let (splits, complete) = {
            let inputs = self.inputs.lock().expect("stage inputs lock");
            let mut splits = Vec::new();
            let mut complete = Vec::new();
            for (plan_node_id, fragments) in &self.remote_sources {
                let mut node_splits = Vec::new();
                for fragment in fragments {
                    for location in inputs.child_tasks.get(fragment).into_iter().flatten() {
                        node_splits.push(remote_split(location, partition)?);
                    }
                }
                splits.push((*plan_node_id, node_splits));
                if fragments.iter().all(|f| inputs.complete.contains(f)) {
                    complete.push(*plan_node_id);
                }
            }
            (splits, complete)
        };
        for (plan_node_id, node_splits) in splits {
            task.add_splits(plan_node_id, node_splits)?;
        }
        for plan_node_id in complete {
            task.no_more_splits(plan_node_id)?;
        }
        Ok(())
    }

    /// A task of child fragment `child` exists; every task of this stage reads its buffer.
    pub fn add_child_task(&self, child: FragmentId, location: TaskLocation) -> Result<()> {
        self.inputs
            .lock()
            .expect("stage inputs lock")
            .child_tasks
            .entry(child)
            .or_default()
            .push(location.clone());
        let plan_nodes = self.plan_nodes_reading(child);
        for (partition, task) in self.tasks_by_partition() {
            let split = remote_split(&location, partition)?;
            for plan_node_id in &plan_nodes {
                task.add_splits(*plan_node_id, vec![split.clone()])?;
            }
        }
        Ok(())
    }

    /// Child fragment `child` will create no more tasks.
    pub fn no_more_child_tasks(&self, child: FragmentId) -> Result<()> {
        let complete: Vec<PlanNodeId> = {
            let mut inputs = self.inputs.lock().expect("stage inputs lock");
            if !inputs.complete.insert(child) {
                return Ok(());
            }
            self.remote_sources
                .iter()
                .filter(|(_, fragments)| fragments.contains(&child))
                .filter(|(_, fragments)| fragments.iter().all(|f| inputs.complete.contains(f)))
                .map(|(id, _)| *id)
                .collect()
        };
        debug!(
            "stage {} input fragment {} complete, closing remote sources {:?}",
            self.stage_id(),
            child,
            complete
        );
        for (_, task) in self.tasks_by_partition() {
            for plan_node_id in &complete {
                task.no_more_splits(*plan_node_id)?;
            }
        }
        Ok(())
    }

    fn plan_nodes_reading(&self, child: FragmentId) -> Vec<PlanNodeId> {
        self.remote_sources
            .iter()
            .filter(|(_, fragments)| fragments.contains(&child))
            .map(|(id, _)| *id)
            .collect()
    }

    fn tasks_by_partition(&self) -> Vec<(u32, Arc<dyn RemoteTask>)> {
        self.tasks
            .lock()
            .expect("stage tasks lock")
            .by_partition
            .iter()
            .map(|(p, t)| (*p, Arc::clone(t)))
            .collect()
    }

    /// All tasks exist; the stage finishes once each of them finished.
    pub fn transition_to_scheduled(&self) {
        let (all_finished, any_running) = {
            let tasks = self.tasks.lock().expect("stage tasks lock");
            (
                tasks.finished.len() == tasks.by_partition.len(),
                !tasks.running.is_empty() || !tasks.finished.is_empty(),
            )
        };
        self.state.set_if(StageState::Scheduled, |s| {
            matches!(s, StageState::Planned | StageState::Scheduling)
        });
        if all_finished {
            self.state.set(StageState::Finished);
        } else if any_running {
            self.state
                .compare_and_set(&StageState::Scheduled, StageState::Running);
        }
    }

    fn on_task_status(&self, partition: u32, status: &TaskStatus) {
        match status.state {
            TaskState::Failed => {
                let err = status
                    .failures
                    .first()
                    .cloned()
                    .map(ExecError::from)
                    .unwrap_or_else(|| {
                        ExecError::new(
                            ErrorCode::GenericInternalError,
                            format!("task {} failed without a reason", status.task_id),
                        )
                    });
                self.fail(err);
            }
            TaskState::Canceled | TaskState::Aborted => {
                if !self.state().is_done() {
                    self.fail(ExecError::new(
                        ErrorCode::RemoteTaskError,
                        format!(
                            "task {} was {} on node {}",
                            status.task_id,
                            status.state.name(),
                            status.node_id
                        ),
                    ));
                }
            }
            TaskState::Finished => {
                let all_finished = {
                    let mut tasks = self.tasks.lock().expect("stage tasks lock");
                    tasks.running.remove(&partition);
                    tasks.finished.insert(partition);
                    tasks.finished.len() == tasks.by_partition.len()
                };
                if all_finished && self.state().is_scheduled() {
                    self.state.set(StageState::Finished);
                } else {
                    self.state
                        .compare_and_set(&StageState::Scheduled, StageState::Running);
                }
            }
            TaskState::Running | TaskState::Finishing => {
                self.tasks
                    .lock()
                    .expect("stage tasks lock")
                    .running
                    .insert(partition);
                self.state
                    .compare_and_set(&StageState::Scheduled, StageState::Running);
            }
            TaskState::Planned => {}
        }
    }

    /// First failure wins; every task is aborted.
    pub fn fail(&self, err: ExecError) {
        {
            let mut failure = self.failure.lock().expect("stage failure lock");
            if failure.is_some() || self.state().is_done() {
                return;
            }
            *failure = Some(err.clone());
        }
        warn!("stage {} failed: {}", self.stage_id(), err);
        self.state.set(StageState::Failed);
        self.abort_tasks(true);
    }

    pub fn cancel(&self) {
        self.state.set(StageState::Canceled);
        self.abort_tasks(false);
    }

    pub fn abort(&self) {
        self.state.set(StageState::Aborted);
        self.abort_tasks(true);
    }

    fn abort_tasks(&self, abort: bool) {
        for (_, task) in self.tasks_by_partition() {
            if abort {
                task.abort();
            } else {
                task.cancel();
            }
        }
    }

    pub fn info(&self) -> StageInfo {
        StageInfo {
            stage_id: self.stage_id(),
            state: self.state(),
            tasks: self.tasks_by_partition().iter().map(|(_, t)| t.task_status()).collect(),
            failure: self.failure().map(|e| e.to_string()),
        }
    }
}

fn remote_split(location: &TaskLocation, buffer_id: u32) -> Result<Split> {
    let mut location = location.clone();
    location.buffer_id = buffer_id;
    Split::remote(&location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::NodeId;
    use crate::common::status::ExecutionFailureInfo;
    use crate::exec::page::ColumnType;
    use crate::exec::plan::{OutputPartitioning, PartitioningHandle, PlanNode};
    use crate::scheduler::testing::{FakeTaskFactory, node};
    use std::sync::atomic::Ordering;

    fn consumer_fragment() -> PlanFragment {
        PlanFragment::new(
            StageId(0),
            PlanNode::RemoteSource {
                id: PlanNodeId(7),
                source_fragments: vec![StageId(1)],
                output_types: vec![ColumnType::Int64],
            },
            PartitioningHandle::Hash { partition_count: 2 },
            OutputPartitioning::Single,
        )
        .unwrap()
    }

    fn child_location(partition: u32) -> TaskLocation {
        TaskLocation {
            node_id: NodeId::new("w1"),
            uri: String::new(),
            task_id: TaskId::new(QueryId::local(), StageId(1), partition),
            buffer_id: 0,
        }
    }

    fn stage(factory: Arc<FakeTaskFactory>) -> Arc<StageExecution> {
        StageExecution::new(
            QueryId::local(),
            consumer_fragment(),
            OutputBuffers::single(),
            factory,
            Arc::new(NodeTaskMap::new()),
        )
    }

    #[test]
    fn child_locations_reach_each_partition_with_its_buffer_id() {
        let factory = Arc::new(FakeTaskFactory::default());
        let stage = stage(Arc::clone(&factory));
        stage.begin_scheduling();
        stage.add_child_task(StageId(1), child_location(0)).unwrap();
        stage.schedule_task(&node("w1"), 0).unwrap();
        stage.schedule_task(&node("w2"), 1).unwrap();
        stage.add_child_task(StageId(1), child_location(1)).unwrap();
        stage.no_more_child_tasks(StageId(1)).unwrap();
        for (partition, task) in factory.created().iter().enumerate() {
            let buffers: Vec<u32> = task
                .splits
                .lock()
                .unwrap()
                .iter()
                .map(|(_, s)| s.remote_location().unwrap().buffer_id)
                .collect();
            assert_eq!(buffers, vec![partition as u32; 2]);
            assert!(task.no_more.lock().unwrap().contains(&PlanNodeId(7)));
        }
    }

    #[test]
    fn stage_finishes_after_all_tasks_finish() {
        let factory = Arc::new(FakeTaskFactory::default());
        let stage = stage(Arc::clone(&factory));
        stage.begin_scheduling();
        stage.schedule_task(&node("w1"), 0).unwrap();
        stage.schedule_task(&node("w2"), 1).unwrap();
        stage.transition_to_scheduled();
        assert_eq!(stage.state(), StageState::Scheduled);
        let created = factory.created();
        created[0].set_state(TaskState::Running);
        assert_eq!(stage.state(), StageState::Running);
        created[0].set_state(TaskState::Finished);
        assert_eq!(stage.state(), StageState::Running);
        created[1].set_state(TaskState::Finished);
        assert_eq!(stage.state(), StageState::Finished);
    }

    #[test]
    fn first_task_failure_fails_stage_and_aborts_others() {
        let factory = Arc::new(FakeTaskFactory::default());
        let stage = stage(Arc::clone(&factory));
        stage.schedule_task(&node("w1"), 0).unwrap();
        stage.schedule_task(&node("w2"), 1).unwrap();
        let created = factory.created();
        created[0]
            .status
            .lock()
            .unwrap()
            .failures
            .push(ExecutionFailureInfo::from(&ExecError::new(ErrorCode::CorruptPage, "bad page")));
        created[0].set_state(TaskState::Failed);
        assert_eq!(stage.state(), StageState::Failed);
        assert_eq!(stage.failure().unwrap().code(), ErrorCode::CorruptPage);
        assert!(created[1].aborted.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_start_registers_nothing() {
        let factory = Arc::new(FakeTaskFactory::failing_on(&["bad"]));
        let stage = stage(Arc::clone(&factory));
        assert!(stage.schedule_task(&node("bad"), 0).is_err());
        assert_eq!(stage.task_count(), 0);
        stage.schedule_task(&node("good"), 0).unwrap();
        assert_eq!(stage.task_count(), 1);
    }
}
