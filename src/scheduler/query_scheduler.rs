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
//! Query-wide distributed scheduling.
//!
//! Responsibilities:
//! - Builds one `StageExecution` per fragment of a `SubPlan`, sizing each child's output
//!   buffers by the partition count of the consuming stage.
//! - Wires child task locations into their parent stage as remote splits and closes the
//!   parent's remote sources once a child stage has created all of its tasks.
//! - Runs the stage schedulers on a dedicated thread, children first, parking on the blocked
//!   futures they return.
//! - Aggregates stage states into the query state; the first stage failure fails the query
//!   and aborts every stage.
//!
//! Key exported interfaces:
//! - Types: `QueryScheduler`, `QueryState`, `QueryInfo`, `SchedulerDeps`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::common::app_config::SchedulerConfig;
use crate::common::future::SettableFuture;
use crate::common::ids::{FragmentId, QueryId};
use crate::common::status::{ErrorCode, ExecError, Result};
use crate::exec::plan::{OutputPartitioning, PartitioningHandle, PlanFragment, PlanNode, SubPlan};
use crate::novaexec_logging::{debug, error, info, warn};
use crate::runtime::exchange_client::{ExchangeClient, ExchangeClientConfig, ExchangeTransport};
use crate::runtime::io::IoExecutor;
use crate::runtime::output_buffer::OutputBuffers;
use crate::runtime::state_machine::StateMachine;
use crate::scheduler::bucket_node_map::{BucketNodeMap, DynamicBucketNodeMap, FixedBucketNodeMap};
use crate::scheduler::node_manager::{InternalNode, NodeManager};
use crate::scheduler::node_selector::{NodeSelector, NodeTaskMap};
use crate::scheduler::remote_task::RemoteTaskFactory;
use crate::scheduler::split_source::SplitSource;
use crate::scheduler::stage::{StageExecution, StageInfo, StageState};
use crate::scheduler::stage_scheduler::{
    FixedCountScheduler, FixedSourcePartitionedScheduler, SourcePartitionedScheduler,
    StageScheduler, any_of,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    Planned,
    Scheduling,
    Running,
    Finished,
    Canceled,
    Failed,
}

impl QueryState {
    pub fn is_done(self) -> bool {
        matches!(self, QueryState::Finished | QueryState::Canceled | QueryState::Failed)
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryInfo {
    pub query_id: QueryId,
    pub state: QueryState,
    pub failure: Option<String>,
    pub stages: Vec<StageInfo>,
}

/// Coordinator services a query scheduler runs against.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub node_manager: Arc<NodeManager>,
    pub remote_task_factory: Arc<dyn RemoteTaskFactory>,
    pub config: SchedulerConfig,
}

pub struct QueryScheduler {
    query_id: QueryId,
    root: Arc<StageExecution>,
    /// Parents before children.
    stages: Vec<Arc<StageExecution>>,
    /// Children before parents.
    schedulers: Mutex<Option<Vec<Box<dyn StageScheduler>>>>,
    state: StateMachine<QueryState>,
    failure: Mutex<Option<ExecError>>,
    scheduler_wait: Duration,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    started: AtomicBool,
}

impl QueryScheduler {
    pub fn new(
        query_id: QueryId,
        plan: &SubPlan,
        split_sources: HashMap<FragmentId, Arc<dyn SplitSource>>,
        deps: SchedulerDeps,
    ) -> Result<Arc<Self>> {
        validate_plan(plan)?;
        let node_task_map = Arc::new(NodeTaskMap::new());
        let selector = Arc::new(NodeSelector::new(
            Arc::clone(&deps.node_manager),
            Arc::clone(&node_task_map),
            &deps.config,
        ));
        let mut split_sources = split_sources;
        let mut stages = Vec::new();
        let mut schedulers: Vec<Box<dyn StageScheduler>> = Vec::new();
        let root = build_stage(
            &query_id,
            plan,
            OutputBuffers::single(),
            None,
            &deps,
            &node_task_map,
            &selector,
            &mut split_sources,
            &mut stages,
            &mut schedulers,
        )?;
        if let Some(unused) = split_sources.keys().next() {
            return Err(ExecError::invalid_plan(format!(
                "split source supplied for fragment {} which does not scan a table",
                unused
            )));
        }
        schedulers.reverse();
        let scheduler = Arc::new(Self {
            state: StateMachine::new(format!("query {}", query_id), QueryState::Planned, |s: &QueryState| s.is_done()),
            query_id,
            root,
            stages,
            schedulers: Mutex::new(Some(schedulers)),
            failure: Mutex::new(None),
            scheduler_wait: deps.config.scheduler_wait(),
            handle: Mutex::new(None),
            started: AtomicBool::new(false),
        });
        for stage in &scheduler.stages {
            let weak = Arc::downgrade(&scheduler);
            let stage_ref = Arc::downgrade(stage);
            stage.add_state_change_listener(move |state| {
                if let (Some(query), Some(stage)) = (weak.upgrade(), stage_ref.upgrade()) {
                    query.on_stage_state(&stage, *state);
                }
            });
        }
        Ok(scheduler)
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub fn state(&self) -> QueryState {
        self.state.get()
    }

    pub fn failure(&self) -> Option<ExecError> {
        self.failure.lock().expect("query failure lock").clone()
    }

    pub fn root_stage(&self) -> &Arc<StageExecution> {
        &self.root
    }

    pub fn stages(&self) -> &[Arc<StageExecution>] {
        &self.stages
    }

    pub fn add_state_change_listener(&self, listener: impl Fn(&QueryState) + Send + Sync + 'static) {
        self.state.add_state_change_listener(listener);
    }

    /// Remote reader over buffer 0 of every root task; finishes once the root stage has
    /// created all of its tasks and they are drained.
    pub fn result_client(
        &self,
        config: ExchangeClientConfig,
        transport: Arc<dyn ExchangeTransport>,
        io: Arc<IoExecutor>,
    ) -> Result<Arc<ExchangeClient>> {
        let client = ExchangeClient::new(config, transport, io);
        let weak_client = Arc::downgrade(&client);
        self.root.add_task_created_listener({
            let weak_client = weak_client.clone();
            move |task| {
                if let Some(client) = weak_client.upgrade()
                    && let Err(err) = client.add_location(task.task_location(0))
                {
                    warn!("result client rejected location: {}", err);
                }
            }
        });
        self.root.add_state_change_listener(move |state| {
            if state.is_scheduled()
                && let Some(client) = weak_client.upgrade()
            {
                client.no_more_locations();
            }
        });
        for task in self.root.tasks() {
            client.add_location(task.task_location(0))?;
        }
        if self.root.state().is_scheduled() {
            client.no_more_locations();
        }
        Ok(client)
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.set(QueryState::Scheduling);
        let schedulers = self
            .schedulers
            .lock()
            .expect("query schedulers lock")
            .take()
            .unwrap_or_default();
        let weak = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name(format!("query_scheduler_{}", self.query_id))
            .spawn(move || run_schedulers(weak, schedulers))
            .map_err(|e| ExecError::internal(format!("spawn query scheduler: {}", e)))?;
        *self.handle.lock().expect("query scheduler handle lock") = Some(handle);
        Ok(())
    }

    fn on_stage_state(&self, stage: &StageExecution, state: StageState) {
        match state {
            StageState::Failed => {
                let err = stage.failure().unwrap_or_else(|| {
                    ExecError::internal(format!("stage {} failed", stage.stage_id()))
                });
                self.fail(err);
            }
            StageState::Canceled | StageState::Aborted => {
                if !self.state().is_done() {
                    self.fail(ExecError::new(
                        ErrorCode::GenericInternalError,
                        format!("stage {} was {} unexpectedly", stage.stage_id(), state),
                    ));
                }
            }
            StageState::Finished => {
                if self.stages.iter().all(|s| s.state() == StageState::Finished) {
                    info!("query {} finished", self.query_id);
                    self.state.set(QueryState::Finished);
                }
            }
            StageState::Running => {
                self.state
                    .compare_and_set(&QueryState::Scheduling, QueryState::Running);
            }
            StageState::Planned | StageState::Scheduling | StageState::Scheduled => {}
        }
    }

    /// First failure wins; every stage is aborted.
    pub fn fail(&self, err: ExecError) {
        {
            let mut failure = self.failure.lock().expect("query failure lock");
            if failure.is_some() || self.state().is_done() {
                return;
            }
            *failure = Some(err.clone());
        }
        error!("query {} failed: {}", self.query_id, err);
        self.state.set(QueryState::Failed);
        for stage in &self.stages {
            stage.abort();
        }
    }

    pub fn cancel(&self) {
        if self.state().is_done() {
            return;
        }
        info!("query {} canceled", self.query_id);
        self.state.set(QueryState::Canceled);
        for stage in &self.stages {
            stage.cancel();
        }
    }

    /// Wait until the query reaches a final state or `timeout` elapses.
    pub fn wait_for_completion(&self, timeout: Duration) -> QueryState {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.state();
            let now = Instant::now();
            if current.is_done() || now >= deadline {
                return current;
            }
            self.state.wait_for_state_change(&current, deadline - now);
        }
    }

    pub fn info(&self) -> QueryInfo {
        QueryInfo {
            query_id: self.query_id.clone(),
            state: self.state(),
            failure: self.failure().map(|e| e.to_string()),
            stages: self.stages.iter().map(|s| s.info()).collect(),
        }
    }
}

impl Drop for QueryScheduler {
    fn drop(&mut self) {
        if !self.state().is_done() {
            for stage in &self.stages {
                stage.abort();
            }
        }
    }
}

fn run_schedulers(weak: Weak<QueryScheduler>, mut schedulers: Vec<Box<dyn StageScheduler>>) {
    let mut finished: BTreeSet<usize> = BTreeSet::new();
    // the wait of the current round; a query state change cuts it short
    let current_wait: Arc<Mutex<Option<SettableFuture<()>>>> = Arc::new(Mutex::new(None));
    if let Some(query) = weak.upgrade() {
        let current_wait = Arc::clone(&current_wait);
        query.state.add_state_change_listener(move |_| {
            if let Some(wait) = current_wait.lock().expect("scheduler wait lock").as_ref() {
                wait.set(());
            }
        });
    }
    loop {
        let Some(query) = weak.upgrade() else {
            break;
        };
        let state = query.state();
        if state.is_done() {
            break;
        }
        let mut blocked = Vec::new();
        let mut failed = None;
        for (idx, scheduler) in schedulers.iter_mut().enumerate() {
            if finished.contains(&idx) {
                continue;
            }
            if scheduler.stage().state().is_done() {
                finished.insert(idx);
                continue;
            }
            match scheduler.schedule() {
                Ok(result) => {
                    if result.finished {
                        debug!(
                            "query {} stage {} scheduled",
                            query.query_id,
                            scheduler.stage().stage_id()
                        );
                        finished.insert(idx);
                    } else if let Some(future) = result.blocked {
                        blocked.push(future);
                    }
                }
                Err(err) => {
                    scheduler.stage().fail(err.clone());
                    failed = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failed {
            query.fail(err);
            break;
        }
        if finished.len() == schedulers.len() {
            info!("query {} all stages scheduled", query.query_id);
            query
                .state
                .compare_and_set(&QueryState::Scheduling, QueryState::Running);
            break;
        }
        let wait = any_of(blocked);
        *current_wait.lock().expect("scheduler wait lock") = Some(wait.clone());
        let timeout = query.scheduler_wait;
        let changed = query.state() != state;
        drop(query);
        if !changed {
            wait.wait_timeout(timeout);
        }
        current_wait.lock().expect("scheduler wait lock").take();
    }
    for scheduler in schedulers.iter_mut() {
        scheduler.close();
    }
}

/// Number of tasks a stage runs; children partition their output to this many buffers.
fn partition_count(fragment: &PlanFragment, bucket_map: Option<&Arc<dyn BucketNodeMap>>) -> Result<usize> {
    match fragment.partitioning {
        PartitioningHandle::Single => Ok(1),
        PartitioningHandle::Hash { partition_count } => Ok(partition_count.max(1)),
        PartitioningHandle::FixedBucket { .. } => {
            let map = bucket_map.ok_or_else(|| {
                ExecError::invariant(format!("fragment {} has no bucket node map", fragment.id))
            })?;
            let nodes: BTreeSet<_> = (0..map.bucket_count())
                .filter_map(|b| map.get_assigned_node(b))
                .map(|n| n.node_id)
                .collect();
            Ok(nodes.len().max(1))
        }
        PartitioningHandle::Source => Err(ExecError::not_supported(format!(
            "source partitioned fragment {} cannot consume remote sources",
            fragment.id
        ))),
    }
}

fn child_output_buffers(partitioning: &OutputPartitioning, consumers: usize) -> Result<OutputBuffers> {
    match partitioning {
        OutputPartitioning::Single if consumers == 1 => Ok(OutputBuffers::single()),
        OutputPartitioning::Single => Err(ExecError::invalid_plan(format!(
            "single output consumed by {} partitions",
            consumers
        ))),
        OutputPartitioning::Hash { .. } => Ok(OutputBuffers::partitioned(consumers)),
        OutputPartitioning::Broadcast => Ok(OutputBuffers::broadcast(consumers)),
    }
}

fn validate_plan(plan: &SubPlan) -> Result<()> {
    for fragment in plan.all_fragments() {
        fragment.validate()?;
        let scans = fragment.root.partitioned_sources();
        let scans_table = matches!(
            fragment.partitioning,
            PartitioningHandle::Source | PartitioningHandle::FixedBucket { .. }
        );
        if scans.len() > 1 {
            return Err(ExecError::not_supported(format!(
                "fragment {} scans {} tables",
                fragment.id,
                scans.len()
            )));
        }
        if scans.len() == 1 && !scans_table {
            return Err(ExecError::invalid_plan(format!(
                "fragment {} scans a table but is not source or bucket partitioned",
                fragment.id
            )));
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_stage(
    query_id: &QueryId,
    plan: &SubPlan,
    output_buffers: OutputBuffers,
    parent: Option<&Arc<StageExecution>>,
    deps: &SchedulerDeps,
    node_task_map: &Arc<NodeTaskMap>,
    selector: &Arc<NodeSelector>,
    split_sources: &mut HashMap<FragmentId, Arc<dyn SplitSource>>,
    stages: &mut Vec<Arc<StageExecution>>,
    schedulers: &mut Vec<Box<dyn StageScheduler>>,
) -> Result<Arc<StageExecution>> {
    let fragment = &plan.fragment;
    let referenced: BTreeSet<FragmentId> = fragment
        .root
        .remote_sources()
        .into_iter()
        .flat_map(|(_, ids)| ids)
        .collect();
    let children: BTreeSet<FragmentId> = plan.children.iter().map(|c| c.fragment.id).collect();
    if referenced != children {
        return Err(ExecError::invalid_plan(format!(
            "fragment {} reads fragments {:?} but has children {:?}",
            fragment.id, referenced, children
        )));
    }

    let bucket_map = match fragment.partitioning {
        PartitioningHandle::FixedBucket { bucket_count } => Some(bucket_node_map(
            fragment,
            bucket_count,
            !plan.children.is_empty(),
            selector,
        )?),
        _ => None,
    };
    let consumers = if plan.children.is_empty() {
        0
    } else {
        partition_count(fragment, bucket_map.as_ref())?
    };
    let stage = StageExecution::new(
        query_id.clone(),
        fragment.clone(),
        output_buffers,
        Arc::clone(&deps.remote_task_factory),
        Arc::clone(node_task_map),
    );
    if let Some(parent) = parent {
        wire_to_parent(&stage, parent);
    }
    stages.push(Arc::clone(&stage));

    let scheduler: Box<dyn StageScheduler> = match fragment.partitioning {
        PartitioningHandle::Source | PartitioningHandle::FixedBucket { .. } => {
            let plan_node_id = fragment.root.partitioned_sources().first().copied().ok_or_else(|| {
                ExecError::invalid_plan(format!("fragment {} has no table scan", fragment.id))
            })?;
            let source = split_sources.remove(&fragment.id).ok_or_else(|| {
                ExecError::invalid_plan(format!("no split source for fragment {}", fragment.id))
            })?;
            match bucket_map {
                Some(map) => Box::new(FixedSourcePartitionedScheduler::new(
                    Arc::clone(&stage),
                    plan_node_id,
                    source,
                    map,
                    Arc::clone(selector),
                    deps.config.split_batch_size,
                )),
                None => Box::new(SourcePartitionedScheduler::new(
                    Arc::clone(&stage),
                    plan_node_id,
                    source,
                    Arc::clone(selector),
                    deps.config.split_batch_size,
                    deps.config.max_tasks_per_stage,
                )),
            }
        }
        PartitioningHandle::Single | PartitioningHandle::Hash { .. } => Box::new(
            FixedCountScheduler::new(Arc::clone(&stage), partition_count(fragment, None)?, Arc::clone(selector)),
        ),
    };
    schedulers.push(scheduler);

    if !plan.children.is_empty() {
        for child in &plan.children {
            let buffers = child_output_buffers(&child.fragment.output_partitioning, consumers)?;
            build_stage(
                query_id,
                child,
                buffers,
                Some(&stage),
                deps,
                node_task_map,
                selector,
                split_sources,
                stages,
                schedulers,
            )?;
        }
    }
    Ok(stage)
}

/// Bucketed stages with exchange inputs need a fixed task count, so their buckets are pinned
/// up front; leaf bucketed stages place buckets lazily.
fn bucket_node_map(
    fragment: &PlanFragment,
    bucket_count: usize,
    has_remote_inputs: bool,
    selector: &NodeSelector,
) -> Result<Arc<dyn BucketNodeMap>> {
    if !has_remote_inputs {
        return Ok(Arc::new(DynamicBucketNodeMap::new(bucket_count)));
    }
    let mut catalog = None;
    find_scan_catalog(&fragment.root, &mut catalog);
    let nodes: Vec<InternalNode> = selector.candidate_nodes(catalog.as_deref())?;
    Ok(Arc::new(FixedBucketNodeMap::uniform(bucket_count, &nodes)?))
}

fn find_scan_catalog(node: &PlanNode, out: &mut Option<String>) {
    if let PlanNode::TableScan { catalog, .. } = node {
        *out = Some(catalog.clone());
        return;
    }
    for child in node.children() {
        find_scan_catalog(child, out);
    }
}

/// Child task locations and task-set completion flow into the parent stage.
fn wire_to_parent(child: &Arc<StageExecution>, parent: &Arc<StageExecution>) {
    let child_id = child.stage_id();
    let weak_parent = Arc::downgrade(parent);
    child.add_task_created_listener(move |task| {
        if let Some(parent) = weak_parent.upgrade()
            && let Err(err) = parent.add_child_task(child_id, task.task_location(0))
        {
            parent.fail(err);
        }
    });
    let weak_parent = Arc::downgrade(parent);
    child.add_state_change_listener(move |state| {
        if state.is_scheduled()
            && let Some(parent) = weak_parent.upgrade()
            && let Err(err) = parent.no_more_child_tasks(child_id)
        {
            parent.fail(err);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::{PlanNodeId, StageId};
    use crate::common::status::ExecutionFailureInfo;
    use crate::connector::sequence;
    use crate::exec::page::ColumnType;
    use crate::runtime::task_state::TaskState;
    use crate::scheduler::split_source::BufferedSplitSource;
    use crate::scheduler::testing::{FakeTask, FakeTaskFactory, node_manager};

    const REMOTE_NODE: PlanNodeId = PlanNodeId(10);

    fn two_stage_plan() -> SubPlan {
        let leaf = PlanFragment::new(
            StageId(1),
            PlanNode::TableScan {
                id: PlanNodeId(1),
                catalog: "sequence".to_string(),
                output_types: vec![ColumnType::Int64],
            },
            PartitioningHandle::Source,
            OutputPartitioning::Hash { keys: vec![0] },
        )
        .unwrap();
        let root = PlanFragment::new(
            StageId(0),
            PlanNode::RemoteSource {
                id: REMOTE_NODE,
                source_fragments: vec![StageId(1)],
                output_types: vec![ColumnType::Int64],
            },
            PartitioningHandle::Single,
            OutputPartitioning::Single,
        )
        .unwrap();
        SubPlan::new(root, vec![SubPlan::leaf(leaf)])
    }

    fn scheduler(factory: Arc<FakeTaskFactory>) -> Arc<QueryScheduler> {
        let source = BufferedSplitSource::from_splits("sequence", sequence::splits(40, 10)).unwrap();
        let mut sources: HashMap<FragmentId, Arc<dyn SplitSource>> = HashMap::new();
        sources.insert(StageId(1), Arc::new(source));
        let deps = SchedulerDeps {
            node_manager: node_manager(&["w1", "w2"]),
            remote_task_factory: factory,
            config: SchedulerConfig::default(),
        };
        QueryScheduler::new(QueryId::local(), &two_stage_plan(), sources, deps).unwrap()
    }

    fn tasks_of(factory: &FakeTaskFactory, stage: u32) -> Vec<Arc<FakeTask>> {
        factory
            .created()
            .into_iter()
            .filter(|t| t.id.stage_id == StageId(stage))
            .collect()
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn root_task_reads_every_child_task_then_query_finishes() {
        let factory = Arc::new(FakeTaskFactory::default());
        let query = scheduler(Arc::clone(&factory));
        query.start().unwrap();
        wait_until(|| {
            tasks_of(&factory, 0)
                .first()
                .is_some_and(|t| t.no_more.lock().unwrap().contains(&REMOTE_NODE))
        });
        let children = tasks_of(&factory, 1);
        assert!(!children.is_empty());
        let root = &tasks_of(&factory, 0)[0];
        assert_eq!(root.split_count(), children.len());
        let scanned: usize = children.iter().map(|t| t.split_count()).sum();
        assert_eq!(scanned, 4);
        for child in &children {
            assert_eq!(child.output_buffers, OutputBuffers::partitioned(1));
            assert!(child.no_more.lock().unwrap().contains(&PlanNodeId(1)));
        }

        for task in children.iter().chain(std::iter::once(root)) {
            task.set_state(TaskState::Running);
            task.set_state(TaskState::Finished);
        }
        assert_eq!(query.wait_for_completion(Duration::from_secs(5)), QueryState::Finished);
        assert!(query.stages().iter().all(|s| s.state() == StageState::Finished));
    }

    #[test]
    fn child_task_failure_fails_query_and_aborts_all_tasks() {
        let factory = Arc::new(FakeTaskFactory::default());
        let query = scheduler(Arc::clone(&factory));
        query.start().unwrap();
        wait_until(|| !tasks_of(&factory, 0).is_empty() && !tasks_of(&factory, 1).is_empty());
        let child = &tasks_of(&factory, 1)[0];
        child.status.lock().unwrap().failures.push(ExecutionFailureInfo::from(&ExecError::new(
            ErrorCode::ConnectorError,
            "disk gone",
        )));
        child.set_state(TaskState::Failed);

        assert_eq!(query.wait_for_completion(Duration::from_secs(5)), QueryState::Failed);
        assert_eq!(query.failure().unwrap().code(), ErrorCode::ConnectorError);
        assert!(tasks_of(&factory, 0).iter().all(|t| t.aborted.load(Ordering::SeqCst)));
        let info = query.info();
        assert_eq!(info.state, QueryState::Failed);
        assert_eq!(info.stages.len(), 2);
    }

    #[test]
    fn cancel_is_final_and_reaches_tasks() {
        let factory = Arc::new(FakeTaskFactory::default());
        let query = scheduler(Arc::clone(&factory));
        query.start().unwrap();
        wait_until(|| !tasks_of(&factory, 0).is_empty());
        query.cancel();
        assert_eq!(query.state(), QueryState::Canceled);
        query.fail(ExecError::internal("late"));
        assert_eq!(query.state(), QueryState::Canceled);
        assert!(query.failure().is_none());
        assert!(tasks_of(&factory, 0).iter().all(|t| t.aborted.load(Ordering::SeqCst)));
    }

    #[test]
    fn split_source_without_scan_is_rejected() {
        let root = PlanFragment::new(
            StageId(0),
            PlanNode::Values {
                id: PlanNodeId(1),
                output_types: vec![ColumnType::Int64],
                rows: Vec::new(),
            },
            PartitioningHandle::Single,
            OutputPartitioning::Single,
        )
        .unwrap();
        let mut sources: HashMap<FragmentId, Arc<dyn SplitSource>> = HashMap::new();
        sources.insert(
            StageId(0),
            Arc::new(BufferedSplitSource::from_splits("sequence", Vec::new()).unwrap()),
        );
        let deps = SchedulerDeps {
            node_manager: node_manager(&["w1"]),
            remote_task_factory: Arc::new(FakeTaskFactory::default()),
            config: SchedulerConfig::default(),
        };
        let err = QueryScheduler::new(QueryId::local(), &SubPlan::leaf(root), sources, deps)
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::InvalidPlan);
    }
}
