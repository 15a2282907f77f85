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
//! Stage schedulers: task creation and split placement for one stage.
//!
//! Responsibilities:
//! - `SourcePartitionedScheduler` pulls batches from an all-at-once split source and places
//!   them dynamically, creating a task on a node the first time a split lands there.
//! - `FixedSourcePartitionedScheduler` drives a bucketed split source through a bucket node map.
//! - `FixedCountScheduler` creates a fixed number of tasks for single or hash partitioned stages.
//! - A transport failure while starting a task excludes the node and moves its work elsewhere;
//!   fixed bucket placement cannot move and fails instead.
//!
//! Key exported interfaces:
//! - Traits: `StageScheduler`.
//! - Types: `ScheduleResult`, `SourcePartitionedScheduler`, `FixedSourcePartitionedScheduler`,
//!   `FixedCountScheduler`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::future::SettableFuture;
use crate::common::ids::{NodeId, PlanNodeId};
use crate::common::status::{ErrorCode, ExecError, Result};
use crate::novaexec_logging::{debug, warn};
use crate::scheduler::bucket_node_map::BucketNodeMap;
use crate::scheduler::node_manager::InternalNode;
use crate::scheduler::node_selector::NodeSelector;
use crate::scheduler::remote_task::RemoteTask;
use crate::scheduler::split::Split;
use crate::scheduler::split_source::{BatchFuture, SplitSource};
use crate::scheduler::stage::StageExecution;

pub struct ScheduleResult {
    pub finished: bool,
    /// Resolves when calling `schedule` again can make progress.
    pub blocked: Option<SettableFuture<()>>,
    pub splits_scheduled: usize,
}

impl ScheduleResult {
    fn finished(splits_scheduled: usize) -> Self {
        Self {
            finished: true,
            blocked: None,
            splits_scheduled,
        }
    }

    fn blocked(future: SettableFuture<()>, splits_scheduled: usize) -> Self {
        Self {
            finished: false,
            blocked: Some(future),
            splits_scheduled,
        }
    }
}

pub trait StageScheduler: Send {
    fn stage(&self) -> &Arc<StageExecution>;

    fn schedule(&mut self) -> Result<ScheduleResult>;

    fn close(&mut self) {}
}

/// Resolves when any of `futures` resolves.
pub fn any_of(futures: Vec<SettableFuture<()>>) -> SettableFuture<()> {
    let combined = SettableFuture::new();
    for future in futures {
        let combined = combined.clone();
        future.add_listener(move |_| {
            combined.set(());
        });
    }
    combined
}

fn batch_ready(future: &BatchFuture) -> SettableFuture<()> {
    let ready = SettableFuture::new();
    let signal = ready.clone();
    future.add_listener(move |_| {
        signal.set(());
    });
    ready
}

/// Get the stage task on `node`, creating it with the next partition id on first use.
fn task_on_node(
    stage: &StageExecution,
    tasks: &mut HashMap<NodeId, Arc<dyn RemoteTask>>,
    node: &InternalNode,
) -> Result<Arc<dyn RemoteTask>> {
    if let Some(task) = tasks.get(&node.node_id) {
        return Ok(Arc::clone(task));
    }
    let task = stage.schedule_task(node, stage.task_count() as u32)?;
    tasks.insert(node.node_id.clone(), Arc::clone(&task));
    Ok(task)
}

pub struct SourcePartitionedScheduler {
    stage: Arc<StageExecution>,
    plan_node_id: PlanNodeId,
    catalog: String,
    split_source: Arc<dyn SplitSource>,
    selector: Arc<NodeSelector>,
    batch_size: usize,
    max_tasks: usize,
    tasks: HashMap<NodeId, Arc<dyn RemoteTask>>,
    pending_batch: Option<BatchFuture>,
    pending_splits: Vec<Split>,
    source_finished: bool,
    finished: bool,
}

impl SourcePartitionedScheduler {
    pub fn new(
        stage: Arc<StageExecution>,
        plan_node_id: PlanNodeId,
        split_source: Arc<dyn SplitSource>,
        selector: Arc<NodeSelector>,
        batch_size: usize,
        max_tasks: usize,
    ) -> Self {
        Self {
            stage,
            plan_node_id,
            catalog: split_source.catalog().to_string(),
            split_source,
            selector,
            batch_size: batch_size.max(1),
            max_tasks: max_tasks.max(1),
            tasks: HashMap::new(),
            pending_batch: None,
            pending_splits: Vec::new(),
            source_finished: false,
            finished: false,
        }
    }

    fn place(&mut self, splits: Vec<Split>) -> Result<(usize, Vec<Split>)> {
        let existing_only = self.tasks.len() >= self.max_tasks;
        let placement =
            self.selector
                .compute_assignments(&self.catalog, splits, &self.tasks, existing_only)?;
        let mut scheduled = 0;
        let mut retry = Vec::new();
        for (node_id, (node, splits)) in placement.assignments {
            match task_on_node(&self.stage, &mut self.tasks, &node) {
                Ok(task) => {
                    scheduled += splits.len();
                    task.add_splits(self.plan_node_id, splits)?;
                }
                Err(err) if err.is_retryable() => {
                    self.selector.exclude_node(&node_id);
                    retry.extend(splits);
                }
                Err(err) => return Err(err),
            }
        }
        let mut unassigned = placement.unassigned;
        unassigned.extend(retry);
        Ok((scheduled, unassigned))
    }

    /// A stage always gets at least one task so its consumers see an end of data.
    fn ensure_one_task(&mut self) -> Result<()> {
        while self.tasks.is_empty() {
            let candidates = self.selector.candidate_nodes(Some(&self.catalog))?;
            let node = &candidates[0];
            match task_on_node(&self.stage, &mut self.tasks, node) {
                Ok(_) => {}
                Err(err) if err.is_retryable() => self.selector.exclude_node(&node.node_id),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl StageScheduler for SourcePartitionedScheduler {
    fn stage(&self) -> &Arc<StageExecution> {
        &self.stage
    }

    fn schedule(&mut self) -> Result<ScheduleResult> {
        if self.finished {
            return Ok(ScheduleResult::finished(0));
        }
        self.stage.begin_scheduling();
        let mut scheduled = 0;
        loop {
            if !self.pending_splits.is_empty() {
                let splits = std::mem::take(&mut self.pending_splits);
                let before = splits.len();
                let (placed, unassigned) = self.place(splits)?;
                scheduled += placed;
                if !unassigned.is_empty() {
                    let progressed = unassigned.len() < before;
                    self.pending_splits = unassigned;
                    if progressed {
                        // excluded nodes freed some splits for another placement round
                        continue;
                    }
                    let blocked = self.selector.when_any_task_has_space(&self.tasks);
                    return Ok(ScheduleResult::blocked(blocked, scheduled));
                }
                continue;
            }
            if self.source_finished {
                break;
            }
            let future = self
                .pending_batch
                .get_or_insert_with(|| self.split_source.get_next_batch(None, self.batch_size))
                .clone();
            match future.try_get() {
                None => return Ok(ScheduleResult::blocked(batch_ready(&future), scheduled)),
                Some(result) => {
                    self.pending_batch = None;
                    let batch = result?;
                    debug!(
                        "stage {} received {} splits (last={})",
                        self.stage.stage_id(),
                        batch.splits.len(),
                        batch.last_batch
                    );
                    self.pending_splits = batch.splits;
                    self.source_finished = batch.last_batch;
                }
            }
        }
        self.ensure_one_task()?;
        for task in self.tasks.values() {
            task.no_more_splits(self.plan_node_id)?;
        }
        self.stage.transition_to_scheduled();
        self.finished = true;
        Ok(ScheduleResult::finished(scheduled))
    }

    fn close(&mut self) {
        self.split_source.close();
    }
}

struct BucketProgress {
    pending_batch: Option<BatchFuture>,
    finished: bool,
}

pub struct FixedSourcePartitionedScheduler {
    stage: Arc<StageExecution>,
    plan_node_id: PlanNodeId,
    catalog: String,
    split_source: Arc<dyn SplitSource>,
    bucket_node_map: Arc<dyn BucketNodeMap>,
    selector: Arc<NodeSelector>,
    batch_size: usize,
    tasks: HashMap<NodeId, Arc<dyn RemoteTask>>,
    buckets_per_node: HashMap<NodeId, usize>,
    buckets: Option<Vec<(usize, BucketProgress)>>,
    finished: bool,
}

impl FixedSourcePartitionedScheduler {
    pub fn new(
        stage: Arc<StageExecution>,
        plan_node_id: PlanNodeId,
        split_source: Arc<dyn SplitSource>,
        bucket_node_map: Arc<dyn BucketNodeMap>,
        selector: Arc<NodeSelector>,
        batch_size: usize,
    ) -> Self {
        Self {
            stage,
            plan_node_id,
            catalog: split_source.catalog().to_string(),
            split_source,
            bucket_node_map,
            selector,
            batch_size: batch_size.max(1),
            tasks: HashMap::new(),
            buckets_per_node: HashMap::new(),
            buckets: None,
            finished: false,
        }
    }

    /// Fixed maps get every task up front, in bucket order, so partition ids are stable.
    fn start_fixed_tasks(&mut self) -> Result<()> {
        if self.bucket_node_map.is_dynamic() {
            return Ok(());
        }
        for bucket in 0..self.bucket_node_map.bucket_count() {
            let node = self.assigned_node(bucket)?;
            task_on_node(&self.stage, &mut self.tasks, &node)?;
        }
        Ok(())
    }

    fn assigned_node(&self, bucket: usize) -> Result<InternalNode> {
        self.bucket_node_map.get_assigned_node(bucket).ok_or_else(|| {
            ExecError::invariant(format!("bucket {} has no assigned node", bucket))
        })
    }

    /// Node and task for `bucket`; dynamic maps pin the bucket to the node holding the
    /// fewest buckets on first use.
    fn task_for_bucket(&mut self, bucket: usize) -> Result<Arc<dyn RemoteTask>> {
        if let Some(node) = self.bucket_node_map.get_assigned_node(bucket) {
            return task_on_node(&self.stage, &mut self.tasks, &node);
        }
        loop {
            let candidates = self.selector.candidate_nodes(Some(&self.catalog))?;
            let node = candidates
                .iter()
                .min_by_key(|n| self.buckets_per_node.get(&n.node_id).copied().unwrap_or(0))
                .cloned()
                .ok_or_else(|| ExecError::new(ErrorCode::NoNodesAvailable, "no candidate nodes"))?;
            match task_on_node(&self.stage, &mut self.tasks, &node) {
                Ok(task) => {
                    self.bucket_node_map.assign_bucket_to_node(bucket, node.clone())?;
                    *self.buckets_per_node.entry(node.node_id).or_default() += 1;
                    return Ok(task);
                }
                Err(err) if err.is_retryable() => self.selector.exclude_node(&node.node_id),
                Err(err) => return Err(err),
            }
        }
    }
}

impl StageScheduler for FixedSourcePartitionedScheduler {
    fn stage(&self) -> &Arc<StageExecution> {
        &self.stage
    }

    fn schedule(&mut self) -> Result<ScheduleResult> {
        if self.finished {
            return Ok(ScheduleResult::finished(0));
        }
        self.stage.begin_scheduling();
        if self.buckets.is_none() {
            self.start_fixed_tasks()?;
            self.buckets = Some(
                self.split_source
                    .buckets()
                    .into_iter()
                    .map(|b| {
                        (
                            b,
                            BucketProgress {
                                pending_batch: None,
                                finished: false,
                            },
                        )
                    })
                    .collect(),
            );
        }
        let mut buckets = self.buckets.take().unwrap_or_default();
        let mut scheduled = 0;
        let mut waiting = Vec::new();
        let mut outcome = Ok(());
        'buckets: for (bucket, progress) in buckets.iter_mut() {
            while !progress.finished {
                let future = progress
                    .pending_batch
                    .get_or_insert_with(|| {
                        self.split_source.get_next_batch(Some(*bucket), self.batch_size)
                    })
                    .clone();
                let Some(result) = future.try_get() else {
                    waiting.push(batch_ready(&future));
                    break;
                };
                progress.pending_batch = None;
                let batch = match result {
                    Ok(batch) => batch,
                    Err(err) => {
                        outcome = Err(err);
                        break 'buckets;
                    }
                };
                if !batch.splits.is_empty() {
                    scheduled += batch.splits.len();
                    let placed = self
                        .task_for_bucket(*bucket)
                        .and_then(|task| task.add_splits(self.plan_node_id, batch.splits));
                    if let Err(err) = placed {
                        outcome = Err(err);
                        break 'buckets;
                    }
                }
                progress.finished = batch.last_batch;
            }
        }
        let all_finished = buckets.iter().all(|(_, p)| p.finished);
        self.buckets = Some(buckets);
        outcome?;
        if !all_finished {
            return Ok(ScheduleResult::blocked(any_of(waiting), scheduled));
        }
        if self.tasks.is_empty() {
            if self.bucket_node_map.bucket_count() == 0 {
                let candidates = self.selector.candidate_nodes(Some(&self.catalog))?;
                task_on_node(&self.stage, &mut self.tasks, &candidates[0])?;
            } else {
                self.task_for_bucket(0)?;
            }
        }
        for task in self.tasks.values() {
            task.no_more_splits(self.plan_node_id)?;
        }
        self.stage.transition_to_scheduled();
        self.finished = true;
        Ok(ScheduleResult::finished(scheduled))
    }

    fn close(&mut self) {
        self.split_source.close();
    }
}

/// Creates `partition_count` tasks round-robin over the active nodes.
pub struct FixedCountScheduler {
    stage: Arc<StageExecution>,
    partition_count: usize,
    selector: Arc<NodeSelector>,
    finished: bool,
}

impl FixedCountScheduler {
    pub fn new(stage: Arc<StageExecution>, partition_count: usize, selector: Arc<NodeSelector>) -> Self {
        Self {
            stage,
            partition_count: partition_count.max(1),
            selector,
            finished: false,
        }
    }
}

impl StageScheduler for FixedCountScheduler {
    fn stage(&self) -> &Arc<StageExecution> {
        &self.stage
    }

    fn schedule(&mut self) -> Result<ScheduleResult> {
        if self.finished {
            return Ok(ScheduleResult::finished(0));
        }
        self.stage.begin_scheduling();
        let mut partition = self.stage.task_count();
        while partition < self.partition_count {
            let candidates = self.selector.candidate_nodes(None)?;
            let node = &candidates[partition % candidates.len()];
            match self.stage.schedule_task(node, partition as u32) {
                Ok(_) => partition += 1,
                Err(err) if err.is_retryable() => {
                    warn!(
                        "stage {} partition {} moves off node {}: {}",
                        self.stage.stage_id(),
                        partition,
                        node.node_id,
                        err
                    );
                    self.selector.exclude_node(&node.node_id);
                }
                Err(err) => return Err(err),
            }
        }
        self.stage.transition_to_scheduled();
        self.finished = true;
        Ok(ScheduleResult::finished(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::app_config::SchedulerConfig;
    use crate::common::ids::{QueryId, StageId};
    use crate::connector::sequence;
    use crate::exec::page::ColumnType;
    use crate::exec::plan::{OutputPartitioning, PartitioningHandle, PlanFragment, PlanNode};
    use crate::runtime::output_buffer::OutputBuffers;
    use crate::scheduler::bucket_node_map::{DynamicBucketNodeMap, FixedBucketNodeMap};
    use crate::scheduler::node_selector::NodeTaskMap;
    use crate::scheduler::split_source::BufferedSplitSource;
    use crate::scheduler::stage::StageState;
    use crate::scheduler::testing::{FakeTaskFactory, node, node_manager};

    fn scan_fragment(partitioning: PartitioningHandle) -> PlanFragment {
        PlanFragment::new(
            StageId(1),
            PlanNode::TableScan {
                id: PlanNodeId(0),
                catalog: "sequence".to_string(),
                output_types: vec![ColumnType::Int64],
            },
            partitioning,
            OutputPartitioning::Single,
        )
        .unwrap()
    }

    struct Fixture {
        factory: Arc<FakeTaskFactory>,
        stage: Arc<StageExecution>,
        selector: Arc<NodeSelector>,
    }

    fn fixture(nodes: &[&str], factory: FakeTaskFactory, partitioning: PartitioningHandle, per_task: usize) -> Fixture {
        let factory = Arc::new(factory);
        let task_map = Arc::new(NodeTaskMap::new());
        let stage = StageExecution::new(
            QueryId::local(),
            scan_fragment(partitioning),
            OutputBuffers::single(),
            Arc::clone(&factory) as Arc<dyn crate::scheduler::remote_task::RemoteTaskFactory>,
            Arc::clone(&task_map),
        );
        let config = SchedulerConfig {
            max_pending_splits_per_task: per_task,
            ..SchedulerConfig::default()
        };
        let selector = Arc::new(NodeSelector::new(node_manager(nodes), task_map, &config));
        Fixture {
            factory,
            stage,
            selector,
        }
    }

    #[test]
    fn source_scheduler_places_all_splits_and_finishes() {
        let f = fixture(&["a", "b"], FakeTaskFactory::default(), PartitioningHandle::Source, 100);
        let source = Arc::new(BufferedSplitSource::from_splits("sequence", sequence::splits(100, 10)).unwrap());
        let mut scheduler =
            SourcePartitionedScheduler::new(Arc::clone(&f.stage), PlanNodeId(0), source, Arc::clone(&f.selector), 3, usize::MAX);
        let result = scheduler.schedule().unwrap();
        assert!(result.finished);
        assert_eq!(result.splits_scheduled, 10);
        let created = f.factory.created();
        assert_eq!(created.len(), 2);
        assert_eq!(created.iter().map(|t| t.split_count()).sum::<usize>(), 10);
        assert!(created.iter().all(|t| t.no_more.lock().unwrap().contains(&PlanNodeId(0))));
        assert_eq!(f.stage.state(), StageState::Scheduled);
    }

    #[test]
    fn source_scheduler_blocks_on_saturated_tasks_then_resumes() {
        let f = fixture(&["a"], FakeTaskFactory::default(), PartitioningHandle::Source, 2);
        let source = Arc::new(BufferedSplitSource::from_splits("sequence", sequence::splits(50, 10)).unwrap());
        let mut scheduler =
            SourcePartitionedScheduler::new(Arc::clone(&f.stage), PlanNodeId(0), source, Arc::clone(&f.selector), 10, usize::MAX);
        let result = scheduler.schedule().unwrap();
        assert!(!result.finished);
        assert_eq!(result.splits_scheduled, 2);
        let blocked = result.blocked.unwrap();
        assert!(!blocked.is_done());
        f.factory.created()[0].drain();
        assert!(blocked.is_done());
        let result = scheduler.schedule().unwrap();
        assert_eq!(result.splits_scheduled, 2);
    }

    #[test]
    fn failed_node_is_excluded_and_splits_move() {
        let f = fixture(&["a", "b"], FakeTaskFactory::failing_on(&["a"]), PartitioningHandle::Source, 100);
        let source = Arc::new(BufferedSplitSource::from_splits("sequence", sequence::splits(40, 10)).unwrap());
        let mut scheduler =
            SourcePartitionedScheduler::new(Arc::clone(&f.stage), PlanNodeId(0), source, Arc::clone(&f.selector), 10, usize::MAX);
        assert!(scheduler.schedule().unwrap().finished);
        assert!(f.selector.is_excluded(&NodeId::new("a")));
        let tasks = f.stage.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].node().node_id, NodeId::new("b"));
        assert_eq!(tasks[0].task_id().partition_id, 0);
        let started = f.factory.created();
        assert_eq!(started.last().unwrap().split_count(), 4);
    }

    #[test]
    fn empty_source_still_creates_one_task() {
        let f = fixture(&["a"], FakeTaskFactory::default(), PartitioningHandle::Source, 100);
        let source = Arc::new(BufferedSplitSource::from_splits("sequence", Vec::new()).unwrap());
        let mut scheduler =
            SourcePartitionedScheduler::new(Arc::clone(&f.stage), PlanNodeId(0), source, Arc::clone(&f.selector), 10, usize::MAX);
        assert!(scheduler.schedule().unwrap().finished);
        assert_eq!(f.stage.task_count(), 1);
    }

    #[test]
    fn bucketed_scheduler_follows_fixed_map() {
        let f = fixture(&["a", "b"], FakeTaskFactory::default(), PartitioningHandle::FixedBucket { bucket_count: 4 }, 100);
        let map = Arc::new(FixedBucketNodeMap::uniform(4, &[node("a"), node("b")]).unwrap());
        let source = Arc::new(BufferedSplitSource::bucketed("sequence", 4, true));
        source
            .add_to_queue((0..8).map(|i| sequence::split(i, i + 1).with_bucket((i % 4) as usize)).collect())
            .unwrap();
        let mut scheduler = FixedSourcePartitionedScheduler::new(
            Arc::clone(&f.stage),
            PlanNodeId(0),
            Arc::clone(&source) as Arc<dyn SplitSource>,
            map,
            Arc::clone(&f.selector),
            10,
        );
        let result = scheduler.schedule().unwrap();
        assert!(!result.finished);
        assert_eq!(result.splits_scheduled, 0);
        source.no_more_splits();
        assert!(result.blocked.unwrap().is_done());
        let result = scheduler.schedule().unwrap();
        assert!(result.finished);
        let created = f.factory.created();
        assert_eq!(created.len(), 2);
        for task in &created {
            let buckets: Vec<usize> = task.splits.lock().unwrap().iter().map(|(_, s)| s.bucket.unwrap()).collect();
            let expected = if task.node.node_id == NodeId::new("a") { [0, 2] } else { [1, 3] };
            assert!(buckets.iter().all(|b| expected.contains(b)));
            assert_eq!(buckets.len(), 4);
        }
    }

    #[test]
    fn dynamic_bucket_map_pins_each_bucket_once() {
        let f = fixture(&["a", "b"], FakeTaskFactory::default(), PartitioningHandle::FixedBucket { bucket_count: 2 }, 100);
        let map = Arc::new(DynamicBucketNodeMap::new(2));
        let source = Arc::new(BufferedSplitSource::bucketed("sequence", 2, false));
        let mut scheduler = FixedSourcePartitionedScheduler::new(
            Arc::clone(&f.stage),
            PlanNodeId(0),
            Arc::clone(&source) as Arc<dyn SplitSource>,
            Arc::clone(&map) as Arc<dyn BucketNodeMap>,
            Arc::clone(&f.selector),
            10,
        );
        source.add_to_queue(vec![sequence::split(0, 1).with_bucket(0)]).unwrap();
        scheduler.schedule().unwrap();
        let first = map.get_assigned_node(0).unwrap();
        source.add_to_queue(vec![sequence::split(1, 2).with_bucket(0), sequence::split(2, 3).with_bucket(1)]).unwrap();
        source.no_more_splits();
        assert!(scheduler.schedule().unwrap().finished);
        assert_eq!(map.get_assigned_node(0).unwrap(), first);
        assert_ne!(map.get_assigned_node(1).unwrap(), first);
    }

    #[test]
    fn fixed_count_scheduler_creates_every_partition() {
        let f = fixture(&["a", "b", "c"], FakeTaskFactory::failing_on(&["b"]), PartitioningHandle::Hash { partition_count: 4 }, 100);
        let mut scheduler = FixedCountScheduler::new(Arc::clone(&f.stage), 4, Arc::clone(&f.selector));
        assert!(scheduler.schedule().unwrap().finished);
        let mut partitions: Vec<u32> = f.stage.tasks().iter().map(|t| t.task_id().partition_id).collect();
        partitions.sort();
        assert_eq!(partitions, vec![0, 1, 2, 3]);
        assert!(f.stage.tasks().iter().all(|t| t.node().node_id != NodeId::new("b")));
    }
}
