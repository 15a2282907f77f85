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
//! Split placement over the active nodes.
//!
//! Responsibilities:
//! - Places splits uniformly on the least loaded candidate node of a catalog.
//! - Honors the per-node split limit across every task of the query and the per-task pending
//!   split limit; splits that fit nowhere are returned unassigned, and
//!   `when_any_task_has_space` resolves once a saturated task drains.
//! - Excludes nodes on which task creation failed.
//!
//! Key exported interfaces:
//! - Types: `NodeSelector`, `NodeTaskMap`, `SplitPlacementResult`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};

use crate::common::app_config::SchedulerConfig;
use crate::common::future::SettableFuture;
use crate::common::ids::NodeId;
use crate::common::status::{ErrorCode, ExecError, Result};
use crate::novaexec_logging::{debug, warn};
use crate::scheduler::node_manager::{InternalNode, NodeManager};
use crate::scheduler::remote_task::RemoteTask;
use crate::scheduler::split::Split;

/// Every live remote task of a query, by node.
#[derive(Default)]
pub struct NodeTaskMap {
    tasks: Mutex<HashMap<NodeId, Vec<Weak<dyn RemoteTask>>>>,
}

impl NodeTaskMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&self, task: &Arc<dyn RemoteTask>) {
        let mut tasks = self.tasks.lock().expect("node task map lock");
        tasks
            .entry(task.node().node_id.clone())
            .or_default()
            .push(Arc::downgrade(task));
    }

    /// Splits queued or running on `node` over all tasks that are not done.
    pub fn splits_on_node(&self, node: &NodeId) -> usize {
        let mut tasks = self.tasks.lock().expect("node task map lock");
        let Some(entries) = tasks.get_mut(node) else {
            return 0;
        };
        entries.retain(|w| w.strong_count() > 0);
        entries
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|t| !t.task_status().is_done())
            .map(|t| t.queued_split_count())
            .sum()
    }
}

#[derive(Default)]
pub struct SplitPlacementResult {
    pub assignments: BTreeMap<NodeId, (InternalNode, Vec<Split>)>,
    pub unassigned: Vec<Split>,
}

pub struct NodeSelector {
    node_manager: Arc<NodeManager>,
    node_task_map: Arc<NodeTaskMap>,
    max_splits_per_node: usize,
    max_pending_splits_per_task: usize,
    excluded: Mutex<BTreeSet<NodeId>>,
}

impl NodeSelector {
    pub fn new(
        node_manager: Arc<NodeManager>,
        node_task_map: Arc<NodeTaskMap>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            node_manager,
            node_task_map,
            max_splits_per_node: config.max_splits_per_node.max(1),
            max_pending_splits_per_task: config.max_pending_splits_per_task.max(1),
            excluded: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn exclude_node(&self, node_id: &NodeId) {
        warn!("excluding node {} from placement", node_id);
        self.excluded
            .lock()
            .expect("node selector lock")
            .insert(node_id.clone());
    }

    pub fn is_excluded(&self, node_id: &NodeId) -> bool {
        self.excluded.lock().expect("node selector lock").contains(node_id)
    }

    /// Active, not excluded nodes able to read `catalog`; workers are preferred over
    /// coordinators. `None` selects from every active node.
    pub fn candidate_nodes(&self, catalog: Option<&str>) -> Result<Vec<InternalNode>> {
        let excluded = self.excluded.lock().expect("node selector lock").clone();
        let all = self.node_manager.get_all_nodes();
        let eligible: Vec<InternalNode> = all
            .active
            .iter()
            .filter(|n| !excluded.contains(&n.node_id))
            .filter(|n| catalog.is_none_or(|c| n.serves_catalog(c)))
            .cloned()
            .collect();
        let workers: Vec<InternalNode> =
            eligible.iter().filter(|n| !n.coordinator).cloned().collect();
        let candidates = if workers.is_empty() { eligible } else { workers };
        if candidates.is_empty() {
            return Err(ExecError::new(
                ErrorCode::NoNodesAvailable,
                match catalog {
                    Some(c) => format!("no active nodes available for catalog {}", c),
                    None => "no active nodes available".to_string(),
                },
            ));
        }
        Ok(candidates)
    }

    /// Place `splits` on the least loaded candidates. `tasks` maps nodes to this stage's
    /// existing tasks; nodes without a task start at zero pending splits. With
    /// `existing_tasks_only`, only nodes that already run a task of the stage are used.
    pub fn compute_assignments(
        &self,
        catalog: &str,
        splits: Vec<Split>,
        tasks: &HashMap<NodeId, Arc<dyn RemoteTask>>,
        existing_tasks_only: bool,
    ) -> Result<SplitPlacementResult> {
        let mut candidates = self.candidate_nodes(Some(catalog))?;
        if existing_tasks_only {
            candidates.retain(|n| tasks.contains_key(&n.node_id));
            if candidates.is_empty() {
                return Err(ExecError::new(
                    ErrorCode::NoNodesAvailable,
                    format!("no node running a task of this stage can read catalog {}", catalog),
                ));
            }
        }
        let mut node_load: Vec<usize> = candidates
            .iter()
            .map(|n| self.node_task_map.splits_on_node(&n.node_id))
            .collect();
        let mut task_load: Vec<usize> = candidates
            .iter()
            .map(|n| tasks.get(&n.node_id).map_or(0, |t| t.queued_split_count()))
            .collect();
        let mut result = SplitPlacementResult::default();
        for split in splits {
            let chosen = (0..candidates.len())
                .filter(|&i| {
                    node_load[i] < self.max_splits_per_node
                        && task_load[i] < self.max_pending_splits_per_task
                })
                .min_by_key(|&i| (task_load[i], node_load[i]));
            match chosen {
                Some(i) => {
                    node_load[i] += 1;
                    task_load[i] += 1;
                    let node = &candidates[i];
                    result
                        .assignments
                        .entry(node.node_id.clone())
                        .or_insert_with(|| (node.clone(), Vec::new()))
                        .1
                        .push(split);
                }
                None => result.unassigned.push(split),
            }
        }
        if !result.unassigned.is_empty() {
            debug!(
                "{} splits of catalog {} could not be placed, all {} candidates saturated",
                result.unassigned.len(),
                catalog,
                candidates.len()
            );
        }
        Ok(result)
    }

    /// Resolves once any of `tasks` drops below the pending split limit. With no task to
    /// wait on it never resolves and the scheduler re-polls after its bounded wait.
    pub fn when_any_task_has_space(
        &self,
        tasks: &HashMap<NodeId, Arc<dyn RemoteTask>>,
    ) -> SettableFuture<()> {
        let combined = SettableFuture::new();
        for task in tasks.values() {
            let combined = combined.clone();
            task.when_split_queue_has_space(self.max_pending_splits_per_task)
                .add_listener(move |_| {
                    combined.set(());
                });
        }
        combined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::{QueryId, StageId, TaskId};
    use crate::connector::sequence;
    use crate::scheduler::testing::{FakeTask, node, node_manager};

    fn config(per_node: usize, per_task: usize) -> SchedulerConfig {
        SchedulerConfig {
            max_splits_per_node: per_node,
            max_pending_splits_per_task: per_task,
            ..SchedulerConfig::default()
        }
    }

    fn selector(nodes: &[&str], per_node: usize, per_task: usize) -> NodeSelector {
        NodeSelector::new(node_manager(nodes), Arc::new(NodeTaskMap::new()), &config(per_node, per_task))
    }

    #[test]
    fn spreads_splits_uniformly() {
        let selector = selector(&["a", "b"], 100, 100);
        let result = selector
            .compute_assignments("sequence", sequence::splits(40, 10), &HashMap::new(), false)
            .unwrap();
        assert!(result.unassigned.is_empty());
        assert_eq!(result.assignments[&NodeId::new("a")].1.len(), 2);
        assert_eq!(result.assignments[&NodeId::new("b")].1.len(), 2);
    }

    #[test]
    fn saturated_tasks_leave_splits_unassigned_with_blocked_future() {
        let selector = selector(&["a"], 100, 2);
        let fake = Arc::new(FakeTask::new(TaskId::new(QueryId::local(), StageId(0), 0), node("a")));
        fake.queued.store(1, std::sync::atomic::Ordering::SeqCst);
        let task: Arc<dyn RemoteTask> = Arc::clone(&fake) as Arc<dyn RemoteTask>;
        let tasks: HashMap<_, _> = [(NodeId::new("a"), Arc::clone(&task))].into_iter().collect();
        let mut result = selector
            .compute_assignments("sequence", sequence::splits(30, 10), &tasks, false)
            .unwrap();
        let (_, assigned) = result.assignments.remove(&NodeId::new("a")).unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(result.unassigned.len(), 2);
        task.add_splits(crate::common::ids::PlanNodeId(0), assigned).unwrap();
        let blocked = selector.when_any_task_has_space(&tasks);
        assert!(!blocked.is_done());
        fake.drain();
        assert!(blocked.is_done());
    }

    #[test]
    fn per_node_limit_counts_tasks_of_other_stages() {
        let map = Arc::new(NodeTaskMap::new());
        let selector = NodeSelector::new(node_manager(&["a", "b"]), Arc::clone(&map), &config(3, 100));
        let other = Arc::new(FakeTask::new(TaskId::new(QueryId::local(), StageId(9), 0), node("a")));
        other.queued.store(3, std::sync::atomic::Ordering::SeqCst);
        let other: Arc<dyn RemoteTask> = other;
        map.add_task(&other);
        let result = selector
            .compute_assignments("sequence", sequence::splits(20, 10), &HashMap::new(), false)
            .unwrap();
        assert!(!result.assignments.contains_key(&NodeId::new("a")));
        assert_eq!(result.assignments[&NodeId::new("b")].1.len(), 2);
    }

    #[test]
    fn excluded_nodes_are_skipped() {
        let selector = selector(&["a", "b"], 100, 100);
        selector.exclude_node(&NodeId::new("a"));
        let result = selector
            .compute_assignments("sequence", sequence::splits(20, 10), &HashMap::new(), false)
            .unwrap();
        assert_eq!(result.assignments.len(), 1);
        assert!(result.assignments.contains_key(&NodeId::new("b")));
        selector.exclude_node(&NodeId::new("b"));
        let err = selector.candidate_nodes(None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoNodesAvailable);
    }
}
