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
//! Per-node registry of running and recently finished tasks.
//!
//! Responsibilities:
//! - Creates tasks on their first update and routes coordinator and consumer requests to them.
//! - Fails tasks whose coordinator stopped polling and forgets finished tasks after a
//!   retention period, from a background maintenance thread.
//!
//! Key exported interfaces:
//! - Types: `TaskManager`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::common::app_config::RuntimeConfig;
use crate::common::ids::{NodeId, TaskId};
use crate::common::status::{ErrorCode, ExecError, Result};
use crate::novaexec_logging::{debug, error, info};
use crate::runtime::output_buffer::BufferResult;
use crate::runtime::query_context::QueryContextManager;
use crate::runtime::sql_task::{SqlTask, TaskRuntime};
use crate::runtime::task_info::{TaskInfo, TaskStatus, TaskUpdateRequest};
use crate::runtime::task_state::TaskState;

pub struct TaskManager {
    node_id: NodeId,
    runtime: TaskRuntime,
    query_contexts: Arc<QueryContextManager>,
    tasks: Mutex<HashMap<TaskId, Arc<SqlTask>>>,
    client_timeout: Duration,
    info_max_age: Duration,
    status_max_wait: Duration,
    shutdown: AtomicBool,
    maintenance_cv: Condvar,
    maintenance_mu: Mutex<()>,
    maintenance: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TaskManager {
    pub fn new(
        node_id: NodeId,
        runtime: TaskRuntime,
        query_contexts: Arc<QueryContextManager>,
        config: &RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            runtime,
            query_contexts,
            tasks: Mutex::new(HashMap::new()),
            client_timeout: Duration::from_millis(config.task_client_timeout_ms),
            info_max_age: Duration::from_millis(config.task_info_max_age_ms),
            status_max_wait: config.task_status_max_wait(),
            shutdown: AtomicBool::new(false),
            maintenance_cv: Condvar::new(),
            maintenance_mu: Mutex::new(()),
            maintenance: Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Caps the long-poll wait a client may request.
    pub fn status_max_wait(&self) -> Duration {
        self.status_max_wait
    }

    pub fn update_task(&self, task_id: &TaskId, request: &TaskUpdateRequest) -> Result<TaskStatus> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ExecError::new(
                ErrorCode::ServerShuttingDown,
                format!("node {} is shutting down", self.node_id),
            ));
        }
        let task = {
            let mut tasks = self.tasks.lock().expect("task manager lock");
            match tasks.get(task_id) {
                Some(task) => Arc::clone(task),
                None => {
                    let query_context = self.query_contexts.get_or_create(&task_id.query_id);
                    let task = SqlTask::new(
                        task_id.clone(),
                        self.node_id.clone(),
                        &request.output_buffers,
                        query_context,
                        self.runtime.clone(),
                    );
                    tasks.insert(task_id.clone(), Arc::clone(&task));
                    task
                }
            }
        };
        task.update(request)
    }

    fn task(&self, task_id: &TaskId) -> Result<Arc<SqlTask>> {
        self.tasks
            .lock()
            .expect("task manager lock")
            .get(task_id)
            .cloned()
            .ok_or_else(|| {
                ExecError::new(
                    ErrorCode::TaskNotFound,
                    format!("task {} not found on node {}", task_id, self.node_id),
                )
            })
    }

    /// With `current`, waits until the task leaves that state or `max_wait` elapses.
    pub fn get_task_status(
        &self,
        task_id: &TaskId,
        current: Option<TaskState>,
        max_wait: Duration,
    ) -> Result<TaskStatus> {
        let task = self.task(task_id)?;
        Ok(match current {
            Some(current) => task.status_after(current, max_wait.min(self.status_max_wait)),
            None => {
                task.record_heartbeat();
                task.status()
            }
        })
    }

    pub fn get_task_info(&self, task_id: &TaskId) -> Result<TaskInfo> {
        let task = self.task(task_id)?;
        task.record_heartbeat();
        Ok(task.info())
    }

    /// Idempotent; an unknown task reports as already canceled or aborted.
    pub fn cancel_task(&self, task_id: &TaskId, abort: bool) -> TaskStatus {
        match self.task(task_id) {
            Ok(task) if abort => task.abort(),
            Ok(task) => task.cancel(),
            Err(_) => {
                let mut status = TaskStatus::initial(task_id.clone(), self.node_id.clone());
                status.state = if abort {
                    TaskState::Aborted
                } else {
                    TaskState::Canceled
                };
                status
            }
        }
    }

    pub fn fail_task(&self, task_id: &TaskId, err: ExecError) -> Result<TaskStatus> {
        Ok(self.task(task_id)?.fail(err))
    }

    pub fn get_results(
        &self,
        task_id: &TaskId,
        buffer_id: u32,
        token: u64,
        max_bytes: u64,
        max_wait: Duration,
    ) -> Result<BufferResult> {
        self.task(task_id)?
            .get_results(buffer_id, token, max_bytes, max_wait)
    }

    pub fn acknowledge_results(&self, task_id: &TaskId, buffer_id: u32, token: u64) -> Result<()> {
        self.task(task_id)?.acknowledge_results(buffer_id, token)
    }

    /// Idempotent; deleting the results of a forgotten task succeeds.
    pub fn destroy_results(&self, task_id: &TaskId, buffer_id: u32) -> Result<()> {
        match self.task(task_id) {
            Ok(task) => task.destroy_results(buffer_id),
            Err(_) => Ok(()),
        }
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<_> = self
            .tasks
            .lock()
            .expect("task manager lock")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn all_task_status(&self) -> Vec<TaskStatus> {
        self.snapshot().iter().map(|t| t.status()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<SqlTask>> {
        self.tasks
            .lock()
            .expect("task manager lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn fail_abandoned_tasks(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|t| t.fail_if_abandoned(self.client_timeout))
            .count()
    }

    pub fn remove_old_tasks(&self) -> usize {
        let cutoff = chrono::Utc::now().timestamp_millis() - self.info_max_age.as_millis() as i64;
        let mut tasks = self.tasks.lock().expect("task manager lock");
        let before = tasks.len();
        tasks.retain(|_, task| !matches!(task.ended_at_ms(), Some(end) if end <= cutoff));
        let removed = before - tasks.len();
        if removed > 0 {
            debug!("removed {} old tasks on node {}", removed, self.node_id);
        }
        removed
    }

    pub fn start_maintenance(self: &Arc<Self>, interval: Duration) {
        let mut slot = self.maintenance.lock().expect("task manager maintenance lock");
        if slot.is_some() {
            return;
        }
        let weak: Weak<TaskManager> = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name("task_maintenance".to_string())
            .spawn(move || run_maintenance(weak, interval));
        match spawned {
            Ok(handle) => *slot = Some(handle),
            Err(err) => error!("failed to spawn task maintenance thread: {}", err),
        }
    }

    /// Stop maintenance and fail every task that is still running.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _guard = self.maintenance_mu.lock().expect("task manager maintenance lock");
            self.maintenance_cv.notify_all();
        }
        let handle = self
            .maintenance
            .lock()
            .expect("task manager maintenance lock")
            .take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
        for task in self.snapshot() {
            if !task.state().is_done() {
                task.fail(ExecError::new(
                    ErrorCode::ServerShuttingDown,
                    format!("node {} is shutting down", self.node_id),
                ));
            }
        }
        info!("task manager on node {} shut down", self.node_id);
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_maintenance(manager: Weak<TaskManager>, interval: Duration) {
    loop {
        let Some(mgr) = manager.upgrade() else {
            return;
        };
        if mgr.shutdown.load(Ordering::Acquire) {
            return;
        }
        let abandoned = mgr.fail_abandoned_tasks();
        let removed = mgr.remove_old_tasks();
        if abandoned > 0 || removed > 0 {
            debug!(
                "task maintenance on {}: abandoned={} removed={}",
                mgr.node_id, abandoned, removed
            );
        }
        let guard = mgr.maintenance_mu.lock().expect("task manager maintenance lock");
        let _ = mgr
            .maintenance_cv
            .wait_timeout(guard, interval)
            .unwrap_or_else(|e| e.into_inner());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::{PlanNodeId, QueryId, StageId};
    use crate::connector::{ConnectorRegistry, sequence};
    use crate::exec::page::{ColumnType, Value};
    use crate::exec::pipeline::builder::LocalExecutionPlanner;
    use crate::exec::pipeline::driver_executor::DriverExecutor;
    use crate::exec::plan::{
        Aggregate, AggregateFunction, AggregationStep, OutputPartitioning, PartitioningHandle,
        PlanFragment, PlanNode,
    };
    use crate::runtime::exchange_client::ExchangeTransport;
    use crate::runtime::io::IoExecutor;
    use crate::runtime::mem_tracker::MemTracker;
    use crate::runtime::memory_pool::MemoryPool;
    use crate::runtime::output_buffer::OutputBuffers;
    use crate::runtime::runtime_state::ExecOptions;
    use crate::scheduler::split::{ScheduledSplit, SplitAssignment, TaskLocation};
    use std::time::Instant;

    struct NoTransport;

    impl ExchangeTransport for NoTransport {
        fn get_results(&self, _: &TaskLocation, _: u64, _: u64, _: Duration) -> Result<BufferResult> {
            Err(ExecError::internal("unused"))
        }

        fn acknowledge_results(&self, _: &TaskLocation, _: u64) -> Result<()> {
            Ok(())
        }

        fn abort_results(&self, _: &TaskLocation) -> Result<()> {
            Ok(())
        }
    }

    fn manager(config: &RuntimeConfig) -> Arc<TaskManager> {
        manager_with_pool(config, Arc::new(MemoryPool::new(1 << 30)))
    }

    fn manager_with_pool(config: &RuntimeConfig, pool: Arc<MemoryPool>) -> Arc<TaskManager> {
        let runtime = TaskRuntime {
            executor: Arc::new(DriverExecutor::new(
                2,
                Duration::from_millis(2),
                Duration::from_millis(50),
            )),
            planner: LocalExecutionPlanner::new(
                config,
                Arc::new(ConnectorRegistry::with_builtin()),
                Arc::new(NoTransport),
                Arc::new(IoExecutor::new(1)),
            )
            .with_task_concurrency(2),
            options: ExecOptions::from(config),
            output_buffer_max_bytes: 1 << 20,
        };
        let contexts = Arc::new(QueryContextManager::new(
            pool,
            1 << 28,
            MemTracker::new_root("node"),
        ));
        TaskManager::new(NodeId::new("node-0"), runtime, contexts, config)
    }

    fn task_id(query: &str) -> TaskId {
        TaskId::new(QueryId::new(query).unwrap(), StageId(0), 0)
    }

    fn values_fragment() -> PlanFragment {
        PlanFragment::new(
            StageId(0),
            PlanNode::Values {
                id: PlanNodeId(0),
                output_types: vec![ColumnType::Int64],
                rows: (0..5).map(|v| vec![Value::Int64(v)]).collect(),
            },
            PartitioningHandle::Single,
            OutputPartitioning::Single,
        )
        .unwrap()
    }

    fn scan_fragment() -> PlanFragment {
        PlanFragment::new(
            StageId(0),
            PlanNode::TableScan {
                id: PlanNodeId(0),
                catalog: sequence::CATALOG.to_string(),
                output_types: vec![ColumnType::Int64],
            },
            PartitioningHandle::Source,
            OutputPartitioning::Single,
        )
        .unwrap()
    }

    fn grouped_sum_fragment() -> PlanFragment {
        PlanFragment::new(
            StageId(0),
            PlanNode::Aggregation {
                id: PlanNodeId(1),
                source: Box::new(PlanNode::TableScan {
                    id: PlanNodeId(0),
                    catalog: sequence::CATALOG.to_string(),
                    output_types: vec![ColumnType::Int64],
                }),
                group_by: vec![0],
                aggregates: vec![Aggregate::new(AggregateFunction::Sum, 0)],
                step: AggregationStep::Single,
            },
            PartitioningHandle::Source,
            OutputPartitioning::Single,
        )
        .unwrap()
    }

    fn wait_for(manager: &TaskManager, id: &TaskId, state: TaskState) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = manager.get_task_status(id, None, Duration::ZERO).unwrap();
            if status.state == state {
                return;
            }
            assert!(Instant::now() < deadline, "task stuck in {}", status.state);
            manager
                .get_task_status(id, Some(status.state), Duration::from_millis(20))
                .unwrap();
        }
    }

    #[test]
    fn task_finishes_after_output_is_consumed() {
        let mgr = manager(&RuntimeConfig::default());
        let id = task_id("q1");
        let request =
            TaskUpdateRequest::new(Some(values_fragment()), Vec::new(), OutputBuffers::single());
        mgr.update_task(&id, &request).unwrap();
        wait_for(&mgr, &id, TaskState::Finishing);

        let mut token = 0;
        let mut rows = 0;
        loop {
            let result = mgr
                .get_results(&id, 0, token, 1 << 20, Duration::from_millis(50))
                .unwrap();
            rows += result.pages.iter().map(|p| p.position_count()).sum::<usize>();
            token = result.next_token;
            if result.buffer_complete {
                break;
            }
        }
        assert_eq!(rows, 5);
        mgr.destroy_results(&id, 0).unwrap();
        wait_for(&mgr, &id, TaskState::Finished);
    }

    #[test]
    fn redelivered_splits_are_applied_once() {
        let mgr = manager(&RuntimeConfig::default());
        let id = task_id("q2");
        let splits: Vec<_> = sequence::splits(30, 10)
            .into_iter()
            .enumerate()
            .map(|(i, split)| ScheduledSplit {
                sequence_id: i as u64,
                plan_node_id: PlanNodeId(0),
                split,
            })
            .collect();
        let first = TaskUpdateRequest::new(
            Some(scan_fragment()),
            vec![SplitAssignment::new(PlanNodeId(0), splits[..2].to_vec(), false)],
            OutputBuffers::single(),
        );
        mgr.update_task(&id, &first).unwrap();
        let second = TaskUpdateRequest::new(
            None,
            vec![SplitAssignment::new(PlanNodeId(0), splits.clone(), true)],
            OutputBuffers::single(),
        );
        mgr.update_task(&id, &second).unwrap();
        wait_for(&mgr, &id, TaskState::Finishing);

        let mut token = 0;
        let mut rows = 0;
        loop {
            let result = mgr
                .get_results(&id, 0, token, 1 << 20, Duration::from_millis(50))
                .unwrap();
            rows += result.pages.iter().map(|p| p.position_count()).sum::<usize>();
            token = result.next_token;
            if result.buffer_complete {
                break;
            }
        }
        assert_eq!(rows, 30);
        let status = mgr.get_task_status(&id, None, Duration::ZERO).unwrap();
        assert_eq!(status.completed_splits, 3);
    }

    #[test]
    fn cancel_stops_a_task_waiting_for_splits() {
        let mgr = manager(&RuntimeConfig::default());
        let id = task_id("q3");
        let request =
            TaskUpdateRequest::new(Some(scan_fragment()), Vec::new(), OutputBuffers::single());
        let status = mgr.update_task(&id, &request).unwrap();
        assert_eq!(status.state, TaskState::Running);
        assert_eq!(mgr.cancel_task(&id, false).state, TaskState::Canceled);
        assert_eq!(mgr.cancel_task(&id, true).state, TaskState::Canceled);
        let info = mgr.get_task_info(&id).unwrap();
        assert!(info.stats.end_time_ms.is_some());
        assert_eq!(
            mgr.cancel_task(&task_id("unknown"), true).state,
            TaskState::Aborted
        );
    }

    #[test]
    fn cancel_releases_memory_output_and_drivers() {
        let pool = Arc::new(MemoryPool::new(1 << 30));
        let mgr = manager_with_pool(&RuntimeConfig::default(), Arc::clone(&pool));
        let id = task_id("q5");
        let splits: Vec<_> = sequence::splits(1000, 100)
            .into_iter()
            .enumerate()
            .map(|(i, split)| ScheduledSplit {
                sequence_id: i as u64,
                plan_node_id: PlanNodeId(0),
                split,
            })
            .collect();
        // no final split marker, so the aggregation keeps its table waiting for more input
        let request = TaskUpdateRequest::new(
            Some(grouped_sum_fragment()),
            vec![SplitAssignment::new(PlanNodeId(0), splits, false)],
            OutputBuffers::single(),
        );
        mgr.update_task(&id, &request).unwrap();
        let query = id.query_id.clone();
        let deadline = Instant::now() + Duration::from_secs(10);
        while !pool.has_query(&query) {
            assert!(Instant::now() < deadline, "aggregation never reserved memory");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            mgr.get_task_status(&id, None, Duration::ZERO).unwrap().state,
            TaskState::Running
        );

        assert_eq!(mgr.cancel_task(&id, false).state, TaskState::Canceled);
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let info = mgr.get_task_info(&id).unwrap();
            if info.stats.running_drivers == 0 && !pool.has_query(&query) {
                assert!(info.stats.total_drivers > 0);
                assert_eq!(info.stats.completed_drivers, info.stats.drivers.len());
                assert!(info.stats.drivers.iter().all(|d| d.done));
                let buffers = info.output_buffers.unwrap();
                assert_eq!(buffers.buffered_bytes, 0);
                assert_eq!(buffers.buffered_pages, 0);
                break;
            }
            assert!(Instant::now() < deadline, "canceled task still holds resources");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.query_memory_reservation(&query), 0);
        assert_eq!(
            mgr.get_task_status(&id, None, Duration::ZERO).unwrap().memory_reservation_bytes,
            0
        );
    }

    #[test]
    fn drained_task_finishes_from_finishing() {
        let mgr = manager(&RuntimeConfig::default());
        let id = task_id("q6");
        let request =
            TaskUpdateRequest::new(Some(values_fragment()), Vec::new(), OutputBuffers::single());
        mgr.update_task(&id, &request).unwrap();
        wait_for(&mgr, &id, TaskState::Finishing);
        let task = mgr.task(&id).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        task.state_machine()
            .add_state_change_listener(move |state| recorded.lock().unwrap().push(*state));

        let mut token = 0;
        loop {
            let result = mgr
                .get_results(&id, 0, token, 1 << 20, Duration::from_millis(50))
                .unwrap();
            token = result.next_token;
            if result.buffer_complete {
                break;
            }
        }
        mgr.destroy_results(&id, 0).unwrap();
        wait_for(&mgr, &id, TaskState::Finished);
        assert_eq!(*seen.lock().unwrap(), vec![TaskState::Finished]);
    }

    #[test]
    fn abandoned_tasks_fail_and_old_tasks_are_removed() {
        let config = RuntimeConfig {
            task_client_timeout_ms: 0,
            task_info_max_age_ms: 0,
            ..RuntimeConfig::default()
        };
        let mgr = manager(&config);
        let id = task_id("q4");
        let request =
            TaskUpdateRequest::new(Some(scan_fragment()), Vec::new(), OutputBuffers::single());
        mgr.update_task(&id, &request).unwrap();
        assert_eq!(mgr.fail_abandoned_tasks(), 1);
        let status = mgr.get_task_status(&id, None, Duration::ZERO).unwrap();
        assert_eq!(status.state, TaskState::Failed);
        assert_eq!(status.failures[0].error_code, ErrorCode::AbandonedTask);
        assert_eq!(mgr.remove_old_tasks(), 1);
        assert!(mgr.task_ids().is_empty());
    }
}
