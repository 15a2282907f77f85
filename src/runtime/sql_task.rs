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
//! One task of a query running on this node.
//!
//! Responsibilities:
//! - Plans its fragment into pipelines on the first update and submits the drivers.
//! - Applies split assignments at most once per sequence id and routes them to per-node queues.
//! - Drives completion: drivers done, output buffer drained, task finished; on cancel, abort
//!   or failure it stops split intake, aborts drivers and discards buffered output.
//!
//! Key exported interfaces:
//! - Types: `SqlTask`, `TaskRuntime`.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::common::ids::{NodeId, PlanNodeId, TaskId, UniqueId};
use crate::common::status::{ErrorCode, ExecError, ExecutionFailureInfo, Result};
use crate::exec::pipeline::builder::LocalExecutionPlanner;
use crate::exec::pipeline::driver_executor::{DriverExecutor, DriverTask, TaskExecution};
use crate::exec::pipeline::scan::split_queue::SplitQueueRef;
use crate::exec::plan::PlanFragment;
use crate::novaexec_logging::{debug, info, warn};
use crate::runtime::exchange_client::ExchangeClient;
use crate::runtime::output_buffer::{BufferResult, OutputBuffer, OutputBufferState, OutputBuffers};
use crate::runtime::query_context::QueryContext;
use crate::runtime::runtime_state::{ExecOptions, RuntimeState};
use crate::runtime::task_info::{TaskInfo, TaskStats, TaskStatus, TaskUpdateRequest};
use crate::runtime::task_state::{TaskState, TaskStateMachine};
use crate::scheduler::split::{ScheduledSplit, SplitAssignment};

/// Node services a task needs to run.
#[derive(Clone)]
pub struct TaskRuntime {
    pub executor: Arc<DriverExecutor>,
    pub planner: LocalExecutionPlanner,
    pub options: ExecOptions,
    pub output_buffer_max_bytes: i64,
}

#[derive(Default)]
struct SplitIntake {
    planned: bool,
    queues: HashMap<PlanNodeId, SplitQueueRef>,
    /// Splits that arrived before the fragment was planned.
    pending: HashMap<PlanNodeId, Vec<ScheduledSplit>>,
    /// Highest applied sequence id per plan node.
    max_sequence: HashMap<PlanNodeId, u64>,
    no_more_splits: BTreeSet<PlanNodeId>,
    exchange_clients: Vec<Arc<ExchangeClient>>,
    total_drivers: usize,
}

pub struct SqlTask {
    task_id: TaskId,
    task_instance_id: String,
    node_id: NodeId,
    state_machine: Arc<TaskStateMachine>,
    output_buffer: Arc<OutputBuffer>,
    query_context: Arc<QueryContext>,
    runtime: TaskRuntime,
    runtime_state: Arc<RuntimeState>,
    intake: Mutex<SplitIntake>,
    execution: Mutex<Option<Arc<TaskExecution>>>,
    created_at_ms: i64,
    ended_at_ms: AtomicI64,
    last_heartbeat: Mutex<Instant>,
    last_heartbeat_ms: AtomicI64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl SqlTask {
    pub fn new(
        task_id: TaskId,
        node_id: NodeId,
        output_buffers: &OutputBuffers,
        query_context: Arc<QueryContext>,
        runtime: TaskRuntime,
    ) -> Arc<Self> {
        let task_instance_id = UniqueId::random().to_uuid_string();
        let state_machine = Arc::new(TaskStateMachine::new(task_id.clone()));
        let runtime_state = Arc::new(RuntimeState::new(
            runtime.options,
            Arc::clone(&state_machine),
            Some(Arc::clone(&query_context)),
        ));
        let output_buffer = OutputBuffer::new(
            task_id.clone(),
            task_instance_id.clone(),
            output_buffers.clone(),
            runtime.output_buffer_max_bytes,
            Some(runtime_state.mem_tracker()),
        );
        let now = now_ms();
        let task = Arc::new(Self {
            task_id,
            task_instance_id,
            node_id,
            state_machine,
            output_buffer,
            query_context,
            runtime,
            runtime_state,
            intake: Mutex::new(SplitIntake::default()),
            execution: Mutex::new(None),
            created_at_ms: now,
            ended_at_ms: AtomicI64::new(0),
            last_heartbeat: Mutex::new(Instant::now()),
            last_heartbeat_ms: AtomicI64::new(now),
        });
        task.register_listeners();
        debug!("task created: task={} instance={}", task.task_id, task.task_instance_id);
        task
    }

    fn register_listeners(self: &Arc<Self>) {
        let weak: Weak<SqlTask> = Arc::downgrade(self);
        self.output_buffer.add_state_change_listener(move |state| {
            if *state == OutputBufferState::Finished
                && let Some(task) = weak.upgrade()
            {
                task.state_machine.finished();
            }
        });
        let weak: Weak<SqlTask> = Arc::downgrade(self);
        self.state_machine.add_state_change_listener(move |state| {
            if state.is_done()
                && let Some(task) = weak.upgrade()
            {
                task.on_done(*state);
            }
        });
    }

    fn on_done(&self, state: TaskState) {
        self.ended_at_ms.store(now_ms(), Ordering::Release);
        match state {
            TaskState::Finished => {}
            TaskState::Failed => self.output_buffer.fail(),
            _ => self.output_buffer.abort(),
        }
        if let Some(execution) = self.execution.lock().expect("sql task execution lock").as_ref() {
            execution.abort();
        }
        let (queues, clients) = {
            let intake = self.intake.lock().expect("sql task intake lock");
            (
                intake.queues.values().cloned().collect::<Vec<_>>(),
                intake.exchange_clients.clone(),
            )
        };
        for queue in queues {
            queue.close();
        }
        for client in clients {
            client.close();
        }
        info!(
            "task {} done: state={} query_reserved_bytes={}",
            self.task_id,
            state,
            self.query_context.reserved_bytes()
        );
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn task_instance_id(&self) -> &str {
        &self.task_instance_id
    }

    pub fn state(&self) -> TaskState {
        self.state_machine.state()
    }

    pub fn state_machine(&self) -> &Arc<TaskStateMachine> {
        &self.state_machine
    }

    pub fn output_buffer(&self) -> &Arc<OutputBuffer> {
        &self.output_buffer
    }

    pub fn record_heartbeat(&self) {
        *self.last_heartbeat.lock().expect("sql task heartbeat lock") = Instant::now();
        self.last_heartbeat_ms.store(now_ms(), Ordering::Release);
    }

    pub fn time_since_heartbeat(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .expect("sql task heartbeat lock")
            .elapsed()
    }

    /// Milliseconds since the epoch when the task reached a terminal state.
    pub fn ended_at_ms(&self) -> Option<i64> {
        match self.ended_at_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn update(&self, request: &TaskUpdateRequest) -> Result<TaskStatus> {
        self.record_heartbeat();
        if self.state().is_done() {
            return Ok(self.status());
        }
        self.output_buffer.set_output_buffers(&request.output_buffers)?;
        if let Some(fragment) = request.fragment.as_ref()
            && let Err(err) = self.plan(fragment)
        {
            self.state_machine.failed(err.clone());
            return Err(err);
        }
        self.add_sources(&request.sources)?;
        Ok(self.status())
    }

    fn plan(&self, fragment: &PlanFragment) -> Result<()> {
        let (pipelines, total_drivers) = {
            let mut intake = self.intake.lock().expect("sql task intake lock");
            if intake.planned {
                return Ok(());
            }
            let plan = self
                .runtime
                .planner
                .plan(fragment, Arc::clone(&self.output_buffer))?;
            intake.planned = true;
            intake.total_drivers = plan.driver_count();
            intake.queues = plan.split_queues;
            intake.exchange_clients = plan.exchange_clients;
            let pending = std::mem::take(&mut intake.pending);
            for (node, splits) in pending {
                if let Some(queue) = intake.queues.get(&node) {
                    queue.add_splits(splits);
                } else {
                    return Err(unknown_source(&self.task_id, node));
                }
            }
            for node in &intake.no_more_splits {
                match intake.queues.get(node) {
                    Some(queue) => queue.no_more_splits(),
                    None => return Err(unknown_source(&self.task_id, *node)),
                }
            }
            (plan.pipelines, intake.total_drivers)
        };

        let mut drivers = Vec::with_capacity(total_drivers);
        for pipeline in &pipelines {
            drivers.extend(pipeline.instantiate_drivers(&self.runtime_state)?);
        }
        let state_machine = Arc::clone(&self.state_machine);
        let output_buffer = Arc::clone(&self.output_buffer);
        let task_id = self.task_id.clone();
        let execution = TaskExecution::new(
            self.task_id.clone(),
            drivers.len(),
            Arc::clone(&self.state_machine),
            move |error| {
                if error.is_some() {
                    return;
                }
                debug!("task {} drivers finished, flushing output", task_id);
                // FINISHING must be visible before the buffer can report itself drained
                state_machine.transition_to_finishing();
                output_buffer.set_no_more_pages();
            },
        );
        *self.execution.lock().expect("sql task execution lock") = Some(Arc::clone(&execution));
        self.state_machine.transition_to_running();
        let time_slice = self.runtime.executor.time_slice();
        self.runtime.executor.submit(
            drivers
                .into_iter()
                .map(|driver| DriverTask::new(driver, Arc::clone(&execution), time_slice))
                .collect(),
        );
        debug!(
            "task {} started: pipelines={} drivers={}",
            self.task_id,
            pipelines.len(),
            total_drivers
        );
        Ok(())
    }

    fn add_sources(&self, sources: &[SplitAssignment]) -> Result<()> {
        let mut intake = self.intake.lock().expect("sql task intake lock");
        for assignment in sources {
            let node = assignment.plan_node_id;
            let max_seen = intake.max_sequence.get(&node).copied();
            let fresh: Vec<ScheduledSplit> = assignment
                .splits
                .iter()
                .filter(|s| max_seen.is_none_or(|max| s.sequence_id > max))
                .cloned()
                .collect();
            if let Some(max) = fresh.iter().map(|s| s.sequence_id).max() {
                intake.max_sequence.insert(node, max);
            }
            if intake.planned {
                let Some(queue) = intake.queues.get(&node).cloned() else {
                    return Err(unknown_source(&self.task_id, node));
                };
                queue.add_splits(fresh);
                if assignment.no_more_splits {
                    queue.no_more_splits();
                }
            } else if !fresh.is_empty() {
                intake.pending.entry(node).or_default().extend(fresh);
            }
            if assignment.no_more_splits {
                intake.no_more_splits.insert(node);
            }
        }
        Ok(())
    }

    pub fn cancel(&self) -> TaskStatus {
        self.record_heartbeat();
        self.state_machine.cancel();
        self.status()
    }

    pub fn abort(&self) -> TaskStatus {
        self.record_heartbeat();
        self.state_machine.abort();
        self.status()
    }

    pub fn fail(&self, err: ExecError) -> TaskStatus {
        self.state_machine.failed(err);
        self.status()
    }

    /// Long-poll: waits up to `max_wait` while the task is still in `current`.
    pub fn status_after(&self, current: TaskState, max_wait: Duration) -> TaskStatus {
        self.record_heartbeat();
        if self.state() == current && !current.is_done() {
            self.state_machine.wait_for_state_change(current, max_wait);
        }
        self.status()
    }

    pub fn status(&self) -> TaskStatus {
        let (queued, running, completed) = {
            let intake = self.intake.lock().expect("sql task intake lock");
            let pending: usize = intake.pending.values().map(Vec::len).sum();
            intake.queues.values().fold((pending, 0, 0), |acc, q| {
                (acc.0 + q.queued(), acc.1 + q.running(), acc.2 + q.completed())
            })
        };
        let tracker = self.runtime_state.mem_tracker();
        TaskStatus {
            task_id: self.task_id.clone(),
            task_instance_id: self.task_instance_id.clone(),
            version: self.state_machine.version(),
            state: self.state_machine.state(),
            node_id: self.node_id.clone(),
            failures: self
                .state_machine
                .failure()
                .iter()
                .map(ExecutionFailureInfo::from)
                .collect(),
            queued_splits: queued,
            running_splits: running,
            completed_splits: completed,
            memory_reservation_bytes: tracker.current(),
            peak_memory_bytes: tracker.peak(),
            output_buffer_overutilized: self.output_buffer.is_overutilized(),
            last_heartbeat_ms: self.last_heartbeat_ms.load(Ordering::Acquire),
        }
    }

    pub fn info(&self) -> TaskInfo {
        let status = self.status();
        let (no_more_splits, planned, total_drivers) = {
            let intake = self.intake.lock().expect("sql task intake lock");
            (intake.no_more_splits.clone(), intake.planned, intake.total_drivers)
        };
        let drivers = self.runtime_state.driver_stats().snapshots();
        let running_drivers = drivers.iter().filter(|d| !d.done).count();
        let input_rows = drivers
            .iter()
            .filter_map(|d| d.operators.first())
            .map(|o| o.output_rows)
            .sum();
        let output_rows = drivers
            .iter()
            .filter_map(|d| d.operators.last())
            .map(|o| o.input_rows)
            .sum();
        TaskInfo {
            status,
            stats: TaskStats {
                create_time_ms: self.created_at_ms,
                end_time_ms: self.ended_at_ms(),
                total_drivers,
                running_drivers,
                completed_drivers: drivers.len() - running_drivers,
                input_rows,
                output_rows,
                drivers,
            },
            output_buffers: Some(self.output_buffer.info()),
            no_more_splits,
            needs_plan: !planned,
        }
    }

    pub fn get_results(
        &self,
        buffer_id: u32,
        token: u64,
        max_bytes: u64,
        max_wait: Duration,
    ) -> Result<BufferResult> {
        self.output_buffer.get(buffer_id, token, max_bytes, max_wait)
    }

    pub fn acknowledge_results(&self, buffer_id: u32, token: u64) -> Result<()> {
        self.output_buffer.acknowledge(buffer_id, token)
    }

    pub fn destroy_results(&self, buffer_id: u32) -> Result<()> {
        self.output_buffer.destroy(buffer_id)
    }

    /// Fail the task when the coordinator stopped polling it.
    pub fn fail_if_abandoned(&self, timeout: Duration) -> bool {
        if self.state().is_done() {
            return false;
        }
        let idle = self.time_since_heartbeat();
        if idle < timeout {
            return false;
        }
        warn!(
            "failing abandoned task {}: no coordinator request for {:?}",
            self.task_id, idle
        );
        self.state_machine.failed(ExecError::new(
            ErrorCode::AbandonedTask,
            format!("task {} has not been accessed for {:?}", self.task_id, idle),
        ));
        true
    }
}

fn unknown_source(task_id: &TaskId, node: PlanNodeId) -> ExecError {
    ExecError::invalid_plan(format!("task {} has no split source {}", task_id, node))
}
