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
//! Coordinator-side handle of a task running on a worker node.
//!
//! Responsibilities:
//! - Assigns per-task split sequence ids and delivers pending split assignments through a
//!   `TaskTransport` until the worker acknowledges them; redelivery is safe because workers
//!   apply each sequence id once.
//! - Long-polls task status with the last known state on a background thread and fans status
//!   changes out to listeners.
//! - Presumes the worker dead once status polls keep failing for longer than the max error
//!   duration, and reports the task failed with `RemoteTaskError`.
//!
//! Key exported interfaces:
//! - Traits: `TaskTransport`, `RemoteTask`, `RemoteTaskFactory`.
//! - Types: `RemoteTaskClient`, `RemoteTaskClientFactory`, `RemoteTaskConfig`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::common::app_config::RuntimeConfig;
use crate::common::future::SettableFuture;
use crate::common::ids::{PlanNodeId, TaskId};
use crate::common::status::{ErrorCode, ExecError, ExecutionFailureInfo, Result};
use crate::exec::plan::PlanFragment;
use crate::novaexec_logging::{debug, info, warn};
use crate::runtime::exchange_client::backoff::Backoff;
use crate::runtime::output_buffer::OutputBuffers;
use crate::runtime::task_info::{TaskInfo, TaskStatus, TaskUpdateRequest};
use crate::runtime::task_state::TaskState;
use crate::scheduler::node_manager::InternalNode;
use crate::scheduler::split::{ScheduledSplit, Split, SplitAssignment, TaskLocation};

/// Task control protocol between the coordinator and a worker node.
pub trait TaskTransport: Send + Sync {
    fn update_task(
        &self,
        node: &InternalNode,
        task_id: &TaskId,
        request: &TaskUpdateRequest,
    ) -> Result<TaskStatus>;

    /// Blocks up to `max_wait` while the task is still in `current_state`.
    fn get_task_status(
        &self,
        node: &InternalNode,
        task_id: &TaskId,
        current_state: Option<TaskState>,
        max_wait: Duration,
    ) -> Result<TaskStatus>;

    fn get_task_info(&self, node: &InternalNode, task_id: &TaskId) -> Result<TaskInfo>;

    fn cancel_task(&self, node: &InternalNode, task_id: &TaskId, abort: bool) -> Result<TaskStatus>;
}

pub type TaskStatusListener = Arc<dyn Fn(&TaskStatus) + Send + Sync>;

pub trait RemoteTask: Send + Sync {
    fn task_id(&self) -> &TaskId;

    fn node(&self) -> &InternalNode;

    /// Create the task on its node. Errors here mean the task never started.
    fn start(&self) -> Result<()>;

    fn add_splits(&self, plan_node_id: PlanNodeId, splits: Vec<Split>) -> Result<()>;

    fn no_more_splits(&self, plan_node_id: PlanNodeId) -> Result<()>;

    fn task_status(&self) -> TaskStatus;

    fn add_state_change_listener(&self, listener: TaskStatusListener);

    /// Done once fewer than `max_queued` splits are assigned but not completed.
    fn when_split_queue_has_space(&self, max_queued: usize) -> SettableFuture<()>;

    /// Splits assigned to the task that have not completed yet.
    fn queued_split_count(&self) -> usize;

    fn cancel(&self);

    fn abort(&self);

    /// Full task document fetched from the worker.
    fn fetch_task_info(&self) -> Result<TaskInfo> {
        Err(ExecError::not_supported(format!(
            "task {} does not report task info",
            self.task_id()
        )))
    }

    fn task_location(&self, buffer_id: u32) -> TaskLocation {
        TaskLocation {
            node_id: self.node().node_id.clone(),
            uri: self.node().uri.clone(),
            task_id: self.task_id().clone(),
            buffer_id,
        }
    }
}

pub trait RemoteTaskFactory: Send + Sync {
    fn create_remote_task(
        &self,
        node: &InternalNode,
        task_id: TaskId,
        fragment: &PlanFragment,
        output_buffers: OutputBuffers,
    ) -> Arc<dyn RemoteTask>;
}

#[derive(Clone, Copy, Debug)]
pub struct RemoteTaskConfig {
    pub status_max_wait: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub max_error_duration: Duration,
}

impl Default for RemoteTaskConfig {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for RemoteTaskConfig {
    fn from(cfg: &RuntimeConfig) -> Self {
        Self {
            status_max_wait: cfg.task_status_max_wait(),
            min_backoff: Duration::from_millis(cfg.exchange_min_backoff_ms),
            max_backoff: Duration::from_millis(cfg.exchange_max_backoff_ms),
            max_error_duration: cfg.exchange_max_error_duration(),
        }
    }
}

struct SpaceWaiter {
    max_queued: usize,
    future: SettableFuture<()>,
}

struct ClientState {
    next_sequence_id: u64,
    /// Splits not yet acknowledged by the worker, by plan node.
    pending: BTreeMap<PlanNodeId, Vec<ScheduledSplit>>,
    no_more_splits: BTreeSet<PlanNodeId>,
    /// `no_more_splits` markers the worker has acknowledged.
    no_more_splits_sent: BTreeSet<PlanNodeId>,
    needs_update: bool,
    fragment_sent: bool,
    status: TaskStatus,
    update_backoff: Backoff,
    status_backoff: Backoff,
    space_waiters: Vec<SpaceWaiter>,
}

pub struct RemoteTaskClient {
    task_id: TaskId,
    node: InternalNode,
    fragment: PlanFragment,
    output_buffers: OutputBuffers,
    transport: Arc<dyn TaskTransport>,
    config: RemoteTaskConfig,
    state: Mutex<ClientState>,
    listeners: Mutex<Vec<TaskStatusListener>>,
    /// Serializes updates so sequence ids reach the worker in order.
    send_lock: Mutex<()>,
    started: AtomicBool,
    poller_started: AtomicBool,
    self_ref: Weak<RemoteTaskClient>,
}

impl RemoteTaskClient {
    pub fn new(
        node: InternalNode,
        task_id: TaskId,
        fragment: PlanFragment,
        output_buffers: OutputBuffers,
        transport: Arc<dyn TaskTransport>,
        config: RemoteTaskConfig,
    ) -> Arc<Self> {
        let initial = TaskStatus::initial(task_id.clone(), node.node_id.clone());
        let backoff = || Backoff::new(config.min_backoff, config.max_backoff, config.max_error_duration);
        Arc::new_cyclic(|self_ref| Self {
            task_id,
            node,
            fragment,
            output_buffers,
            transport,
            config,
            state: Mutex::new(ClientState {
                next_sequence_id: 0,
                pending: BTreeMap::new(),
                no_more_splits: BTreeSet::new(),
                no_more_splits_sent: BTreeSet::new(),
                needs_update: true,
                fragment_sent: false,
                status: initial,
                update_backoff: backoff(),
                status_backoff: backoff(),
                space_waiters: Vec::new(),
            }),
            listeners: Mutex::new(Vec::new()),
            send_lock: Mutex::new(()),
            started: AtomicBool::new(false),
            poller_started: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Deliver pending work. Transport errors are returned to the caller and the work stays
    /// pending for the next attempt.
    fn send_update(&self) -> Result<()> {
        let _send = self.send_lock.lock().expect("remote task send lock");
        let (request, sent_max, sent_no_more) = {
            let state = self.state.lock().expect("remote task lock");
            if state.status.is_done() || !state.needs_update {
                return Ok(());
            }
            let fragment = (!state.fragment_sent).then(|| self.fragment.clone());
            let mut sources = Vec::new();
            let mut sent_max = BTreeMap::new();
            let plan_nodes: BTreeSet<PlanNodeId> = state
                .pending
                .keys()
                .chain(state.no_more_splits.iter())
                .copied()
                .collect();
            for plan_node_id in plan_nodes {
                let splits = state.pending.get(&plan_node_id).cloned().unwrap_or_default();
                if let Some(last) = splits.last() {
                    sent_max.insert(plan_node_id, last.sequence_id);
                }
                let no_more = state.no_more_splits.contains(&plan_node_id);
                if splits.is_empty() && (!no_more || state.no_more_splits_sent.contains(&plan_node_id)) {
                    continue;
                }
                sources.push(SplitAssignment::new(plan_node_id, splits, no_more));
            }
            let request = TaskUpdateRequest::new(fragment, sources, self.output_buffers.clone());
            (request, sent_max, state.no_more_splits.clone())
        };

        let result = self.transport.update_task(&self.node, &self.task_id, &request);
        let mut state = self.state.lock().expect("remote task lock");
        match result {
            Ok(status) => {
                state.update_backoff.success();
                state.fragment_sent = true;
                for (plan_node_id, max_seq) in sent_max {
                    if let Some(queue) = state.pending.get_mut(&plan_node_id) {
                        queue.retain(|s| s.sequence_id > max_seq);
                        if queue.is_empty() {
                            state.pending.remove(&plan_node_id);
                        }
                    }
                }
                state.no_more_splits_sent.extend(sent_no_more);
                state.needs_update = !state.pending.is_empty()
                    || state.no_more_splits.len() != state.no_more_splits_sent.len();
                drop(state);
                self.update_status(status);
                Ok(())
            }
            Err(err) => {
                let give_up = state.update_backoff.failure();
                drop(state);
                warn!(
                    "update of task {} on node {} failed: {}",
                    self.task_id, self.node.node_id, err
                );
                if give_up && self.started.load(Ordering::Acquire) {
                    self.fail_locally(ExecError::new(
                        ErrorCode::RemoteTaskError,
                        format!(
                            "could not communicate with task {} on node {}: {}",
                            self.task_id, self.node.node_id, err
                        ),
                    ));
                }
                Err(err)
            }
        }
    }

    /// Create the task on its node. Transient transport failures are retried under the update
    /// backoff; a gone host, a non-retryable error or an exhausted backoff is returned so the
    /// scheduler can place the work elsewhere.
    fn send_initial_update(&self) -> Result<()> {
        loop {
            let err = match self.send_update() {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let delay = {
                let state = self.state.lock().expect("remote task lock");
                if !err.is_retryable()
                    || err.code() == ErrorCode::RemoteHostGone
                    || state.update_backoff.is_exhausted()
                {
                    return Err(err);
                }
                state.update_backoff.delay()
            };
            debug!(
                "retrying creation of task {} on node {} in {:?}",
                self.task_id, self.node.node_id, delay
            );
            thread::sleep(delay);
        }
    }

    /// Flush pending updates, logging transport errors; the poller retries later.
    fn try_send_update(&self) {
        if let Err(err) = self.send_update() {
            debug!("task {} update deferred: {}", self.task_id, err);
        }
    }

    /// Apply a status document, ignoring stale versions. Terminal states are sticky.
    fn update_status(&self, status: TaskStatus) {
        let (changed, space) = {
            let mut state = self.state.lock().expect("remote task lock");
            let current = &state.status;
            if current.is_done() {
                return;
            }
            if !current.task_instance_id.is_empty()
                && !status.task_instance_id.is_empty()
                && current.task_instance_id != status.task_instance_id
            {
                let previous = current.task_instance_id.clone();
                drop(state);
                self.fail_locally(ExecError::new(
                    ErrorCode::RemoteTaskError,
                    format!(
                        "task {} on node {} was restarted: instance {} replaced by {}",
                        self.task_id, self.node.node_id, previous, status.task_instance_id
                    ),
                ));
                return;
            }
            if status.version < current.version && !status.is_done() {
                return;
            }
            let changed = current.state != status.state || current.version != status.version;
            state.status = status;
            let queued = queued_count(&state);
            let done = state.status.is_done();
            let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.space_waiters)
                .into_iter()
                .partition(|w| done || queued < w.max_queued);
            state.space_waiters = waiting;
            (changed.then(|| state.status.clone()), ready)
        };
        for waiter in space {
            waiter.future.set(());
        }
        if let Some(status) = changed {
            self.notify(&status);
        }
    }

    fn fail_locally(&self, err: ExecError) {
        let status = {
            let mut state = self.state.lock().expect("remote task lock");
            if state.status.is_done() {
                return;
            }
            warn!("task {} presumed failed: {}", self.task_id, err);
            state.status.state = TaskState::Failed;
            state.status.version += 1;
            state.status.failures.push(ExecutionFailureInfo::from(&err.with_location(
                self.node.node_id.to_string(),
            )));
            for waiter in state.space_waiters.drain(..) {
                waiter.future.set(());
            }
            state.status.clone()
        };
        self.notify(&status);
    }

    fn notify(&self, status: &TaskStatus) {
        let listeners = self.listeners.lock().expect("remote task listeners lock").clone();
        for listener in listeners {
            listener(status);
        }
    }

    fn start_status_poller(&self) {
        if self.poller_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = self.self_ref.clone();
        let name = format!("task_status_{}", self.task_id);
        let spawned = thread::Builder::new().name(name).spawn(move || poll_status(weak));
        if let Err(err) = spawned {
            self.fail_locally(ExecError::internal(format!(
                "spawn status poller for task {}: {}",
                self.task_id, err
            )));
        }
    }

    fn poll_once(&self) {
        let (current, delay, needs_update) = {
            let state = self.state.lock().expect("remote task lock");
            (
                state.status.state,
                state.status_backoff.delay(),
                state.needs_update,
            )
        };
        if needs_update {
            self.try_send_update();
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        match self.transport.get_task_status(
            &self.node,
            &self.task_id,
            Some(current),
            self.config.status_max_wait,
        ) {
            Ok(status) => {
                self.state
                    .lock()
                    .expect("remote task lock")
                    .status_backoff
                    .success();
                self.update_status(status);
            }
            Err(err) => {
                let give_up = self
                    .state
                    .lock()
                    .expect("remote task lock")
                    .status_backoff
                    .failure();
                debug!("status poll of task {} failed: {}", self.task_id, err);
                if give_up {
                    self.fail_locally(ExecError::new(
                        ErrorCode::RemoteTaskError,
                        format!(
                            "node {} stopped responding to status requests for task {}: {}",
                            self.node.node_id, self.task_id, err
                        ),
                    ));
                }
            }
        }
    }

    fn send_cancel(&self, abort: bool) {
        let target = if abort { TaskState::Aborted } else { TaskState::Canceled };
        match self.transport.cancel_task(&self.node, &self.task_id, abort) {
            Ok(status) => self.update_status(status),
            Err(err) => {
                warn!(
                    "{} of task {} on node {} failed: {}",
                    target.name(),
                    self.task_id,
                    self.node.node_id,
                    err
                );
            }
        }
        // the coordinator reports the requested state even if the worker is unreachable
        let status = {
            let mut state = self.state.lock().expect("remote task lock");
            if state.status.is_done() {
                None
            } else {
                state.status.state = target;
                state.status.version += 1;
                for waiter in state.space_waiters.drain(..) {
                    waiter.future.set(());
                }
                Some(state.status.clone())
            }
        };
        if let Some(status) = status {
            self.notify(&status);
        }
    }
}

fn queued_count(state: &ClientState) -> usize {
    let pending: usize = state.pending.values().map(Vec::len).sum();
    pending + state.status.queued_splits + state.status.running_splits
}

fn poll_status(weak: Weak<RemoteTaskClient>) {
    loop {
        let Some(task) = weak.upgrade() else {
            break;
        };
        if task.state.lock().expect("remote task lock").status.is_done() {
            debug!("status poller of task {} stopped", task.task_id);
            break;
        }
        task.poll_once();
    }
}

impl RemoteTask for RemoteTaskClient {
    fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    fn node(&self) -> &InternalNode {
        &self.node
    }

    fn start(&self) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        self.send_initial_update()?;
        self.started.store(true, Ordering::Release);
        info!("task {} started on node {}", self.task_id, self.node.node_id);
        self.start_status_poller();
        Ok(())
    }

    fn add_splits(&self, plan_node_id: PlanNodeId, splits: Vec<Split>) -> Result<()> {
        if splits.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.state.lock().expect("remote task lock");
            if state.no_more_splits.contains(&plan_node_id) {
                return Err(ExecError::invariant(format!(
                    "splits added to plan node {} of task {} after no more splits",
                    plan_node_id, self.task_id
                )));
            }
            if state.status.is_done() {
                return Ok(());
            }
            let mut scheduled = Vec::with_capacity(splits.len());
            for split in splits {
                state.next_sequence_id += 1;
                scheduled.push(ScheduledSplit {
                    sequence_id: state.next_sequence_id,
                    plan_node_id,
                    split,
                });
            }
            state.pending.entry(plan_node_id).or_default().extend(scheduled);
            state.needs_update = true;
        }
        if self.started.load(Ordering::Acquire) {
            self.try_send_update();
        }
        Ok(())
    }

    fn no_more_splits(&self, plan_node_id: PlanNodeId) -> Result<()> {
        {
            let mut state = self.state.lock().expect("remote task lock");
            if !state.no_more_splits.insert(plan_node_id) {
                return Ok(());
            }
            state.needs_update = true;
        }
        if self.started.load(Ordering::Acquire) {
            self.try_send_update();
        }
        Ok(())
    }

    fn task_status(&self) -> TaskStatus {
        self.state.lock().expect("remote task lock").status.clone()
    }

    fn add_state_change_listener(&self, listener: TaskStatusListener) {
        self.listeners
            .lock()
            .expect("remote task listeners lock")
            .push(Arc::clone(&listener));
        listener(&self.task_status());
    }

    fn when_split_queue_has_space(&self, max_queued: usize) -> SettableFuture<()> {
        let mut state = self.state.lock().expect("remote task lock");
        if queued_count(&state) < max_queued || state.status.is_done() {
            return SettableFuture::completed(());
        }
        if let Some(waiter) = state.space_waiters.iter().find(|w| w.max_queued == max_queued) {
            return waiter.future.clone();
        }
        let future = SettableFuture::new();
        state.space_waiters.push(SpaceWaiter {
            max_queued,
            future: future.clone(),
        });
        future
    }

    fn queued_split_count(&self) -> usize {
        queued_count(&self.state.lock().expect("remote task lock"))
    }

    fn cancel(&self) {
        self.send_cancel(false);
    }

    fn abort(&self) {
        self.send_cancel(true);
    }

    fn fetch_task_info(&self) -> Result<TaskInfo> {
        self.transport.get_task_info(&self.node, &self.task_id)
    }
}

/// Builds `RemoteTaskClient`s over one shared transport.
pub struct RemoteTaskClientFactory {
    transport: Arc<dyn TaskTransport>,
    config: RemoteTaskConfig,
}

impl RemoteTaskClientFactory {
    pub fn new(transport: Arc<dyn TaskTransport>, config: RemoteTaskConfig) -> Self {
        Self { transport, config }
    }
}

impl RemoteTaskFactory for RemoteTaskClientFactory {
    fn create_remote_task(
        &self,
        node: &InternalNode,
        task_id: TaskId,
        fragment: &PlanFragment,
        output_buffers: OutputBuffers,
    ) -> Arc<dyn RemoteTask> {
        RemoteTaskClient::new(
            node.clone(),
            task_id,
            fragment.clone(),
            output_buffers,
            Arc::clone(&self.transport),
            self.config,
        )
    }
}
