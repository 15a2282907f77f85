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
//! Driver executor and worker pool.
//!
//! Responsibilities:
//! - Schedules driver tasks across a fixed set of worker threads and tracks per-task completion.
//! - Parks blocked drivers in the `BlockedDriverPoller` until they can make progress.
//!
//! Key exported interfaces:
//! - Types: `TaskExecution`, `DriverTask`, `DriverExecutor`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::common::app_config::RuntimeConfig;
use crate::common::ids::TaskId;
use crate::common::status::{ErrorCode, ExecError, Result};
use crate::novaexec_logging::{debug, info};
use crate::runtime::task_state::TaskStateMachine;

use super::blocked_driver_poller::BlockedDriverPoller;
use super::driver::{DriverState, PipelineDriver};

type DriversDone = Box<dyn FnOnce(Option<ExecError>) + Send + 'static>;

/// Completion tracker for every driver of one task.
///
/// The first driver failure fails the task; once aborting, queued and parked drivers are
/// dropped without running again.
pub struct TaskExecution {
    task_id: TaskId,
    mu: Mutex<TaskExecutionState>,
    cv: Condvar,
    state_machine: Arc<TaskStateMachine>,
    on_drivers_done: Mutex<Option<DriversDone>>,
}

#[derive(Debug)]
struct TaskExecutionState {
    remaining: usize,
    aborting: bool,
    error: Option<ExecError>,
}

impl TaskExecution {
    pub fn new(
        task_id: TaskId,
        driver_count: usize,
        state_machine: Arc<TaskStateMachine>,
        on_drivers_done: impl FnOnce(Option<ExecError>) + Send + 'static,
    ) -> Arc<Self> {
        let execution = Arc::new(Self {
            task_id,
            mu: Mutex::new(TaskExecutionState {
                remaining: driver_count,
                aborting: false,
                error: None,
            }),
            cv: Condvar::new(),
            state_machine,
            on_drivers_done: Mutex::new(Some(Box::new(on_drivers_done))),
        });
        if driver_count == 0 {
            execution.run_done_callback(None);
        }
        execution
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn should_abort(&self) -> bool {
        self.mu.lock().expect("task execution lock").aborting || self.state_machine.state().is_done()
    }

    pub fn remaining(&self) -> usize {
        self.mu.lock().expect("task execution lock").remaining
    }

    pub fn error(&self) -> Option<ExecError> {
        self.mu.lock().expect("task execution lock").error.clone()
    }

    /// Record `err` (first wins), fail the task and stop scheduling its drivers.
    pub fn fail(&self, err: ExecError) {
        {
            let mut st = self.mu.lock().expect("task execution lock");
            if st.error.is_none() {
                st.error = Some(err.clone());
            }
            st.aborting = true;
            self.cv.notify_all();
        }
        self.state_machine.failed(err);
    }

    /// Stop scheduling drivers without recording an error.
    pub fn abort(&self) {
        let mut st = self.mu.lock().expect("task execution lock");
        st.aborting = true;
        self.cv.notify_all();
    }

    pub fn driver_finished(&self) {
        let error = {
            let mut st = self.mu.lock().expect("task execution lock");
            if st.remaining == 0 {
                return;
            }
            st.remaining -= 1;
            if st.remaining > 0 {
                return;
            }
            self.cv.notify_all();
            st.error.clone()
        };
        debug!("all drivers done: task={}", self.task_id);
        self.run_done_callback(error);
    }

    fn run_done_callback(&self, error: Option<ExecError>) {
        let callback = self
            .on_drivers_done
            .lock()
            .expect("task execution callback lock")
            .take();
        if let Some(callback) = callback {
            callback(error);
        }
    }

    /// Wait for every driver to finish. `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let deadline = Instant::now() + timeout;
        let mut st = self.mu.lock().expect("task execution lock");
        while st.remaining > 0 {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self
                .cv
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            st = next;
        }
        Some(st.error.clone().map(Err).unwrap_or(Ok(())))
    }
}

/// Schedulable driver plus its completion hook.
pub struct DriverTask {
    driver: PipelineDriver,
    execution: Arc<TaskExecution>,
    time_slice: Duration,
}

impl DriverTask {
    pub fn new(driver: PipelineDriver, execution: Arc<TaskExecution>, time_slice: Duration) -> Self {
        Self {
            driver,
            execution,
            time_slice,
        }
    }

    pub(crate) fn driver(&self) -> &PipelineDriver {
        &self.driver
    }

    pub(crate) fn should_abort_immediately(&self) -> bool {
        self.execution.should_abort() && !self.driver.has_pending_finish()
    }

    pub(crate) fn finish_due_to_abort(self) {
        let execution = Arc::clone(&self.execution);
        drop(self);
        execution.driver_finished();
    }

    pub(crate) fn fail(self, err: ExecError) {
        let execution = Arc::clone(&self.execution);
        drop(self);
        execution.fail(err);
        execution.driver_finished();
    }

    pub(crate) fn check_is_ready(&self) -> bool {
        self.driver.check_is_ready()
    }

    pub(crate) fn set_ready(&mut self) {
        self.driver.set_ready();
    }
}

/// Shared executor internals used by worker threads and the poller.
pub(crate) struct ExecutorShared {
    pub(crate) queue: Mutex<VecDeque<DriverTask>>,
    pub(crate) cv: Condvar,
    pub(crate) shutdown: AtomicBool,
}

impl ExecutorShared {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn enqueue(&self, task: DriverTask) {
        if self.shutdown.load(Ordering::Acquire) {
            task.fail(shutting_down());
            return;
        }
        let mut queue = self.queue.lock().expect("driver executor queue lock");
        queue.push_back(task);
        self.cv.notify_one();
    }
}

fn shutting_down() -> ExecError {
    ExecError::new(ErrorCode::ServerShuttingDown, "driver executor is shutting down")
}

/// Fixed-size worker pool running pipeline drivers cooperatively.
pub struct DriverExecutor {
    shared: Arc<ExecutorShared>,
    poller: BlockedDriverPoller,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    time_slice: Duration,
}

impl DriverExecutor {
    pub fn new(num_threads: usize, poll_interval: Duration, time_slice: Duration) -> Self {
        let num_threads = num_threads.max(1);
        let shared = Arc::new(ExecutorShared::new());
        let poller = BlockedDriverPoller::new(Arc::clone(&shared), poll_interval);
        poller.start();

        let mut workers = Vec::with_capacity(num_threads);
        for idx in 0..num_threads {
            let shared_cloned = Arc::clone(&shared);
            let poller_cloned = poller.clone();
            let spawned = thread::Builder::new()
                .name(format!("driver_worker_{}", idx))
                .spawn(move || worker_loop(shared_cloned, poller_cloned));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => crate::novaexec_logging::error!(
                    "failed to spawn driver worker {}: {}",
                    idx,
                    err
                ),
            }
        }
        info!(
            "driver executor started: threads={} time_slice={:?} poll_interval={:?}",
            workers.len(),
            time_slice,
            poll_interval
        );

        Self {
            shared,
            poller,
            workers: Mutex::new(workers),
            time_slice,
        }
    }

    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self::new(
            cfg.actual_exec_threads(),
            cfg.blocked_poll_interval(),
            cfg.driver_time_slice(),
        )
    }

    pub fn time_slice(&self) -> Duration {
        self.time_slice
    }

    pub fn submit(&self, tasks: Vec<DriverTask>) {
        if tasks.is_empty() {
            return;
        }
        if self.shared.shutdown.load(Ordering::Acquire) {
            for task in tasks {
                task.fail(shutting_down());
            }
            return;
        }
        let mut queue = self
            .shared
            .queue
            .lock()
            .expect("driver executor queue lock");
        for task in tasks {
            queue.push_back(task);
        }
        self.shared.cv.notify_all();
    }

    pub fn queued_drivers(&self) -> usize {
        self.shared
            .queue
            .lock()
            .expect("driver executor queue lock")
            .len()
    }

    pub fn blocked_drivers(&self) -> usize {
        self.poller.blocked_count()
    }

    /// Stop workers and the poller, failing every driver still queued or parked.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.cv.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock().expect("driver executor workers lock"));
        for handle in workers {
            let _ = handle.join();
        }
        let leftover: Vec<DriverTask> = self
            .shared
            .queue
            .lock()
            .expect("driver executor queue lock")
            .drain(..)
            .collect();
        for task in leftover {
            task.fail(shutting_down());
        }
        for task in self.poller.shutdown() {
            task.fail(shutting_down());
        }
        info!("driver executor stopped");
    }
}

impl Drop for DriverExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn worker_loop(shared: Arc<ExecutorShared>, poller: BlockedDriverPoller) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().expect("driver executor queue lock");
            while queue.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
                queue = shared
                    .cv
                    .wait(queue)
                    .unwrap_or_else(|e| e.into_inner());
            }
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            queue.pop_front()
        };

        let Some(mut task) = task else {
            continue;
        };

        if task.should_abort_immediately() {
            task.finish_due_to_abort();
            continue;
        }

        let time_slice = task.time_slice;
        let state = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            task.driver.process(time_slice)
        }))
        .unwrap_or_else(|payload| {
            DriverState::Failed(ExecError::internal(format!(
                "panic in driver execution: {}",
                panic_message(payload.as_ref())
            )))
        });

        match state {
            DriverState::Ready | DriverState::Running => {
                if task.should_abort_immediately() {
                    task.finish_due_to_abort();
                    continue;
                }
                shared.enqueue(task);
            }
            DriverState::Blocked(_) | DriverState::PendingFinish => {
                if task.should_abort_immediately() {
                    task.finish_due_to_abort();
                    continue;
                }
                poller.add_blocked(task);
            }
            DriverState::Finished | DriverState::Canceled => {
                task.execution.driver_finished();
            }
            DriverState::Failed(err) => {
                task.fail(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::{QueryId, StageId};
    use crate::exec::page::{Block, Page};
    use crate::exec::pipeline::dependency::{Dependency, DependencyHandle};
    use crate::exec::pipeline::driver::DriverContext;
    use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
    use crate::runtime::runtime_state::{ExecOptions, RuntimeState};
    use crate::runtime::task_state::TaskState;
    use std::sync::atomic::AtomicUsize;

    /// Emits `remaining` single-row pages, optionally gated on a dependency.
    struct GatedSource {
        remaining: usize,
        gate: Option<DependencyHandle>,
        panic: bool,
    }

    impl Operator for GatedSource {
        fn name(&self) -> &str {
            "gated_source"
        }
        fn is_finished(&self) -> bool {
            self.remaining == 0
        }
        fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
            Some(self)
        }
        fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
            Some(self)
        }
    }

    impl ProcessorOperator for GatedSource {
        fn need_input(&self) -> bool {
            false
        }
        fn has_output(&self) -> bool {
            self.remaining > 0
        }
        fn push_chunk(&mut self, _state: &RuntimeState, _page: Page) -> Result<()> {
            Err(ExecError::internal("source accepts no input"))
        }
        fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Page>> {
            if self.panic {
                panic!("source blew up");
            }
            self.remaining -= 1;
            Ok(Some(Page::try_new(vec![Block::from_longs(vec![1])])?))
        }
        fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
            Ok(())
        }
        fn precondition_dependency(&self) -> Option<DependencyHandle> {
            self.gate.clone()
        }
    }

    struct Sink {
        rows: Arc<AtomicUsize>,
        finished: bool,
    }

    impl Operator for Sink {
        fn name(&self) -> &str {
            "sink"
        }
        fn is_finished(&self) -> bool {
            self.finished
        }
        fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
            Some(self)
        }
        fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
            Some(self)
        }
    }

    impl ProcessorOperator for Sink {
        fn need_input(&self) -> bool {
            !self.finished
        }
        fn has_output(&self) -> bool {
            false
        }
        fn push_chunk(&mut self, _state: &RuntimeState, page: Page) -> Result<()> {
            self.rows.fetch_add(page.position_count(), Ordering::SeqCst);
            Ok(())
        }
        fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Page>> {
            Ok(None)
        }
        fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
            self.finished = true;
            Ok(())
        }
    }

    fn setup(
        sources: Vec<GatedSource>,
    ) -> (Arc<RuntimeState>, Arc<TaskExecution>, Vec<DriverTask>, Arc<AtomicUsize>) {
        let task_id = TaskId::new(QueryId::new("q").unwrap(), StageId(1), 0);
        let sm = Arc::new(TaskStateMachine::new(task_id.clone()));
        sm.transition_to_running();
        let state = Arc::new(RuntimeState::new(ExecOptions::default(), Arc::clone(&sm), None));
        let rows = Arc::new(AtomicUsize::new(0));
        let execution = TaskExecution::new(task_id.clone(), sources.len(), Arc::clone(&sm), |_| {});
        let tasks = sources
            .into_iter()
            .enumerate()
            .map(|(idx, src)| {
                let ops: Vec<Box<dyn Operator>> = vec![
                    Box::new(src),
                    Box::new(Sink {
                        rows: Arc::clone(&rows),
                        finished: false,
                    }),
                ];
                let driver = PipelineDriver::new(
                    DriverContext::new(task_id.clone(), 0, idx),
                    ops,
                    Arc::clone(&state),
                );
                DriverTask::new(driver, Arc::clone(&execution), Duration::from_millis(20))
            })
            .collect();
        (state, execution, tasks, rows)
    }

    #[test]
    fn blocked_driver_resumes_when_dependency_ready() {
        let executor = DriverExecutor::new(2, Duration::from_millis(5), Duration::from_millis(20));
        let gate = Dependency::new("gate");
        let (_state, execution, tasks, rows) = setup(vec![
            GatedSource {
                remaining: 10,
                gate: Some(Arc::clone(&gate)),
                panic: false,
            },
            GatedSource {
                remaining: 5,
                gate: None,
                panic: false,
            },
        ]);
        executor.submit(tasks);
        assert!(execution.wait_timeout(Duration::from_millis(100)).is_none());
        gate.set_ready();
        assert_eq!(execution.wait_timeout(Duration::from_secs(10)), Some(Ok(())));
        assert_eq!(rows.load(Ordering::SeqCst), 15);
        executor.shutdown();
    }

    #[test]
    fn panic_becomes_internal_failure() {
        let executor = DriverExecutor::new(1, Duration::from_millis(5), Duration::from_millis(20));
        let (state, execution, tasks, _rows) = setup(vec![GatedSource {
            remaining: 1,
            gate: None,
            panic: true,
        }]);
        executor.submit(tasks);
        let result = execution.wait_timeout(Duration::from_secs(10)).unwrap();
        let err = result.unwrap_err();
        assert_eq!(err.code(), ErrorCode::GenericInternalError);
        assert!(err.message.contains("source blew up"));
        assert_eq!(state.task_state(), TaskState::Failed);
    }

    #[test]
    fn cancel_releases_parked_drivers() {
        let executor = DriverExecutor::new(1, Duration::from_millis(5), Duration::from_millis(20));
        let gate = Dependency::new("never");
        let (state, execution, tasks, _rows) = setup(vec![GatedSource {
            remaining: 1,
            gate: Some(gate),
            panic: false,
        }]);
        executor.submit(tasks);
        std::thread::sleep(Duration::from_millis(30));
        state.state_machine().cancel();
        assert_eq!(execution.wait_timeout(Duration::from_secs(10)), Some(Ok(())));
        assert_eq!(executor.blocked_drivers(), 0);
    }
}
