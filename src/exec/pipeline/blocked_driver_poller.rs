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
//! Blocked-driver poller for event-driven wake-up.
//!
//! Responsibilities:
//! - Parks blocked drivers and re-queues them once their blocking condition resolves.
//! - Registers wake-up observers on dependencies and source/sink observables; a bounded poll
//!   interval re-checks every parked driver so no wake-up can be lost.
//!
//! Key exported interfaces:
//! - Types: `BlockedDriverPoller`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use super::driver::DriverState;
use super::driver_executor::{DriverTask, ExecutorShared};
use super::operator::BlockedReason;
use crate::exec::pipeline::schedule::observer::Observer;
use crate::novaexec_logging::{debug, error};

struct BlockedTask {
    task: DriverTask,
    next_poll_at: Instant,
}

struct PollerState {
    shared: Arc<ExecutorShared>,
    poll_interval: Duration,
    blocked: Mutex<VecDeque<BlockedTask>>,
    cv: Condvar,
    woken: Mutex<bool>,
    shutdown: AtomicBool,
    started: AtomicBool,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

#[derive(Clone)]
/// Poller that tracks blocked drivers and re-queues them once blocking dependencies are satisfied.
pub(crate) struct BlockedDriverPoller {
    state: Arc<PollerState>,
}

impl BlockedDriverPoller {
    pub(crate) fn new(shared: Arc<ExecutorShared>, poll_interval: Duration) -> Self {
        let state = PollerState {
            shared,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            blocked: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            woken: Mutex::new(false),
            shutdown: AtomicBool::new(false),
            started: AtomicBool::new(false),
            handle: Mutex::new(None),
        };
        Self {
            state: Arc::new(state),
        }
    }

    pub(crate) fn start(&self) {
        if self.state.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new()
            .name("blocked_driver_poller".to_string())
            .spawn(move || run_poller(state));
        match spawned {
            Ok(handle) => {
                *self.state.handle.lock().expect("blocked poller handle lock") = Some(handle);
            }
            Err(err) => error!("failed to spawn blocked driver poller: {}", err),
        }
    }

    pub(crate) fn add_blocked(&self, task: DriverTask) {
        self.register_wakeups(&task);
        task.driver().set_in_blocked(true);
        let next_poll_at = Instant::now() + self.state.poll_interval;
        {
            let mut blocked = self.state.blocked.lock().expect("blocked poller lock");
            blocked.push_back(BlockedTask { task, next_poll_at });
        }
        // the condition may have resolved before the observer was registered
        self.wake();
    }

    fn register_wakeups(&self, task: &DriverTask) {
        let driver = task.driver();
        match driver.state() {
            DriverState::Blocked(BlockedReason::Dependency(dep)) => {
                dep.add_waiter(self.waker());
            }
            DriverState::Blocked(BlockedReason::InputEmpty) => {
                if let Some(observable) = driver.source_observable()
                    && driver.try_mark_source_observer_registered()
                {
                    observable.add_observer(self.waker());
                }
            }
            DriverState::Blocked(BlockedReason::OutputFull) => {
                if let Some(observable) = driver.sink_observable()
                    && driver.try_mark_sink_observer_registered()
                {
                    observable.add_observer(self.waker());
                }
            }
            _ => {}
        }
    }

    fn waker(&self) -> Observer {
        let weak: Weak<PollerState> = Arc::downgrade(&self.state);
        Arc::new(move || {
            if let Some(state) = weak.upgrade() {
                wake_state(&state);
            }
        })
    }

    pub(crate) fn wake(&self) {
        wake_state(&self.state);
    }

    pub(crate) fn blocked_count(&self) -> usize {
        self.state.blocked.lock().expect("blocked poller lock").len()
    }

    /// Stop the poller thread and hand back every parked driver.
    pub(crate) fn shutdown(&self) -> Vec<DriverTask> {
        self.state.shutdown.store(true, Ordering::Release);
        self.wake();
        let handle = self
            .state
            .handle
            .lock()
            .expect("blocked poller handle lock")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let mut blocked = self.state.blocked.lock().expect("blocked poller lock");
        blocked.drain(..).map(|entry| entry.task).collect()
    }
}

fn wake_state(state: &PollerState) {
    let mut woken = state.woken.lock().expect("blocked poller wake lock");
    *woken = true;
    state.cv.notify_one();
}

fn run_poller(state: Arc<PollerState>) {
    debug!(
        "BlockedDriverPoller started with poll_interval={:?}",
        state.poll_interval
    );
    let mut force = false;
    loop {
        if state.shutdown.load(Ordering::Acquire) {
            break;
        }

        let mut ready_tasks = Vec::new();
        let mut aborted_tasks = Vec::new();
        drain_blocked(&state, force, &mut ready_tasks, &mut aborted_tasks);

        for task in aborted_tasks {
            task.finish_due_to_abort();
        }
        for task in ready_tasks {
            state.shared.enqueue(task);
        }

        let mut woken = state.woken.lock().expect("blocked poller wake lock");
        if !*woken {
            let (next, _) = state
                .cv
                .wait_timeout(woken, state.poll_interval)
                .unwrap_or_else(|e| e.into_inner());
            woken = next;
        }
        force = std::mem::replace(&mut *woken, false);
    }
    debug!("BlockedDriverPoller stopped");
}

/// `force` re-checks every parked driver regardless of its next poll time.
fn drain_blocked(
    state: &PollerState,
    force: bool,
    ready_tasks: &mut Vec<DriverTask>,
    aborted_tasks: &mut Vec<DriverTask>,
) {
    let now = Instant::now();
    let mut blocked = state.blocked.lock().expect("blocked poller lock");
    let mut pending = VecDeque::with_capacity(blocked.len());
    while let Some(mut entry) = blocked.pop_front() {
        if entry.task.should_abort_immediately() {
            entry.task.driver().set_in_blocked(false);
            aborted_tasks.push(entry.task);
            continue;
        }
        if !force && entry.next_poll_at > now {
            pending.push_back(entry);
            continue;
        }
        if entry.task.check_is_ready() {
            entry.task.driver().set_in_blocked(false);
            entry.task.set_ready();
            ready_tasks.push(entry.task);
        } else {
            entry.next_poll_at = now + state.poll_interval;
            pending.push_back(entry);
        }
    }
    *blocked = pending;
}
