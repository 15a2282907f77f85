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
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::future::SettableFuture;
use crate::common::ids::TaskId;
use crate::common::status::{ErrorCode, ExecError};
use crate::novaexec_logging::{debug, warn};
use crate::runtime::state_machine::StateMachine;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Planned,
    Running,
    /// All drivers are done; the output buffer is still being drained.
    Finishing,
    Finished,
    Canceled,
    Aborted,
    Failed,
}

impl TaskState {
    pub fn is_done(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Canceled | TaskState::Aborted | TaskState::Failed
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            TaskState::Planned => "PLANNED",
            TaskState::Running => "RUNNING",
            TaskState::Finishing => "FINISHING",
            TaskState::Finished => "FINISHED",
            TaskState::Canceled => "CANCELED",
            TaskState::Aborted => "ABORTED",
            TaskState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let state = match s.to_ascii_uppercase().as_str() {
            "PLANNED" => TaskState::Planned,
            "RUNNING" => TaskState::Running,
            "FINISHING" => TaskState::Finishing,
            "FINISHED" => TaskState::Finished,
            "CANCELED" => TaskState::Canceled,
            "ABORTED" => TaskState::Aborted,
            "FAILED" => TaskState::Failed,
            _ => return None,
        };
        Some(state)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Task lifecycle: `PLANNED -> RUNNING -> FINISHING -> FINISHED`, or any non-terminal state
/// to `FAILED | CANCELED | ABORTED`.
///
/// Only the first failure is kept; later failures are logged and dropped.
pub struct TaskStateMachine {
    task_id: TaskId,
    machine: StateMachine<TaskState>,
    failure: Mutex<Option<ExecError>>,
}

impl TaskStateMachine {
    pub fn new(task_id: TaskId) -> Self {
        let machine = StateMachine::new(
            format!("task {}", task_id),
            TaskState::Planned,
            |s: &TaskState| s.is_done(),
        );
        Self {
            task_id,
            machine,
            failure: Mutex::new(None),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn state(&self) -> TaskState {
        self.machine.get()
    }

    pub fn version(&self) -> u64 {
        self.machine.version()
    }

    pub fn failure(&self) -> Option<ExecError> {
        self.failure.lock().expect("task failure lock").clone()
    }

    pub fn transition_to_running(&self) -> bool {
        self.machine
            .compare_and_set(&TaskState::Planned, TaskState::Running)
    }

    pub fn transition_to_finishing(&self) -> bool {
        self.machine.set_if(TaskState::Finishing, |s| {
            matches!(s, TaskState::Planned | TaskState::Running)
        })
    }

    /// `FINISHED` is reachable only from `FINISHING`; from any other state this is a no-op.
    pub fn finished(&self) -> TaskState {
        self.machine
            .compare_and_set(&TaskState::Finishing, TaskState::Finished);
        self.state()
    }

    pub fn cancel(&self) -> TaskState {
        self.transition_to_done(TaskState::Canceled)
    }

    pub fn abort(&self) -> TaskState {
        self.transition_to_done(TaskState::Aborted)
    }

    /// Record `err` (first failure wins) and move to `FAILED`.
    pub fn failed(&self, err: ExecError) -> TaskState {
        {
            let mut guard = self.failure.lock().expect("task failure lock");
            if guard.is_some() || self.state().is_done() {
                debug!(
                    "task {} discarding subsequent failure: {}",
                    self.task_id, err
                );
                return self.state();
            }
            if err.code() != ErrorCode::UserCanceled {
                warn!("task {} failed: {}", self.task_id, err);
            }
            *guard = Some(err);
        }
        self.transition_to_done(TaskState::Failed)
    }

    fn transition_to_done(&self, target: TaskState) -> TaskState {
        self.machine.set_if(target, |s| !s.is_done());
        self.state()
    }

    pub fn add_state_change_listener(&self, listener: impl Fn(&TaskState) + Send + Sync + 'static) {
        self.machine.add_state_change_listener(listener);
    }

    pub fn state_change(&self, current: TaskState) -> SettableFuture<TaskState> {
        self.machine.state_change(&current)
    }

    pub fn wait_for_state_change(&self, current: TaskState, max_wait: Duration) -> TaskState {
        self.machine.wait_for_state_change(&current, max_wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::{QueryId, StageId};

    fn sm() -> TaskStateMachine {
        TaskStateMachine::new(TaskId::new(QueryId::new("q").unwrap(), StageId(0), 0))
    }

    #[test]
    fn terminal_transitions_report_existing_state() {
        let sm = sm();
        assert!(sm.transition_to_running());
        assert_eq!(sm.cancel(), TaskState::Canceled);
        assert_eq!(sm.abort(), TaskState::Canceled);
        assert_eq!(sm.finished(), TaskState::Canceled);
        assert!(!sm.transition_to_finishing());
    }

    #[test]
    fn first_failure_wins() {
        let sm = sm();
        sm.transition_to_running();
        assert_eq!(
            sm.failed(ExecError::internal("first")),
            TaskState::Failed
        );
        sm.failed(ExecError::internal("second"));
        assert_eq!(sm.failure().unwrap().message, "first");
    }

    #[test]
    fn finishing_precedes_finished() {
        let sm = sm();
        sm.transition_to_running();
        let change = sm.state_change(TaskState::Running);
        assert!(sm.transition_to_finishing());
        assert_eq!(change.try_get(), Some(TaskState::Finishing));
        assert!(!sm.transition_to_running());
        assert_eq!(sm.finished(), TaskState::Finished);
        assert_eq!(sm.version(), 3);
    }

    #[test]
    fn finished_requires_finishing() {
        let sm = sm();
        assert_eq!(sm.finished(), TaskState::Planned);
        sm.transition_to_running();
        assert_eq!(sm.finished(), TaskState::Running);
        assert_eq!(sm.version(), 1);
        assert!(sm.transition_to_finishing());
        assert_eq!(sm.finished(), TaskState::Finished);
    }
}
