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
use std::sync::Arc;

use crate::common::app_config::RuntimeConfig;
use crate::common::ids::{QueryId, StageId, TaskId};
use crate::common::status::ExecError;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::DriverStatsRegistry;
use crate::runtime::query_context::QueryContext;
use crate::runtime::task_state::{TaskState, TaskStateMachine};

/// Page sizing knobs operators read while producing output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecOptions {
    pub page_target_bytes: usize,
    pub page_target_rows: usize,
}

impl Default for ExecOptions {
    fn default() -> Self {
        let cfg = RuntimeConfig::default();
        Self::from(&cfg)
    }
}

impl From<&RuntimeConfig> for ExecOptions {
    fn from(cfg: &RuntimeConfig) -> Self {
        Self {
            page_target_bytes: cfg.page_target_bytes.max(1),
            page_target_rows: cfg.page_target_rows.max(1),
        }
    }
}

/// RuntimeState is the per-task execution context handed to every operator call.
///
/// It links drivers to the task state machine: a driver observing `is_terminated` stops at the
/// next loop iteration, and `fail` records the first error on the task.
pub struct RuntimeState {
    options: ExecOptions,
    state_machine: Arc<TaskStateMachine>,
    query_context: Option<Arc<QueryContext>>,
    mem_tracker: Arc<MemTracker>,
    driver_stats: DriverStatsRegistry,
}

impl RuntimeState {
    pub fn new(
        options: ExecOptions,
        state_machine: Arc<TaskStateMachine>,
        query_context: Option<Arc<QueryContext>>,
    ) -> Self {
        let label = format!("task_{}", state_machine.task_id());
        let mem_tracker = match query_context.as_ref() {
            Some(ctx) => MemTracker::new_child(label, &ctx.mem_tracker()),
            None => MemTracker::new_root(label),
        };
        Self {
            options,
            state_machine,
            query_context,
            mem_tracker,
            driver_stats: DriverStatsRegistry::default(),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        self.state_machine.task_id()
    }

    pub fn options(&self) -> ExecOptions {
        self.options
    }

    pub fn page_target_bytes(&self) -> usize {
        self.options.page_target_bytes
    }

    pub fn page_target_rows(&self) -> usize {
        self.options.page_target_rows
    }

    pub fn state_machine(&self) -> &Arc<TaskStateMachine> {
        &self.state_machine
    }

    pub fn query_context(&self) -> Option<&Arc<QueryContext>> {
        self.query_context.as_ref()
    }

    pub fn mem_tracker(&self) -> Arc<MemTracker> {
        Arc::clone(&self.mem_tracker)
    }

    pub fn driver_stats(&self) -> &DriverStatsRegistry {
        &self.driver_stats
    }

    /// True once the task reached a terminal state.
    pub fn is_terminated(&self) -> bool {
        self.state_machine.state().is_done()
    }

    pub fn task_state(&self) -> TaskState {
        self.state_machine.state()
    }

    pub fn fail(&self, err: ExecError) {
        self.state_machine.failed(err);
    }

    pub fn error(&self) -> Option<ExecError> {
        self.state_machine.failure()
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        let task_id = TaskId::new(QueryId::local(), StageId(0), 0);
        Self::new(
            ExecOptions::default(),
            Arc::new(TaskStateMachine::new(task_id)),
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_terminates_state() {
        let state = RuntimeState::default();
        assert!(!state.is_terminated());
        state.fail(ExecError::internal("boom"));
        assert!(state.is_terminated());
        assert_eq!(state.task_state(), TaskState::Failed);
        assert_eq!(state.error().unwrap().message, "boom");
        assert_eq!(state.task_id().to_string(), "local.0.0");
    }
}
