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
//! Task status and info documents reported to the coordinator.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::common::ids::{NodeId, PlanNodeId, TaskId};
use crate::common::status::ExecutionFailureInfo;
use crate::exec::plan::PlanFragment;
use crate::runtime::output_buffer::{OutputBufferInfo, OutputBuffers};
use crate::runtime::profile::DriverStatsSnapshot;
use crate::runtime::task_state::TaskState;
use crate::scheduler::split::SplitAssignment;

/// Compact document returned by status long-polls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub task_instance_id: String,
    pub version: u64,
    pub state: TaskState,
    pub node_id: NodeId,
    #[serde(default)]
    pub failures: Vec<ExecutionFailureInfo>,
    pub queued_splits: usize,
    pub running_splits: usize,
    pub completed_splits: usize,
    pub memory_reservation_bytes: i64,
    pub peak_memory_bytes: i64,
    pub output_buffer_overutilized: bool,
    /// Milliseconds since the unix epoch of the last coordinator request.
    pub last_heartbeat_ms: i64,
}

impl TaskStatus {
    /// Placeholder for a task the node has not created yet.
    pub fn initial(task_id: TaskId, node_id: NodeId) -> Self {
        Self {
            task_id,
            task_instance_id: String::new(),
            version: 0,
            state: TaskState::Planned,
            node_id,
            failures: Vec::new(),
            queued_splits: 0,
            running_splits: 0,
            completed_splits: 0,
            memory_reservation_bytes: 0,
            peak_memory_bytes: 0,
            output_buffer_overutilized: false,
            last_heartbeat_ms: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub create_time_ms: i64,
    pub end_time_ms: Option<i64>,
    pub total_drivers: usize,
    pub running_drivers: usize,
    pub completed_drivers: usize,
    pub input_rows: u64,
    pub output_rows: u64,
    pub drivers: Vec<DriverStatsSnapshot>,
}

/// Full document: status plus stats and output buffer details.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub status: TaskStatus,
    pub stats: TaskStats,
    pub output_buffers: Option<OutputBufferInfo>,
    pub no_more_splits: BTreeSet<PlanNodeId>,
    pub needs_plan: bool,
}

/// Create-or-update payload sent by the coordinator.
///
/// The fragment is only required on the first update; later updates carry new splits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdateRequest {
    #[serde(default)]
    pub fragment: Option<PlanFragment>,
    #[serde(default)]
    pub sources: Vec<SplitAssignment>,
    pub output_buffers: OutputBuffers,
}

impl TaskUpdateRequest {
    pub fn new(
        fragment: Option<PlanFragment>,
        sources: Vec<SplitAssignment>,
        output_buffers: OutputBuffers,
    ) -> Self {
        Self {
            fragment,
            sources,
            output_buffers,
        }
    }
}
