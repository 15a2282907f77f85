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
//! Split model shared by the coordinator and the workers.
//!
//! Responsibilities:
//! - `Split` is an opaque connector payload plus an optional bucket and a size estimate.
//! - `ScheduledSplit` carries the per-task sequence id used to deduplicate redelivered splits.
//! - Remote splits point an exchange source at a producing task's output buffer.
//!
//! Key exported interfaces:
//! - Types: `Split`, `ScheduledSplit`, `SplitAssignment`, `TaskLocation`, `SplitBatch`.

use serde::{Deserialize, Serialize};

use crate::common::ids::{NodeId, PlanNodeId, TaskId};
use crate::common::status::{ExecError, Result};

/// Catalog name reserved for splits that address a remote task's output buffer.
pub const REMOTE_CATALOG: &str = "$remote";

/// Where a producing task lives and which of its output buffers a consumer reads.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskLocation {
    pub node_id: NodeId,
    /// Base URI of the producing node; empty for in-process nodes.
    pub uri: String,
    pub task_id: TaskId,
    pub buffer_id: u32,
}

impl TaskLocation {
    pub fn results_path(&self) -> String {
        format!("/v1/task/{}/results/{}", self.task_id, self.buffer_id)
    }
}

impl std::fmt::Display for TaskLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/{}", self.task_id, self.node_id, self.buffer_id)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub catalog: String,
    pub info: serde_json::Value,
    #[serde(default)]
    pub bucket: Option<usize>,
    #[serde(default)]
    pub estimated_size_bytes: u64,
}

impl Split {
    pub fn new(catalog: impl Into<String>, info: serde_json::Value) -> Self {
        Self {
            catalog: catalog.into(),
            info,
            bucket: None,
            estimated_size_bytes: 0,
        }
    }

    pub fn with_bucket(mut self, bucket: usize) -> Self {
        self.bucket = Some(bucket);
        self
    }

    pub fn with_estimated_size(mut self, bytes: u64) -> Self {
        self.estimated_size_bytes = bytes;
        self
    }

    pub fn remote(location: &TaskLocation) -> Result<Self> {
        let info = serde_json::to_value(location)
            .map_err(|e| ExecError::internal(format!("encode task location: {}", e)))?;
        Ok(Self::new(REMOTE_CATALOG, info))
    }

    pub fn is_remote(&self) -> bool {
        self.catalog == REMOTE_CATALOG
    }

    pub fn remote_location(&self) -> Result<TaskLocation> {
        if !self.is_remote() {
            return Err(ExecError::invalid_plan(format!(
                "split of catalog {} is not a remote split",
                self.catalog
            )));
        }
        serde_json::from_value(self.info.clone())
            .map_err(|e| ExecError::invalid_plan(format!("malformed remote split: {}", e)))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduledSplit {
    /// Unique per task and monotonically assigned; a task applies each sequence id once.
    pub sequence_id: u64,
    pub plan_node_id: PlanNodeId,
    pub split: Split,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitAssignment {
    pub plan_node_id: PlanNodeId,
    pub splits: Vec<ScheduledSplit>,
    pub no_more_splits: bool,
}

impl SplitAssignment {
    pub fn new(plan_node_id: PlanNodeId, splits: Vec<ScheduledSplit>, no_more_splits: bool) -> Self {
        Self {
            plan_node_id,
            splits,
            no_more_splits,
        }
    }
}

/// Result of one `SplitSource::get_next_batch` call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SplitBatch {
    pub splits: Vec<Split>,
    /// No more splits will ever be returned for the requested bucket.
    pub last_batch: bool,
}
