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
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Query id, formatted `yyyymmdd_hhmmss_nnnnn_xxxxx` when generated locally.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct QueryId(String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        if id.is_empty() {
            return Err("query id must not be empty".to_string());
        }
        if id.contains('.') || id.contains('/') {
            return Err(format!("invalid query id '{}': '.' and '/' are reserved", id));
        }
        Ok(Self(id))
    }

    /// Id for runtime states that run outside of any coordinator query.
    pub fn local() -> Self {
        Self("local".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates unique query ids for one coordinator process.
pub struct QueryIdGenerator {
    coordinator_suffix: String,
    state: Mutex<(String, u32)>,
}

const ID_ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyz23456789";

impl QueryIdGenerator {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let coordinator_suffix = (0..5)
            .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
            .collect();
        Self {
            coordinator_suffix,
            state: Mutex::new((String::new(), 0)),
        }
    }

    pub fn create_next_query_id(&self) -> QueryId {
        let now: DateTime<Utc> = Utc::now();
        let prefix = now.format("%Y%m%d_%H%M%S").to_string();
        let mut guard = self.state.lock().expect("query id generator lock");
        if guard.0 != prefix {
            guard.0 = prefix.clone();
            guard.1 = 0;
        }
        guard.1 = (guard.1 + 1) % 100_000;
        QueryId(format!("{}_{:05}_{}", prefix, guard.1, self.coordinator_suffix))
    }
}

impl Default for QueryIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Stage id, unique within a query. Equal to the id of the fragment it runs.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct StageId(pub u32);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Plan fragment id. Fragments map one-to-one onto stages.
pub type FragmentId = StageId;

/// Plan node id, unique within a fragment.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PlanNodeId(pub u32);

impl fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task id `(query, stage, partition)`, printed as `query.stage.partition`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TaskId {
    pub query_id: QueryId,
    pub stage_id: StageId,
    pub partition_id: u32,
}

impl TaskId {
    pub fn new(query_id: QueryId, stage_id: StageId, partition_id: u32) -> Self {
        Self {
            query_id,
            stage_id,
            partition_id,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.query_id, self.stage_id, self.partition_id
        )
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, '.');
        let partition = parts.next();
        let stage = parts.next();
        let query = parts.next();
        let (Some(query), Some(stage), Some(partition)) = (query, stage, partition) else {
            return Err(format!("invalid task id '{}'", s));
        };
        let stage_id = stage
            .parse::<u32>()
            .map_err(|e| format!("invalid stage id in task id '{}': {}", s, e))?;
        let partition_id = partition
            .parse::<u32>()
            .map_err(|e| format!("invalid partition id in task id '{}': {}", s, e))?;
        Ok(Self {
            query_id: QueryId::new(query)?,
            stage_id: StageId(stage_id),
            partition_id,
        })
    }
}

/// Cluster node id as announced through discovery.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 128-bit id used for task instances, printed in UUID layout.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct UniqueId {
    pub hi: i64,
    pub lo: i64,
}

impl UniqueId {
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            hi: rng.r#gen(),
            lo: rng.r#gen(),
        }
    }

    pub fn to_uuid_string(self) -> String {
        format_uuid(self.hi, self.lo)
    }
}

pub fn format_uuid(hi: i64, lo: i64) -> String {
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        ((hi as u64) >> 32) as u32,
        ((hi as u64) >> 16) as u16,
        (hi as u64) as u16,
        ((lo as u64) >> 48) as u16,
        (lo as u64) & 0x0000_FFFF_FFFF_FFFF
    )
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_uuid(self.hi, self.lo))
    }
}
