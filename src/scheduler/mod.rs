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
//! Coordinator-side distributed scheduling.
//!
//! Responsibilities:
//! - Tracks cluster membership and places splits and tasks on worker nodes.
//! - Drives one stage scheduler per plan fragment and folds stage states into the query state.
//!
//! Key exported interfaces:
//! - Types: `QueryScheduler`, `StageExecution`, `NodeManager`, `RemoteTask`, `SplitSource`.

pub mod bucket_node_map;
pub mod node_manager;
pub mod node_selector;
pub mod query_scheduler;
pub mod remote_task;
pub mod split;
pub mod split_source;
pub mod stage;
pub mod stage_scheduler;

#[cfg(test)]
pub(crate) mod testing;
