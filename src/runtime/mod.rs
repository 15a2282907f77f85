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
//! Node runtime: memory, tasks, buffers and exchange.

pub mod exchange_client;
pub mod io;
pub mod mem_tracker;
pub mod memory_pool;
pub mod node_context;
pub mod output_buffer;
pub mod profile;
pub mod query_context;
pub mod runtime_state;
pub mod sql_task;
pub mod state_machine;
pub mod task_info;
pub mod task_manager;
pub mod task_state;
