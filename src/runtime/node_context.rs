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
//! Process-wide services of one node.
//!
//! Built once at startup and passed by reference to everything that needs it; there is no
//! ambient global state. Dropping the context (or calling `shutdown`) fails running tasks and
//! joins the executor threads.

use std::sync::Arc;
use std::time::Duration;

use crate::common::app_config::NovaExecConfig;
use crate::common::ids::NodeId;
use crate::connector::ConnectorRegistry;
use crate::exec::pipeline::builder::LocalExecutionPlanner;
use crate::exec::pipeline::driver_executor::DriverExecutor;
use crate::novaexec_logging::info;
use crate::runtime::exchange_client::ExchangeTransport;
use crate::runtime::io::IoExecutor;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::memory_pool::MemoryPool;
use crate::runtime::query_context::QueryContextManager;
use crate::runtime::runtime_state::ExecOptions;
use crate::runtime::sql_task::TaskRuntime;
use crate::runtime::task_manager::TaskManager;

const TASK_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

pub struct NodeContext {
    config: NovaExecConfig,
    node_id: NodeId,
    memory_pool: Arc<MemoryPool>,
    root_tracker: Arc<MemTracker>,
    query_contexts: Arc<QueryContextManager>,
    executor: Arc<DriverExecutor>,
    io: Arc<IoExecutor>,
    connectors: Arc<ConnectorRegistry>,
    task_manager: Arc<TaskManager>,
}

impl NodeContext {
    pub fn new(
        config: NovaExecConfig,
        connectors: ConnectorRegistry,
        exchange_transport: Arc<dyn ExchangeTransport>,
    ) -> Arc<Self> {
        let node_id = NodeId::new(config.server.node_id.clone());
        let memory_pool = Arc::new(MemoryPool::new(config.memory.max_node_memory_bytes));
        let root_tracker = MemTracker::new_root(format!("node_{}", node_id));
        let query_contexts = Arc::new(QueryContextManager::new(
            Arc::clone(&memory_pool),
            config.memory.max_query_memory_per_node_bytes,
            Arc::clone(&root_tracker),
        ));
        let executor = Arc::new(DriverExecutor::from_config(&config.runtime));
        let io = Arc::new(IoExecutor::from_config(&config.runtime));
        let connectors = Arc::new(connectors);
        let planner = LocalExecutionPlanner::new(
            &config.runtime,
            Arc::clone(&connectors),
            exchange_transport,
            Arc::clone(&io),
        );
        let runtime = TaskRuntime {
            executor: Arc::clone(&executor),
            planner,
            options: ExecOptions::from(&config.runtime),
            output_buffer_max_bytes: config.runtime.output_buffer_max_bytes as i64,
        };
        let task_manager = TaskManager::new(
            node_id.clone(),
            runtime,
            Arc::clone(&query_contexts),
            &config.runtime,
        );
        task_manager.start_maintenance(TASK_MAINTENANCE_INTERVAL);
        info!(
            "node {} ready: exec_threads={} memory_pool_bytes={} catalogs={:?}",
            node_id,
            config.runtime.actual_exec_threads(),
            config.memory.max_node_memory_bytes,
            connectors.catalogs()
        );
        Arc::new(Self {
            config,
            node_id,
            memory_pool,
            root_tracker,
            query_contexts,
            executor,
            io,
            connectors,
            task_manager,
        })
    }

    pub fn config(&self) -> &NovaExecConfig {
        &self.config
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn memory_pool(&self) -> &Arc<MemoryPool> {
        &self.memory_pool
    }

    pub fn root_tracker(&self) -> &Arc<MemTracker> {
        &self.root_tracker
    }

    pub fn query_contexts(&self) -> &Arc<QueryContextManager> {
        &self.query_contexts
    }

    pub fn executor(&self) -> &Arc<DriverExecutor> {
        &self.executor
    }

    pub fn io(&self) -> &Arc<IoExecutor> {
        &self.io
    }

    pub fn connectors(&self) -> &Arc<ConnectorRegistry> {
        &self.connectors
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.task_manager
    }

    pub fn shutdown(&self) {
        self.task_manager.shutdown();
        self.executor.shutdown();
        info!("node {} stopped", self.node_id);
    }
}

impl Drop for NodeContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
