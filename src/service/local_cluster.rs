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
//! Multi-node cluster inside one process.
//!
//! Responsibilities:
//! - Starts N worker nodes, each a full `NodeContext`, connected through an
//!   `InProcessTransport`, plus the coordinator services scheduling against them.
//! - `QueryRunner` schedules a `SubPlan`, drains the root stage output and reports
//!   per-stage statistics.
//!
//! Key exported interfaces:
//! - Types: `LocalCluster`, `QueryRunner`, `QueryResult`, `StageStats`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::common::app_config::NovaExecConfig;
use crate::common::ids::{FragmentId, NodeId, QueryId, QueryIdGenerator, StageId};
use crate::common::status::{ErrorCode, ExecError, Result};
use crate::connector::ConnectorRegistry;
use crate::exec::page::{Page, PagesSerde};
use crate::exec::plan::SubPlan;
use crate::novaexec_logging::{info, warn};
use crate::runtime::exchange_client::{ExchangeClient, ExchangeClientConfig};
use crate::runtime::io::IoExecutor;
use crate::runtime::node_context::NodeContext;
use crate::scheduler::node_manager::{InternalNode, NodeAnnouncement, NodeManager, NodeState, StaticNodeDiscovery};
use crate::scheduler::query_scheduler::{QueryInfo, QueryScheduler, QueryState, SchedulerDeps};
use crate::scheduler::remote_task::{RemoteTaskClientFactory, RemoteTaskConfig};
use crate::scheduler::split_source::SplitSource;
use crate::scheduler::stage::StageState;
use crate::service::local_transport::InProcessTransport;

pub struct LocalCluster {
    config: NovaExecConfig,
    nodes: Vec<Arc<NodeContext>>,
    transport: Arc<InProcessTransport>,
    discovery: Arc<StaticNodeDiscovery>,
    node_manager: Arc<NodeManager>,
    io: Arc<IoExecutor>,
}

impl LocalCluster {
    /// `config.server.node_id` is replaced by `node-{i}` for each worker.
    pub fn new(node_count: usize, config: NovaExecConfig) -> Result<Self> {
        Self::with_connectors(node_count, config, ConnectorRegistry::with_builtin)
    }

    pub fn with_connectors(
        node_count: usize,
        config: NovaExecConfig,
        connectors: impl Fn() -> ConnectorRegistry,
    ) -> Result<Self> {
        if node_count == 0 {
            return Err(ExecError::new(
                ErrorCode::NoNodesAvailable,
                "a local cluster needs at least one node",
            ));
        }
        let transport =
            InProcessTransport::with_page_serde(PagesSerde::new(config.runtime.exchange_compression));
        let mut nodes = Vec::with_capacity(node_count);
        let mut announcements = Vec::with_capacity(node_count);
        for i in 0..node_count {
            let mut node_config = config.clone();
            node_config.server.node_id = format!("node-{}", i);
            let node = NodeContext::new(node_config, connectors(), transport.clone());
            transport.register(node.task_manager());
            announcements.push(NodeAnnouncement {
                node: InternalNode::new(node.node_id().clone(), format!("local://{}", node.node_id())),
                state: NodeState::Active,
            });
            nodes.push(node);
        }
        let discovery = Arc::new(StaticNodeDiscovery::new(announcements));
        let node_manager = NodeManager::new(discovery.clone(), config.scheduler.node_staleness());
        let io = Arc::new(IoExecutor::from_config(&config.runtime));
        info!("local cluster started with {} nodes", node_count);
        Ok(Self {
            config,
            nodes,
            transport,
            discovery,
            node_manager,
            io,
        })
    }

    pub fn config(&self) -> &NovaExecConfig {
        &self.config
    }

    pub fn nodes(&self) -> &[Arc<NodeContext>] {
        &self.nodes
    }

    pub fn node(&self, node_id: &NodeId) -> Option<&Arc<NodeContext>> {
        self.nodes.iter().find(|n| n.node_id() == node_id)
    }

    pub fn transport(&self) -> &Arc<InProcessTransport> {
        &self.transport
    }

    pub fn node_manager(&self) -> &Arc<NodeManager> {
        &self.node_manager
    }

    /// Take a node out of scheduling and make it unreachable.
    pub fn kill_node(&self, node_id: &NodeId) {
        warn!("local cluster: node {} killed", node_id);
        self.transport.set_unreachable(node_id, true);
        self.discovery.set_state(node_id, NodeState::Inactive);
        self.node_manager.refresh_nodes();
    }

    pub fn query_runner(&self) -> QueryRunner<'_> {
        QueryRunner {
            cluster: self,
            ids: QueryIdGenerator::new(),
        }
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            self.transport.unregister(node.node_id());
            node.shutdown();
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub stage_id: StageId,
    pub task_count: usize,
    pub input_rows: u64,
    pub output_rows: u64,
    /// Rows enqueued into the stage's output buffers, i.e. sent through the exchange.
    pub exchanged_rows: u64,
    pub exchanged_pages: u64,
}

#[derive(Debug)]
pub struct QueryResult {
    pub query_id: QueryId,
    pub pages: Vec<Page>,
    pub info: QueryInfo,
    pub stages: Vec<StageStats>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.pages.iter().map(|p| p.position_count()).sum()
    }

    pub fn stage(&self, stage_id: StageId) -> Option<&StageStats> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }
}

/// Coordinator entry point of a `LocalCluster`.
pub struct QueryRunner<'a> {
    cluster: &'a LocalCluster,
    ids: QueryIdGenerator,
}

impl QueryRunner<'_> {
    pub fn run(
        &self,
        plan: &SubPlan,
        split_sources: HashMap<FragmentId, Arc<dyn SplitSource>>,
        timeout: Duration,
    ) -> Result<QueryResult> {
        let query = self.schedule(plan, split_sources)?;
        let result = self.drain(&query, timeout);
        if result.is_err() {
            query.cancel();
        }
        let pages = result?;
        let state = query.wait_for_completion(timeout);
        match state {
            QueryState::Finished => {}
            QueryState::Failed => {
                return Err(query
                    .failure()
                    .unwrap_or_else(|| ExecError::internal("query failed without a reason")));
            }
            other => {
                query.cancel();
                return Err(ExecError::internal(format!(
                    "query {} did not finish in {:?}: {}",
                    query.query_id(),
                    timeout,
                    other
                )));
            }
        }
        Ok(QueryResult {
            query_id: query.query_id().clone(),
            pages,
            info: query.info(),
            stages: stage_stats(&query),
        })
    }

    /// Build and start a query without waiting for it.
    pub fn schedule(
        &self,
        plan: &SubPlan,
        split_sources: HashMap<FragmentId, Arc<dyn SplitSource>>,
    ) -> Result<Arc<QueryScheduler>> {
        let config = &self.cluster.config;
        let transport = self.cluster.transport.clone();
        let deps = SchedulerDeps {
            node_manager: Arc::clone(&self.cluster.node_manager),
            remote_task_factory: Arc::new(RemoteTaskClientFactory::new(
                transport,
                RemoteTaskConfig::from(&config.runtime),
            )),
            config: config.scheduler.clone(),
        };
        let query_id = self.ids.create_next_query_id();
        info!("scheduling query {}", query_id);
        let query = QueryScheduler::new(query_id, plan, split_sources, deps)?;
        query.start()?;
        Ok(query)
    }

    fn drain(&self, query: &Arc<QueryScheduler>, timeout: Duration) -> Result<Vec<Page>> {
        let cluster = self.cluster;
        let client = query.result_client(
            ExchangeClientConfig::from(&cluster.config.runtime),
            cluster.transport.clone(),
            Arc::clone(&cluster.io),
        )?;
        let result = read_all(query, &client, timeout);
        client.close();
        result
    }
}

struct Wakeup {
    woken: Mutex<bool>,
    cv: Condvar,
}

impl Wakeup {
    fn signal(&self) {
        *self.woken.lock().expect("wakeup lock") = true;
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) {
        let guard = self.woken.lock().expect("wakeup lock");
        let (mut guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |woken| !*woken)
            .unwrap_or_else(|e| e.into_inner());
        *guard = false;
    }
}

fn read_all(query: &Arc<QueryScheduler>, client: &Arc<ExchangeClient>, timeout: Duration) -> Result<Vec<Page>> {
    let start = Instant::now();
    let wakeup = Arc::new(Wakeup {
        woken: Mutex::new(false),
        cv: Condvar::new(),
    });
    {
        let wakeup = Arc::clone(&wakeup);
        client.observable().add_observer(Arc::new(move || wakeup.signal()));
    }
    let failed = Arc::new(AtomicBool::new(false));
    {
        let wakeup = Arc::clone(&wakeup);
        let failed = Arc::clone(&failed);
        query.add_state_change_listener(move |state| {
            if matches!(state, QueryState::Failed | QueryState::Canceled) {
                failed.store(true, Ordering::Release);
            }
            wakeup.signal();
        });
    }
    let mut pages = Vec::new();
    loop {
        if let Some(page) = client.poll_page()? {
            pages.push(page);
            continue;
        }
        if client.is_finished() {
            return Ok(pages);
        }
        if failed.load(Ordering::Acquire) || (query.state().is_done() && query.state() != QueryState::Finished) {
            return Err(query.failure().unwrap_or_else(|| {
                ExecError::new(ErrorCode::UserCanceled, format!("query {} canceled", query.query_id()))
            }));
        }
        let left = remaining(timeout, start.elapsed());
        if left.is_zero() {
            return Err(ExecError::internal(format!(
                "query {} produced no complete result in {:?}",
                query.query_id(),
                timeout
            )));
        }
        wakeup.wait(left.min(Duration::from_millis(50)));
    }
}

fn remaining(timeout: Duration, elapsed: Duration) -> Duration {
    timeout.saturating_sub(elapsed)
}

fn stage_stats(query: &QueryScheduler) -> Vec<StageStats> {
    let mut out = Vec::new();
    for stage in query.stages() {
        let mut stats = StageStats {
            stage_id: stage.stage_id(),
            task_count: stage.task_count(),
            ..StageStats::default()
        };
        if stage.state() != StageState::Finished {
            warn!("stage {} not finished while collecting stats", stage.stage_id());
        }
        for task in stage.tasks() {
            match task.fetch_task_info() {
                Ok(info) => {
                    stats.input_rows += info.stats.input_rows;
                    stats.output_rows += info.stats.output_rows;
                    if let Some(buffers) = info.output_buffers {
                        for partition in buffers.partitions {
                            stats.exchanged_rows += partition.rows_added;
                            stats.exchanged_pages += partition.pages_added;
                        }
                    }
                }
                Err(e) => warn!("task info of {} unavailable: {}", task.task_id(), e),
            }
        }
        out.push(stats);
    }
    out
}
