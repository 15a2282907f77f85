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
//! Local execution planner.
//!
//! Responsibilities:
//! - Lowers one plan fragment into pipelines of operator factories for a single task.
//! - Splits pipelines at local exchanges and inserts gather or hash exchanges in front of
//!   final aggregations so that parallel drivers never split a group.
//! - Allocates the per-node split queues and exchange clients the task feeds at runtime.
//!
//! Key exported interfaces:
//! - Types: `LocalExecutionPlanner`, `LocalExecutionPlan`.

use std::collections::HashMap;
use std::sync::Arc;

use super::operator_factory::OperatorFactory;
use super::pipeline::Pipeline;
use super::scan::split_queue::{SplitQueue, SplitQueueRef};
use crate::common::app_config::RuntimeConfig;
use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, Result};
use crate::connector::ConnectorRegistry;
use crate::exec::operators::{
    ExchangeSourceFactory, FilterProcessorFactory, HashAggregateFactory, LocalExchangeSinkFactory,
    LocalExchangeSourceFactory, LocalExchanger, PartitionedOutputSinkFactory,
    ProjectProcessorFactory, TableScanSourceFactory, ValuesSourceFactory,
};
use crate::exec::plan::{AggregationStep, LocalPartitioning, PlanFragment, PlanNode, PlanVisitor};
use crate::novaexec_logging::debug;
use crate::runtime::exchange_client::{ExchangeClient, ExchangeClientConfig, ExchangeTransport};
use crate::runtime::io::IoExecutor;
use crate::runtime::output_buffer::OutputBuffer;

/// Everything a task needs to run one fragment locally.
pub struct LocalExecutionPlan {
    pub pipelines: Vec<Pipeline>,
    /// Split queues of table scans and remote sources, keyed by plan node.
    pub split_queues: HashMap<PlanNodeId, SplitQueueRef>,
    pub exchange_clients: Vec<Arc<ExchangeClient>>,
}

impl LocalExecutionPlan {
    pub fn driver_count(&self) -> usize {
        self.pipelines.iter().map(Pipeline::dop).sum()
    }
}

#[derive(Clone)]
pub struct LocalExecutionPlanner {
    task_concurrency: usize,
    local_exchange_buffer_limit_per_driver: i64,
    connectors: Arc<ConnectorRegistry>,
    exchange_config: ExchangeClientConfig,
    exchange_transport: Arc<dyn ExchangeTransport>,
    io: Arc<IoExecutor>,
}

impl LocalExecutionPlanner {
    pub fn new(
        config: &RuntimeConfig,
        connectors: Arc<ConnectorRegistry>,
        exchange_transport: Arc<dyn ExchangeTransport>,
        io: Arc<IoExecutor>,
    ) -> Self {
        Self {
            task_concurrency: config.task_concurrency.max(1),
            local_exchange_buffer_limit_per_driver: config.local_exchange_buffer_mem_limit_per_driver
                as i64,
            connectors,
            exchange_config: ExchangeClientConfig::from(config),
            exchange_transport,
            io,
        }
    }

    pub fn with_task_concurrency(mut self, task_concurrency: usize) -> Self {
        self.task_concurrency = task_concurrency.max(1);
        self
    }

    pub fn plan(
        &self,
        fragment: &PlanFragment,
        output_buffer: Arc<OutputBuffer>,
    ) -> Result<LocalExecutionPlan> {
        let mut ctx = PlanningContext {
            planner: self,
            pipelines: Vec::new(),
            split_queues: HashMap::new(),
            exchange_clients: Vec::new(),
        };
        let mut root = fragment.root.accept(&mut ctx)?;
        root.factories.push(Box::new(PartitionedOutputSinkFactory::new(
            fragment.root.id(),
            &fragment.output_partitioning,
            output_buffer,
        )?));
        ctx.finish(root);
        debug!(
            "planned fragment {}: pipelines={} drivers={}",
            fragment.id,
            ctx.pipelines.len(),
            ctx.pipelines.iter().map(Pipeline::dop).sum::<usize>()
        );
        Ok(LocalExecutionPlan {
            pipelines: ctx.pipelines,
            split_queues: ctx.split_queues,
            exchange_clients: ctx.exchange_clients,
        })
    }
}

/// Operator chain under construction; becomes a pipeline once a sink is appended.
struct PhysicalOperation {
    factories: Vec<Box<dyn OperatorFactory>>,
    dop: usize,
}

struct PlanningContext<'a> {
    planner: &'a LocalExecutionPlanner,
    pipelines: Vec<Pipeline>,
    split_queues: HashMap<PlanNodeId, SplitQueueRef>,
    exchange_clients: Vec<Arc<ExchangeClient>>,
}

impl PlanningContext<'_> {
    fn finish(&mut self, operation: PhysicalOperation) {
        let id = self.pipelines.len() as u32;
        self.pipelines
            .push(Pipeline::new(id, operation.factories, operation.dop));
    }

    fn split_queue(&mut self, id: PlanNodeId) -> SplitQueueRef {
        Arc::clone(self.split_queues.entry(id).or_insert_with(|| SplitQueue::new(id)))
    }

    /// Terminate `inputs` with sinks into a new exchange and start a chain reading from it.
    fn local_exchange(
        &mut self,
        owner: PlanNodeId,
        partitioning: LocalPartitioning,
        inputs: Vec<PhysicalOperation>,
    ) -> Result<PhysicalOperation> {
        let partition_count = match partitioning {
            LocalPartitioning::Single => 1,
            _ => self.planner.task_concurrency,
        };
        let producer_count = inputs.iter().map(|op| op.dop).sum();
        let exchanger = LocalExchanger::new(
            &partitioning,
            partition_count,
            producer_count,
            self.planner.local_exchange_buffer_limit_per_driver,
        )?;
        for mut input in inputs {
            input.factories.push(Box::new(LocalExchangeSinkFactory::new(
                owner,
                Arc::clone(&exchanger),
            )));
            self.finish(input);
        }
        Ok(PhysicalOperation {
            factories: vec![Box::new(LocalExchangeSourceFactory::new(owner, exchanger))],
            dop: partition_count,
        })
    }

    fn single_child<'n>(node: &'n PlanNode) -> Result<&'n PlanNode> {
        node.children()
            .first()
            .copied()
            .ok_or_else(|| ExecError::invalid_plan(format!("{} without source", node.name())))
    }
}

impl PlanVisitor for PlanningContext<'_> {
    type Output = PhysicalOperation;

    fn visit_table_scan(&mut self, node: &PlanNode) -> Result<PhysicalOperation> {
        let PlanNode::TableScan { id, output_types, .. } = node else {
            return Err(ExecError::internal("visit_table_scan on another node"));
        };
        let queue = self.split_queue(*id);
        Ok(PhysicalOperation {
            factories: vec![Box::new(TableScanSourceFactory::new(
                *id,
                output_types.clone(),
                queue,
                Arc::clone(&self.planner.connectors),
            ))],
            dop: self.planner.task_concurrency,
        })
    }

    fn visit_values(&mut self, node: &PlanNode) -> Result<PhysicalOperation> {
        let PlanNode::Values {
            id,
            output_types,
            rows,
        } = node
        else {
            return Err(ExecError::internal("visit_values on another node"));
        };
        Ok(PhysicalOperation {
            factories: vec![Box::new(ValuesSourceFactory::new(
                *id,
                output_types.clone(),
                rows.clone(),
            ))],
            dop: 1,
        })
    }

    fn visit_filter(&mut self, node: &PlanNode) -> Result<PhysicalOperation> {
        let PlanNode::Filter { id, predicate, .. } = node else {
            return Err(ExecError::internal("visit_filter on another node"));
        };
        let mut op = Self::single_child(node)?.accept(self)?;
        op.factories
            .push(Box::new(FilterProcessorFactory::new(*id, predicate.clone())));
        Ok(op)
    }

    fn visit_project(&mut self, node: &PlanNode) -> Result<PhysicalOperation> {
        let PlanNode::Project { id, exprs, .. } = node else {
            return Err(ExecError::internal("visit_project on another node"));
        };
        let mut op = Self::single_child(node)?.accept(self)?;
        op.factories
            .push(Box::new(ProjectProcessorFactory::new(*id, exprs.clone())));
        Ok(op)
    }

    fn visit_aggregation(&mut self, node: &PlanNode) -> Result<PhysicalOperation> {
        let PlanNode::Aggregation {
            id,
            group_by,
            aggregates,
            step,
            ..
        } = node
        else {
            return Err(ExecError::internal("visit_aggregation on another node"));
        };
        let output_types = node.output_types()?;
        let mut op = Self::single_child(node)?.accept(self)?;
        if *step != AggregationStep::Partial && op.dop > 1 {
            let partitioning = if group_by.is_empty() {
                LocalPartitioning::Single
            } else {
                LocalPartitioning::Hash(group_by.clone())
            };
            op = self.local_exchange(*id, partitioning, vec![op])?;
        }
        op.factories.push(Box::new(HashAggregateFactory::new(
            *id,
            group_by.clone(),
            aggregates.clone(),
            *step,
            output_types,
        )));
        Ok(op)
    }

    fn visit_local_exchange(&mut self, node: &PlanNode) -> Result<PhysicalOperation> {
        let PlanNode::LocalExchange {
            id,
            sources,
            partitioning,
        } = node
        else {
            return Err(ExecError::internal("visit_local_exchange on another node"));
        };
        let inputs = sources
            .iter()
            .map(|source| source.accept(self))
            .collect::<Result<Vec<_>>>()?;
        self.local_exchange(*id, partitioning.clone(), inputs)
    }

    fn visit_remote_source(&mut self, node: &PlanNode) -> Result<PhysicalOperation> {
        let PlanNode::RemoteSource { id, .. } = node else {
            return Err(ExecError::internal("visit_remote_source on another node"));
        };
        let queue = self.split_queue(*id);
        let client = ExchangeClient::new(
            self.planner.exchange_config,
            Arc::clone(&self.planner.exchange_transport),
            Arc::clone(&self.planner.io),
        );
        self.exchange_clients.push(Arc::clone(&client));
        Ok(PhysicalOperation {
            factories: vec![Box::new(ExchangeSourceFactory::new(*id, queue, client))],
            dop: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::{QueryId, StageId, TaskId};
    use crate::exec::expr::{BinaryOp, Expr};
    use crate::exec::page::ColumnType;
    use crate::exec::plan::{Aggregate, OutputPartitioning, PartitioningHandle};
    use crate::runtime::output_buffer::{BufferResult, OutputBuffers};
    use crate::scheduler::split::TaskLocation;
    use std::time::Duration;

    struct NoTransport;

    impl ExchangeTransport for NoTransport {
        fn get_results(&self, _: &TaskLocation, _: u64, _: u64, _: Duration) -> Result<BufferResult> {
            Err(ExecError::internal("unused"))
        }

        fn acknowledge_results(&self, _: &TaskLocation, _: u64) -> Result<()> {
            Ok(())
        }

        fn abort_results(&self, _: &TaskLocation) -> Result<()> {
            Ok(())
        }
    }

    fn planner() -> LocalExecutionPlanner {
        LocalExecutionPlanner::new(
            &RuntimeConfig::default(),
            Arc::new(ConnectorRegistry::with_builtin()),
            Arc::new(NoTransport),
            Arc::new(IoExecutor::new(1)),
        )
        .with_task_concurrency(3)
    }

    fn buffer() -> Arc<OutputBuffer> {
        OutputBuffer::new(
            TaskId::new(QueryId::local(), StageId(0), 0),
            "i",
            OutputBuffers::single(),
            1 << 20,
            None,
        )
    }

    fn names(pipeline: &Pipeline) -> Vec<String> {
        pipeline
            .operator_names()
            .into_iter()
            .map(|n| n.split(' ').next().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn global_final_aggregation_gathers_parallel_scans() {
        let scan = PlanNode::TableScan {
            id: PlanNodeId(0),
            catalog: "sequence".to_string(),
            output_types: vec![ColumnType::Int64],
        };
        let filter = PlanNode::Filter {
            id: PlanNodeId(1),
            source: Box::new(scan),
            predicate: Expr::binary(BinaryOp::Gt, Expr::col(0), Expr::long(5)),
        };
        let agg = PlanNode::Aggregation {
            id: PlanNodeId(2),
            source: Box::new(filter),
            group_by: vec![],
            aggregates: vec![Aggregate::count_all()],
            step: AggregationStep::Single,
        };
        let fragment = PlanFragment::new(
            StageId(0),
            agg,
            PartitioningHandle::Source,
            OutputPartitioning::Single,
        )
        .unwrap();

        let plan = planner().plan(&fragment, buffer()).unwrap();
        assert_eq!(plan.pipelines.len(), 2);
        assert_eq!(plan.pipelines[0].dop(), 3);
        assert_eq!(
            names(&plan.pipelines[0]),
            vec!["TABLE_SCAN", "FILTER", "LOCAL_EXCHANGE_SINK"]
        );
        assert_eq!(plan.pipelines[1].dop(), 1);
        assert_eq!(
            names(&plan.pipelines[1]),
            vec!["LOCAL_EXCHANGE_SOURCE", "AGGREGATE_SINGLE", "PARTITIONED_OUTPUT"]
        );
        assert_eq!(plan.driver_count(), 4);
        assert!(plan.split_queues.contains_key(&PlanNodeId(0)));
    }

    #[test]
    fn remote_source_gets_queue_and_client() {
        let remote = PlanNode::RemoteSource {
            id: PlanNodeId(7),
            source_fragments: vec![StageId(1)],
            output_types: vec![ColumnType::Int64],
        };
        let fragment = PlanFragment::new(
            StageId(0),
            remote,
            PartitioningHandle::Single,
            OutputPartitioning::Single,
        )
        .unwrap();
        let plan = planner().plan(&fragment, buffer()).unwrap();
        assert_eq!(plan.pipelines.len(), 1);
        assert_eq!(
            names(&plan.pipelines[0]),
            vec!["EXCHANGE_SOURCE", "PARTITIONED_OUTPUT"]
        );
        assert_eq!(plan.exchange_clients.len(), 1);
        assert!(plan.split_queues.contains_key(&PlanNodeId(7)));
    }
}
