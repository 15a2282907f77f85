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
//! Physical plan model shipped to tasks.
//!
//! Responsibilities:
//! - Defines the closed set of plan nodes a fragment may contain and their output types.
//! - Describes fragment partitioning (how the fragment's tasks are laid out) and output
//!   partitioning (how the fragment's rows are routed to the consuming fragment).
//!
//! Key exported interfaces:
//! - Types: `PlanNode`, `PlanFragment`, `SubPlan`, `PartitioningHandle`, `OutputPartitioning`.
//! - Traits: `PlanVisitor`.

use serde::{Deserialize, Serialize};

use crate::common::ids::{FragmentId, PlanNodeId};
use crate::common::status::{ExecError, Result};
use crate::exec::expr::Expr;
use crate::exec::page::ColumnType;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum AggregateFunction {
    /// `count(*)`; takes no input channel.
    CountAll,
    Count,
    Sum,
    Min,
    Max,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub function: AggregateFunction,
    /// Input channel; `None` only for `CountAll`.
    pub input: Option<usize>,
}

impl Aggregate {
    pub fn count_all() -> Self {
        Self {
            function: AggregateFunction::CountAll,
            input: None,
        }
    }

    pub fn new(function: AggregateFunction, input: usize) -> Self {
        Self {
            function,
            input: Some(input),
        }
    }

    /// Type of the intermediate and final state for the given input types.
    pub fn output_type(&self, input: &[ColumnType]) -> Result<ColumnType> {
        match self.function {
            AggregateFunction::CountAll | AggregateFunction::Count => Ok(ColumnType::Int64),
            AggregateFunction::Sum | AggregateFunction::Min | AggregateFunction::Max => {
                let channel = self.input.ok_or_else(|| {
                    ExecError::invalid_plan(format!("{:?} requires an input channel", self.function))
                })?;
                let ty = input.get(channel).copied().ok_or_else(|| {
                    ExecError::invalid_plan(format!("aggregate input {} out of range", channel))
                })?;
                if self.function == AggregateFunction::Sum && !ty.is_numeric() {
                    return Err(ExecError::invalid_plan(format!("sum over {:?}", ty)));
                }
                Ok(ty)
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum AggregationStep {
    /// Consumes raw rows, emits intermediate states.
    Partial,
    /// Consumes intermediate states, emits final values.
    Final,
    Single,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalPartitioning {
    Single,
    Hash(Vec<usize>),
    RoundRobin,
    Broadcast,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PlanNode {
    TableScan {
        id: PlanNodeId,
        catalog: String,
        output_types: Vec<ColumnType>,
    },
    Values {
        id: PlanNodeId,
        output_types: Vec<ColumnType>,
        rows: Vec<Vec<crate::exec::page::Value>>,
    },
    Filter {
        id: PlanNodeId,
        source: Box<PlanNode>,
        predicate: Expr,
    },
    Project {
        id: PlanNodeId,
        source: Box<PlanNode>,
        exprs: Vec<Expr>,
    },
    Aggregation {
        id: PlanNodeId,
        source: Box<PlanNode>,
        group_by: Vec<usize>,
        aggregates: Vec<Aggregate>,
        step: AggregationStep,
    },
    LocalExchange {
        id: PlanNodeId,
        sources: Vec<PlanNode>,
        partitioning: LocalPartitioning,
    },
    RemoteSource {
        id: PlanNodeId,
        source_fragments: Vec<FragmentId>,
        output_types: Vec<ColumnType>,
    },
}

/// Exhaustive dispatch over plan node variants.
pub trait PlanVisitor {
    type Output;

    fn visit_table_scan(&mut self, node: &PlanNode) -> Result<Self::Output>;
    fn visit_values(&mut self, node: &PlanNode) -> Result<Self::Output>;
    fn visit_filter(&mut self, node: &PlanNode) -> Result<Self::Output>;
    fn visit_project(&mut self, node: &PlanNode) -> Result<Self::Output>;
    fn visit_aggregation(&mut self, node: &PlanNode) -> Result<Self::Output>;
    fn visit_local_exchange(&mut self, node: &PlanNode) -> Result<Self::Output>;
    fn visit_remote_source(&mut self, node: &PlanNode) -> Result<Self::Output>;
}

impl PlanNode {
    pub fn id(&self) -> PlanNodeId {
        match self {
            PlanNode::TableScan { id, .. }
            | PlanNode::Values { id, .. }
            | PlanNode::Filter { id, .. }
            | PlanNode::Project { id, .. }
            | PlanNode::Aggregation { id, .. }
            | PlanNode::LocalExchange { id, .. }
            | PlanNode::RemoteSource { id, .. } => *id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PlanNode::TableScan { .. } => "TableScan",
            PlanNode::Values { .. } => "Values",
            PlanNode::Filter { .. } => "Filter",
            PlanNode::Project { .. } => "Project",
            PlanNode::Aggregation { .. } => "Aggregation",
            PlanNode::LocalExchange { .. } => "LocalExchange",
            PlanNode::RemoteSource { .. } => "RemoteSource",
        }
    }

    pub fn accept<V: PlanVisitor>(&self, visitor: &mut V) -> Result<V::Output> {
        match self {
            PlanNode::TableScan { .. } => visitor.visit_table_scan(self),
            PlanNode::Values { .. } => visitor.visit_values(self),
            PlanNode::Filter { .. } => visitor.visit_filter(self),
            PlanNode::Project { .. } => visitor.visit_project(self),
            PlanNode::Aggregation { .. } => visitor.visit_aggregation(self),
            PlanNode::LocalExchange { .. } => visitor.visit_local_exchange(self),
            PlanNode::RemoteSource { .. } => visitor.visit_remote_source(self),
        }
    }

    pub fn children(&self) -> Vec<&PlanNode> {
        match self {
            PlanNode::TableScan { .. } | PlanNode::Values { .. } | PlanNode::RemoteSource { .. } => {
                Vec::new()
            }
            PlanNode::Filter { source, .. }
            | PlanNode::Project { source, .. }
            | PlanNode::Aggregation { source, .. } => vec![source.as_ref()],
            PlanNode::LocalExchange { sources, .. } => sources.iter().collect(),
        }
    }

    pub fn output_types(&self) -> Result<Vec<ColumnType>> {
        match self {
            PlanNode::TableScan { output_types, .. }
            | PlanNode::Values { output_types, .. }
            | PlanNode::RemoteSource { output_types, .. } => Ok(output_types.clone()),
            PlanNode::Filter {
                source, predicate, ..
            } => {
                let input = source.output_types()?;
                let ty = predicate.data_type(&input)?;
                if ty != ColumnType::Boolean {
                    return Err(ExecError::invalid_plan(format!(
                        "filter predicate must be boolean, got {:?}",
                        ty
                    )));
                }
                Ok(input)
            }
            PlanNode::Project { source, exprs, .. } => {
                let input = source.output_types()?;
                exprs.iter().map(|e| e.data_type(&input)).collect()
            }
            PlanNode::Aggregation {
                source,
                group_by,
                aggregates,
                step,
                ..
            } => {
                let input = source.output_types()?;
                let mut out = Vec::with_capacity(group_by.len() + aggregates.len());
                for key in group_by {
                    out.push(input.get(*key).copied().ok_or_else(|| {
                        ExecError::invalid_plan(format!("group key {} out of range", key))
                    })?);
                }
                for (idx, agg) in aggregates.iter().enumerate() {
                    let ty = match step {
                        // Final input is `keys ++ states`; states are addressed by position.
                        AggregationStep::Final => {
                            let channel = group_by.len() + idx;
                            input.get(channel).copied().ok_or_else(|| {
                                ExecError::invalid_plan(format!(
                                    "aggregate state {} out of range",
                                    channel
                                ))
                            })?
                        }
                        _ => agg.output_type(&input)?,
                    };
                    out.push(ty);
                }
                Ok(out)
            }
            PlanNode::LocalExchange { sources, .. } => {
                let Some(first) = sources.first() else {
                    return Err(ExecError::invalid_plan("local exchange without sources"));
                };
                let types = first.output_types()?;
                for other in &sources[1..] {
                    if other.output_types()? != types {
                        return Err(ExecError::invalid_plan(
                            "local exchange sources disagree on output types",
                        ));
                    }
                }
                Ok(types)
            }
        }
    }

    /// Pre-order walk collecting every node id; used to validate uniqueness.
    pub fn collect_ids(&self, out: &mut Vec<PlanNodeId>) {
        out.push(self.id());
        for child in self.children() {
            child.collect_ids(out);
        }
    }

    /// Ids of the scan nodes that take splits from the scheduler.
    pub fn partitioned_sources(&self) -> Vec<PlanNodeId> {
        let mut out = Vec::new();
        self.walk(&mut |node| {
            if matches!(node, PlanNode::TableScan { .. }) {
                out.push(node.id());
            }
        });
        out
    }

    /// Remote source nodes with the fragments they read from.
    pub fn remote_sources(&self) -> Vec<(PlanNodeId, Vec<FragmentId>)> {
        let mut out = Vec::new();
        self.walk(&mut |node| {
            if let PlanNode::RemoteSource {
                id,
                source_fragments,
                ..
            } = node
            {
                out.push((*id, source_fragments.clone()));
            }
        });
        out
    }

    fn walk(&self, f: &mut dyn FnMut(&PlanNode)) {
        f(self);
        for child in self.children() {
            child.walk(f);
        }
    }
}

/// How a fragment's tasks are laid out across the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitioningHandle {
    /// One task, e.g. the root or a final gather.
    Single,
    /// Tasks follow the placement of source splits.
    Source,
    /// A fixed number of hash partitions, one task each.
    Hash { partition_count: usize },
    /// Splits carry bucket ids; buckets are pinned to nodes.
    FixedBucket { bucket_count: usize },
}

/// How a fragment's output rows are routed to its consumer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputPartitioning {
    Single,
    Hash { keys: Vec<usize> },
    Broadcast,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanFragment {
    pub id: FragmentId,
    pub root: PlanNode,
    pub partitioning: PartitioningHandle,
    pub output_partitioning: OutputPartitioning,
    pub output_types: Vec<ColumnType>,
}

impl PlanFragment {
    pub fn new(
        id: FragmentId,
        root: PlanNode,
        partitioning: PartitioningHandle,
        output_partitioning: OutputPartitioning,
    ) -> Result<Self> {
        let output_types = root.output_types()?;
        let fragment = Self {
            id,
            root,
            partitioning,
            output_partitioning,
            output_types,
        };
        fragment.validate()?;
        Ok(fragment)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = Vec::new();
        self.root.collect_ids(&mut ids);
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != ids.len() {
            return Err(ExecError::invalid_plan(format!(
                "fragment {} has duplicate plan node ids",
                self.id
            )));
        }
        if let OutputPartitioning::Hash { keys } = &self.output_partitioning {
            if keys.iter().any(|k| *k >= self.output_types.len()) {
                return Err(ExecError::invalid_plan(format!(
                    "fragment {} output hash key out of range",
                    self.id
                )));
            }
        }
        let has_scan = !self.root.partitioned_sources().is_empty();
        if matches!(self.partitioning, PartitioningHandle::Source) && !has_scan {
            return Err(ExecError::invalid_plan(format!(
                "fragment {} is source partitioned but has no table scan",
                self.id
            )));
        }
        Ok(())
    }
}

/// Fragment tree; children produce the inputs of the fragment's remote sources.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubPlan {
    pub fragment: PlanFragment,
    pub children: Vec<SubPlan>,
}

impl SubPlan {
    pub fn leaf(fragment: PlanFragment) -> Self {
        Self {
            fragment,
            children: Vec::new(),
        }
    }

    pub fn new(fragment: PlanFragment, children: Vec<SubPlan>) -> Self {
        Self { fragment, children }
    }

    /// All fragments, parents before children.
    pub fn all_fragments(&self) -> Vec<&PlanFragment> {
        let mut out = vec![&self.fragment];
        for child in &self.children {
            out.extend(child.all_fragments());
        }
        out
    }
}
