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
//! Hash aggregation operator.
//!
//! Responsibilities:
//! - Groups rows by key channels and folds `count`, `sum`, `min` and `max` accumulators.
//! - Supports split aggregation: `Partial` emits intermediate states, `Final` merges states
//!   laid out as `keys ++ states`, `Single` does both in one operator.
//! - Accounts the hash table size against the query memory context and blocks on the node
//!   pool while it is over-committed.
//!
//! Key exported interfaces:
//! - Types: `HashAggregateFactory`.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, Result};
use crate::exec::page::{ColumnType, Page, PageBuilder, Value};
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::exec::plan::{Aggregate, AggregateFunction, AggregationStep};
use crate::novaexec_logging::debug;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::query_context::LocalMemoryContext;
use crate::runtime::runtime_state::RuntimeState;

/// Fixed per-group bookkeeping charged on top of the key and accumulator widths.
const GROUP_OVERHEAD_BYTES: usize = 48;
const ACCUMULATOR_BYTES: usize = 16;

pub struct HashAggregateFactory {
    name: String,
    group_by: Vec<usize>,
    aggregates: Vec<Aggregate>,
    step: AggregationStep,
    output_types: Vec<ColumnType>,
}

impl HashAggregateFactory {
    pub fn new(
        node_id: PlanNodeId,
        group_by: Vec<usize>,
        aggregates: Vec<Aggregate>,
        step: AggregationStep,
        output_types: Vec<ColumnType>,
    ) -> Self {
        let step_name = match step {
            AggregationStep::Partial => "PARTIAL",
            AggregationStep::Final => "FINAL",
            AggregationStep::Single => "SINGLE",
        };
        Self {
            name: format!("AGGREGATE_{step_name} (id={node_id})"),
            group_by,
            aggregates,
            step,
            output_types,
        }
    }
}

impl OperatorFactory for HashAggregateFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _dop: usize, _driver_index: usize) -> Box<dyn Operator> {
        Box::new(HashAggregateOperator {
            name: self.name.clone(),
            group_by: self.group_by.clone(),
            aggregates: self.aggregates.clone(),
            step: self.step,
            output_types: self.output_types.clone(),
            groups: HashMap::new(),
            keys: Vec::new(),
            states: Vec::new(),
            estimated_bytes: 0,
            memory: None,
            tracker: None,
            blocked: None,
            output: VecDeque::new(),
            finishing: false,
            finished: false,
        })
    }
}

#[derive(Clone, Debug)]
enum Accumulator {
    Count(i64),
    Sum(Value),
    Min(Value),
    Max(Value),
}

impl Accumulator {
    fn new(function: AggregateFunction) -> Self {
        match function {
            AggregateFunction::CountAll | AggregateFunction::Count => Accumulator::Count(0),
            AggregateFunction::Sum => Accumulator::Sum(Value::Null),
            AggregateFunction::Min => Accumulator::Min(Value::Null),
            AggregateFunction::Max => Accumulator::Max(Value::Null),
        }
    }

    /// Fold one raw input value; `None` stands for `count(*)` which has no input.
    fn add_raw(&mut self, value: Option<Value>) -> Result<()> {
        match (self, value) {
            (Accumulator::Count(n), None) => *n += 1,
            (Accumulator::Count(n), Some(v)) => {
                if !v.is_null() {
                    *n += 1;
                }
            }
            (acc, Some(v)) => acc.merge_value(v)?,
            (_, None) => return Err(ExecError::internal("aggregate input channel missing")),
        }
        Ok(())
    }

    /// Fold one intermediate state.
    fn add_state(&mut self, state: Value) -> Result<()> {
        match self {
            Accumulator::Count(n) => {
                if let Some(partial) = state.as_i64() {
                    *n += partial;
                }
                Ok(())
            }
            acc => acc.merge_value(state),
        }
    }

    fn merge_value(&mut self, value: Value) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        match self {
            Accumulator::Count(_) => {}
            Accumulator::Sum(current) => *current = add_values(current, &value)?,
            Accumulator::Min(current) => {
                if current.is_null() || compare_values(&value, current)? == Ordering::Less {
                    *current = value;
                }
            }
            Accumulator::Max(current) => {
                if current.is_null() || compare_values(&value, current)? == Ordering::Greater {
                    *current = value;
                }
            }
        }
        Ok(())
    }

    fn result(&self) -> Value {
        match self {
            Accumulator::Count(n) => Value::Int64(*n),
            Accumulator::Sum(v) | Accumulator::Min(v) | Accumulator::Max(v) => v.clone(),
        }
    }
}

fn add_values(current: &Value, value: &Value) -> Result<Value> {
    match (current, value) {
        (Value::Null, v) => Ok(v.clone()),
        (Value::Int64(a), Value::Int64(b)) => a
            .checked_add(*b)
            .map(Value::Int64)
            .ok_or_else(|| ExecError::internal("bigint sum overflow")),
        (Value::Float64(a), Value::Float64(b)) => Ok(Value::Float64(a + b)),
        (a, b) => Err(ExecError::internal(format!("cannot sum {} and {}", a, b))),
    }
}

fn compare_values(a: &Value, b: &Value) -> Result<Ordering> {
    let ordering = match (a, b) {
        (Value::Boolean(x), Value::Boolean(y)) => Some(x.cmp(y)),
        (Value::Int64(x), Value::Int64(y)) => Some(x.cmp(y)),
        (Value::Float64(x), Value::Float64(y)) => Some(x.total_cmp(y)),
        (Value::Utf8(x), Value::Utf8(y)) => Some(x.cmp(y)),
        _ => None,
    };
    ordering.ok_or_else(|| ExecError::internal(format!("cannot compare {} and {}", a, b)))
}

fn value_width(value: &Value) -> usize {
    match value {
        Value::Utf8(s) => 24 + s.len(),
        _ => 8,
    }
}

struct HashAggregateOperator {
    name: String,
    group_by: Vec<usize>,
    aggregates: Vec<Aggregate>,
    step: AggregationStep,
    output_types: Vec<ColumnType>,
    groups: HashMap<Vec<Value>, usize>,
    keys: Vec<Vec<Value>>,
    states: Vec<Vec<Accumulator>>,
    estimated_bytes: usize,
    memory: Option<LocalMemoryContext>,
    tracker: Option<Arc<MemTracker>>,
    blocked: Option<DependencyHandle>,
    output: VecDeque<Page>,
    finishing: bool,
    finished: bool,
}

impl HashAggregateOperator {
    fn group_index(&mut self, key: Vec<Value>) -> usize {
        if let Some(idx) = self.groups.get(&key) {
            return *idx;
        }
        let idx = self.keys.len();
        self.estimated_bytes += GROUP_OVERHEAD_BYTES
            + key.iter().map(value_width).sum::<usize>()
            + ACCUMULATOR_BYTES * self.aggregates.len();
        self.states.push(
            self.aggregates
                .iter()
                .map(|agg| Accumulator::new(agg.function))
                .collect(),
        );
        self.keys.push(key.clone());
        self.groups.insert(key, idx);
        idx
    }

    fn fold_page(&mut self, page: &Page) -> Result<()> {
        let key_count = self.group_by.len();
        for position in 0..page.position_count() {
            let mut key = Vec::with_capacity(key_count);
            for channel in &self.group_by {
                key.push(page.block(*channel)?.get_value(position)?);
            }
            let idx = self.group_index(key);
            for agg_idx in 0..self.aggregates.len() {
                let agg = &self.aggregates[agg_idx];
                match self.step {
                    AggregationStep::Final => {
                        let state = page.block(key_count + agg_idx)?.get_value(position)?;
                        self.states[idx][agg_idx].add_state(state)?;
                    }
                    AggregationStep::Partial | AggregationStep::Single => {
                        let value = match agg.input {
                            Some(channel) => Some(page.block(channel)?.get_value(position)?),
                            None => None,
                        };
                        self.states[idx][agg_idx].add_raw(value)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn update_memory(&mut self, state: &RuntimeState) -> Result<()> {
        if self.memory.is_none()
            && let Some(query) = state.query_context()
        {
            let mut ctx = query.new_local_memory_context(self.name.clone());
            if let Some(tracker) = self.tracker.as_ref() {
                ctx.set_tracker(Arc::clone(tracker));
            }
            self.memory = Some(ctx);
        }
        if let Some(memory) = self.memory.as_mut() {
            let dep = memory.set_bytes(self.estimated_bytes as i64)?;
            self.blocked = if dep.is_ready() { None } else { Some(dep) };
        }
        Ok(())
    }

    fn build_output(&mut self, state: &RuntimeState) -> Result<()> {
        // A global aggregation produces one row even without input.
        if self.group_by.is_empty() && self.keys.is_empty() {
            self.group_index(Vec::new());
        }
        let mut builder = PageBuilder::new(
            self.output_types.clone(),
            state.page_target_bytes(),
            state.page_target_rows(),
        );
        let keys = std::mem::take(&mut self.keys);
        let states = std::mem::take(&mut self.states);
        for (key, accumulators) in keys.into_iter().zip(states) {
            let mut row = key;
            row.extend(accumulators.iter().map(Accumulator::result));
            builder.append_row(&row)?;
            if builder.is_full() {
                self.output.push_back(builder.build()?);
            }
        }
        if !builder.is_empty() {
            self.output.push_back(builder.build()?);
        }
        debug!(
            "{} produced {} pages from {} groups",
            self.name,
            self.output.len(),
            self.groups.len()
        );
        self.groups.clear();
        self.estimated_bytes = 0;
        self.blocked = None;
        if let Some(memory) = self.memory.as_mut() {
            memory.set_bytes(0)?;
        }
        Ok(())
    }
}

impl Operator for HashAggregateOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        self.tracker = Some(tracker);
    }

    fn close(&mut self) -> Result<()> {
        self.groups.clear();
        self.keys.clear();
        self.states.clear();
        self.output.clear();
        if let Some(mut memory) = self.memory.take() {
            memory.close();
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for HashAggregateOperator {
    fn need_input(&self) -> bool {
        !self.finishing && !self.finished
    }

    fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    fn push_chunk(&mut self, state: &RuntimeState, page: Page) -> Result<()> {
        if self.finishing {
            return Err(ExecError::internal(format!(
                "{} received input after finishing",
                self.name
            )));
        }
        if page.is_empty() {
            return Ok(());
        }
        self.fold_page(&page)?;
        self.update_memory(state)
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Page>> {
        let out = self.output.pop_front();
        if self.finishing && self.output.is_empty() {
            self.finished = true;
        }
        Ok(out)
    }

    fn set_finishing(&mut self, state: &RuntimeState) -> Result<()> {
        if self.finishing {
            return Ok(());
        }
        self.finishing = true;
        self.build_output(state)?;
        if self.output.is_empty() {
            self.finished = true;
        }
        Ok(())
    }

    fn precondition_dependency(&self) -> Option<DependencyHandle> {
        self.blocked.as_ref().filter(|dep| !dep.is_ready()).cloned()
    }
}
