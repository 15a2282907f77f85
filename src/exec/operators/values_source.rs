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
//! VALUES source operator.
//!
//! Responsibilities:
//! - Produces literal rows from VALUES plan nodes as source pages.
//! - Acts as a finite source; each driver emits its contiguous slice of the rows once.
//!
//! Key exported interfaces:
//! - Types: `ValuesSourceFactory`.

use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, Result};
use crate::exec::page::{ColumnType, Page, PageBuilder, Value};
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::runtime::runtime_state::RuntimeState;

/// Factory for VALUES source operators that emit literal plan rows.
pub struct ValuesSourceFactory {
    name: String,
    types: Vec<ColumnType>,
    rows: Vec<Vec<Value>>,
}

impl ValuesSourceFactory {
    pub fn new(node_id: PlanNodeId, types: Vec<ColumnType>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            name: format!("ValuesSource (id={node_id})"),
            types,
            rows,
        }
    }
}

impl OperatorFactory for ValuesSourceFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, dop: usize, driver_index: usize) -> Box<dyn Operator> {
        let dop = dop.max(1);
        let len = self.rows.len();
        let (start, end) = if driver_index >= dop {
            (0, 0)
        } else {
            ((len * driver_index) / dop, (len * (driver_index + 1)) / dop)
        };
        Box::new(ValuesSourceOperator {
            name: self.name.clone(),
            types: self.types.clone(),
            rows: self.rows[start..end].to_vec(),
            emitted: false,
        })
    }

    fn is_source(&self) -> bool {
        true
    }
}

struct ValuesSourceOperator {
    name: String,
    types: Vec<ColumnType>,
    rows: Vec<Vec<Value>>,
    emitted: bool,
}

impl Operator for ValuesSourceOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }

    fn is_finished(&self) -> bool {
        self.emitted
    }
}

impl ProcessorOperator for ValuesSourceOperator {
    fn need_input(&self) -> bool {
        false
    }

    fn has_output(&self) -> bool {
        !self.is_finished()
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _page: Page) -> Result<()> {
        Err(ExecError::internal("values source operator does not accept input"))
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Page>> {
        if self.emitted {
            return Ok(None);
        }
        self.emitted = true;
        if self.rows.is_empty() {
            return Ok(None);
        }
        // Literal rows are emitted as a single page regardless of the builder thresholds.
        let mut builder = PageBuilder::new(self.types.clone(), usize::MAX, usize::MAX);
        for row in std::mem::take(&mut self.rows) {
            builder.append_row(&row)?;
        }
        Ok(Some(builder.build()?))
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_split_across_drivers() {
        let rows: Vec<Vec<Value>> = (0..5).map(|v| vec![Value::Int64(v)]).collect();
        let factory = ValuesSourceFactory::new(PlanNodeId(3), vec![ColumnType::Int64], rows);
        let state = RuntimeState::default();
        let mut total = 0;
        for driver in 0..2 {
            let mut op = factory.create(2, driver);
            let source = op.as_processor_mut().unwrap();
            let page = source.pull_chunk(&state).unwrap().unwrap();
            total += page.position_count();
            assert!(source.pull_chunk(&state).unwrap().is_none());
        }
        assert_eq!(total, 5);
        assert_eq!(factory.name(), "ValuesSource (id=3)");
    }
}
