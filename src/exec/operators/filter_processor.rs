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
//! Predicate filter processor.
//!
//! Evaluates a boolean expression over each input page and keeps the rows where it is true
//! (nulls are dropped). Pages that filter down to zero rows are not forwarded.

use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, Result};
use crate::exec::expr::Expr;
use crate::exec::page::Page;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::runtime::runtime_state::RuntimeState;

/// Factory for predicate processors that apply row-level filter masks to input pages.
pub struct FilterProcessorFactory {
    name: String,
    predicate: Expr,
}

impl FilterProcessorFactory {
    pub fn new(node_id: PlanNodeId, predicate: Expr) -> Self {
        Self {
            name: format!("FILTER (id={node_id})"),
            predicate,
        }
    }
}

impl OperatorFactory for FilterProcessorFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _dop: usize, _driver_index: usize) -> Box<dyn Operator> {
        Box::new(FilterProcessorOperator {
            name: self.name.clone(),
            predicate: self.predicate.clone(),
            pending_output: None,
            finishing: false,
            finished: false,
        })
    }
}

struct FilterProcessorOperator {
    name: String,
    predicate: Expr,
    pending_output: Option<Page>,
    finishing: bool,
    finished: bool,
}

impl Operator for FilterProcessorOperator {
    fn name(&self) -> &str {
        &self.name
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

impl ProcessorOperator for FilterProcessorOperator {
    fn need_input(&self) -> bool {
        !self.finishing && !self.finished && self.pending_output.is_none()
    }

    fn has_output(&self) -> bool {
        self.pending_output.is_some()
    }

    fn push_chunk(&mut self, _state: &RuntimeState, page: Page) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if self.pending_output.is_some() {
            return Err(ExecError::internal(
                "filter received input while output buffer is full",
            ));
        }
        if page.is_empty() {
            return Ok(());
        }
        let mask = self.predicate.eval_predicate(&page)?;
        let filtered = page.filter(&mask)?;
        if !filtered.is_empty() {
            self.pending_output = Some(filtered);
        }
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Page>> {
        let out = self.pending_output.take();
        if self.finishing {
            self.finished = true;
        }
        Ok(out)
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        self.finishing = true;
        if self.pending_output.is_none() {
            self.finished = true;
        }
        Ok(())
    }
}
