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
//! Projection processor: evaluates one expression per output channel.

use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, Result};
use crate::exec::expr::Expr;
use crate::exec::page::{Block, Page};
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::runtime::runtime_state::RuntimeState;

pub struct ProjectProcessorFactory {
    name: String,
    exprs: Vec<Expr>,
}

impl ProjectProcessorFactory {
    pub fn new(node_id: PlanNodeId, exprs: Vec<Expr>) -> Self {
        Self {
            name: format!("PROJECT (id={node_id})"),
            exprs,
        }
    }
}

impl OperatorFactory for ProjectProcessorFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _dop: usize, _driver_index: usize) -> Box<dyn Operator> {
        Box::new(ProjectProcessorOperator {
            name: self.name.clone(),
            exprs: self.exprs.clone(),
            pending_output: None,
            finishing: false,
            finished: false,
        })
    }
}

struct ProjectProcessorOperator {
    name: String,
    exprs: Vec<Expr>,
    pending_output: Option<Page>,
    finishing: bool,
    finished: bool,
}

impl ProjectProcessorOperator {
    fn project(&self, page: &Page) -> Result<Page> {
        // Pure column references reuse the input blocks without evaluation.
        let mut blocks = Vec::with_capacity(self.exprs.len());
        for expr in &self.exprs {
            let block = match expr {
                Expr::Column(channel) => page.block(*channel)?.clone(),
                other => Block::try_new(other.eval(page)?)?,
            };
            blocks.push(block);
        }
        Page::with_position_count(blocks, page.position_count())
    }
}

impl Operator for ProjectProcessorOperator {
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

impl ProcessorOperator for ProjectProcessorOperator {
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
                "project received input while output buffer is full",
            ));
        }
        if page.is_empty() {
            return Ok(());
        }
        self.pending_output = Some(self.project(&page)?);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::expr::BinaryOp;

    #[test]
    fn evaluates_arithmetic_and_passes_columns_through() {
        let exprs = vec![
            Expr::col(1),
            Expr::binary(BinaryOp::Multiply, Expr::col(0), Expr::long(10)),
        ];
        let factory = ProjectProcessorFactory::new(PlanNodeId(2), exprs);
        let state = RuntimeState::default();
        let mut op = factory.create(1, 0);
        let project = op.as_processor_mut().unwrap();
        let input = Page::try_new(vec![
            Block::from_longs(vec![1, 2]),
            Block::from_strings(&["a", "b"]),
        ])
        .unwrap();
        project.push_chunk(&state, input).unwrap();
        let out = project.pull_chunk(&state).unwrap().unwrap();
        assert_eq!(out.channel_count(), 2);
        assert_eq!(out.block(0).unwrap().get_string(1).unwrap(), "b");
        assert_eq!(out.block(1).unwrap().get_long(1).unwrap(), 20);
    }
}
