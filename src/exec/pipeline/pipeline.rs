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
//! Pipeline structure metadata.
//!
//! Responsibilities:
//! - Represents one pipeline with ordered operator factories and its driver count.
//! - Instantiates and prepares one operator chain per driver.
//!
//! Key exported interfaces:
//! - Types: `Pipeline`.

use std::sync::Arc;

use super::driver::{DriverContext, PipelineDriver};
use super::operator_factory::OperatorFactory;
use crate::common::status::{ExecError, Result};
use crate::novaexec_logging::debug;
use crate::runtime::runtime_state::RuntimeState;

/// One pipeline definition containing ordered operator factories.
pub struct Pipeline {
    id: u32,
    op_factories: Vec<Box<dyn OperatorFactory>>,
    dop: usize,
}

impl Pipeline {
    pub fn new(id: u32, op_factories: Vec<Box<dyn OperatorFactory>>, dop: usize) -> Self {
        Self {
            id,
            op_factories,
            dop: dop.max(1),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn dop(&self) -> usize {
        self.dop
    }

    pub fn operator_names(&self) -> Vec<&str> {
        self.op_factories.iter().map(|f| f.name()).collect()
    }

    pub fn instantiate_drivers(&self, state: &Arc<RuntimeState>) -> Result<Vec<PipelineDriver>> {
        let mut drivers = Vec::with_capacity(self.dop);
        debug!(
            "Pipeline drivers created: task={} pipeline_id={} dop={} operators={}",
            state.task_id(),
            self.id,
            self.dop,
            self.operator_names().join(" -> ")
        );
        for i in 0..self.dop {
            let mut operators = Vec::with_capacity(self.op_factories.len());
            let mut source_idx = None;
            let mut sink_idx = None;
            for (idx, factory) in self.op_factories.iter().enumerate() {
                if factory.is_source() {
                    if source_idx.is_some() {
                        return Err(ExecError::invalid_plan("pipeline has multiple source operators"));
                    }
                    source_idx = Some(idx);
                }
                if factory.is_sink() {
                    if sink_idx.is_some() {
                        return Err(ExecError::invalid_plan("pipeline has multiple sink operators"));
                    }
                    sink_idx = Some(idx);
                }
                let mut op = factory.create(self.dop, i);
                op.prepare()?;
                operators.push(op);
            }
            let source_idx = source_idx
                .ok_or_else(|| ExecError::invalid_plan("pipeline missing source operator"))?;
            let sink_idx =
                sink_idx.ok_or_else(|| ExecError::invalid_plan("pipeline missing sink operator"))?;
            if source_idx != 0 {
                return Err(ExecError::invalid_plan("pipeline source must be the first operator"));
            }
            if sink_idx + 1 != operators.len() {
                return Err(ExecError::invalid_plan("pipeline sink must be the last operator"));
            }
            let context = DriverContext::new(state.task_id().clone(), self.id, i);
            drivers.push(PipelineDriver::new(context, operators, Arc::clone(state)));
        }
        Ok(drivers)
    }
}
