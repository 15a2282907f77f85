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
//! Task output sink: routes pages into the task's output buffer.
//!
//! Responsibilities:
//! - Hash partitions rows over the output buffer partitions with the cluster-wide seed.
//! - Sends whole pages to partition zero for single or broadcast output.
//! - Blocks on the output buffer's memory dependency while the buffer is full.
//!
//! Key exported interfaces:
//! - Types: `PartitionedOutputSinkFactory`.

use std::sync::Arc;

use crate::common::ids::PlanNodeId;
use crate::common::status::Result;
use crate::exec::hash::{HashPartitionFunction, REMOTE_PARTITION_SEED};
use crate::exec::page::Page;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::exec::plan::OutputPartitioning;
use crate::runtime::output_buffer::OutputBuffer;
use crate::runtime::runtime_state::RuntimeState;

pub struct PartitionedOutputSinkFactory {
    name: String,
    buffer: Arc<OutputBuffer>,
    partition_function: Option<HashPartitionFunction>,
}

impl PartitionedOutputSinkFactory {
    pub fn new(
        node_id: PlanNodeId,
        partitioning: &OutputPartitioning,
        buffer: Arc<OutputBuffer>,
    ) -> Result<Self> {
        let partition_function = match partitioning {
            OutputPartitioning::Hash { keys } => Some(HashPartitionFunction::new(
                buffer.buffer_count(),
                keys.clone(),
                REMOTE_PARTITION_SEED,
            )?),
            OutputPartitioning::Single | OutputPartitioning::Broadcast => None,
        };
        Ok(Self {
            name: format!("PARTITIONED_OUTPUT (id={node_id})"),
            buffer,
            partition_function,
        })
    }
}

impl OperatorFactory for PartitionedOutputSinkFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _dop: usize, _driver_index: usize) -> Box<dyn Operator> {
        Box::new(PartitionedOutputSinkOperator {
            name: self.name.clone(),
            buffer: Arc::clone(&self.buffer),
            partition_function: self.partition_function.clone(),
            rows_sent: 0,
            finished: false,
        })
    }

    fn is_sink(&self) -> bool {
        true
    }
}

struct PartitionedOutputSinkOperator {
    name: String,
    buffer: Arc<OutputBuffer>,
    partition_function: Option<HashPartitionFunction>,
    rows_sent: u64,
    finished: bool,
}

impl Operator for PartitionedOutputSinkOperator {
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

impl ProcessorOperator for PartitionedOutputSinkOperator {
    fn need_input(&self) -> bool {
        !self.finished
    }

    fn has_output(&self) -> bool {
        false
    }

    fn push_chunk(&mut self, _state: &RuntimeState, page: Page) -> Result<()> {
        if self.finished || page.is_empty() {
            return Ok(());
        }
        self.rows_sent += page.position_count() as u64;
        match self.partition_function.as_ref() {
            None => self.buffer.enqueue(0, vec![page]),
            Some(function) => {
                for (partition, part) in function.partition_page(&page)? {
                    self.buffer.enqueue(partition, vec![part])?;
                }
                Ok(())
            }
        }
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Page>> {
        Ok(None)
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        self.finished = true;
        Ok(())
    }

    fn precondition_dependency(&self) -> Option<DependencyHandle> {
        if self.finished {
            return None;
        }
        let dep = self.buffer.is_full();
        if dep.is_ready() { None } else { Some(dep) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::{QueryId, StageId, TaskId};
    use crate::exec::page::Block;
    use crate::runtime::output_buffer::OutputBuffers;
    use std::time::Duration;

    #[test]
    fn hash_output_splits_rows_across_buffers() {
        let buffer = OutputBuffer::new(
            TaskId::new(QueryId::local(), StageId(1), 0),
            "i",
            OutputBuffers::partitioned(2),
            1 << 20,
            None,
        );
        let factory = PartitionedOutputSinkFactory::new(
            PlanNodeId(9),
            &OutputPartitioning::Hash { keys: vec![0] },
            Arc::clone(&buffer),
        )
        .unwrap();
        let state = RuntimeState::default();
        let mut op = factory.create(1, 0);
        let sink = op.as_processor_mut().unwrap();
        sink.push_chunk(
            &state,
            Page::try_new(vec![Block::from_longs((0..100).collect())]).unwrap(),
        )
        .unwrap();
        sink.set_finishing(&state).unwrap();
        let mut total = 0;
        for id in 0..2 {
            let result = buffer.get(id, 0, u64::MAX, Duration::ZERO).unwrap();
            assert_eq!(result.pages.len(), 1);
            total += result.pages[0].position_count();
        }
        assert_eq!(total, 100);
        assert!(op.is_finished());
    }
}
