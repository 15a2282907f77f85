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
//! Source side of local in-process exchange; driver `i` reads partition `i`.

use std::sync::Arc;

use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, Result};
use crate::exec::operators::local_exchanger::LocalExchanger;
use crate::exec::page::Page;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::exec::pipeline::schedule::observer::Observable;
use crate::runtime::runtime_state::RuntimeState;

/// Factory for local-exchange source operators that consume one exchange partition.
pub struct LocalExchangeSourceFactory {
    name: String,
    exchanger: Arc<LocalExchanger>,
}

impl LocalExchangeSourceFactory {
    pub fn new(owner_node_id: PlanNodeId, exchanger: Arc<LocalExchanger>) -> Self {
        Self {
            name: format!("LOCAL_EXCHANGE_SOURCE (id={owner_node_id})"),
            exchanger,
        }
    }
}

impl OperatorFactory for LocalExchangeSourceFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _dop: usize, driver_index: usize) -> Box<dyn Operator> {
        Box::new(LocalExchangeSourceOperator {
            name: self.name.clone(),
            partition: driver_index,
            exchanger: Arc::clone(&self.exchanger),
            closed: false,
        })
    }

    fn is_source(&self) -> bool {
        true
    }
}

struct LocalExchangeSourceOperator {
    name: String,
    partition: usize,
    exchanger: Arc<LocalExchanger>,
    closed: bool,
}

impl Operator for LocalExchangeSourceOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self) -> Result<()> {
        if self.partition >= self.exchanger.partition_count() {
            return Err(ExecError::invalid_plan(format!(
                "{}: driver {} has no partition among {}",
                self.name,
                self.partition,
                self.exchanger.partition_count()
            )));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.exchanger.finish_source();
        }
        Ok(())
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }

    fn is_finished(&self) -> bool {
        self.closed || self.exchanger.is_done(self.partition)
    }
}

impl ProcessorOperator for LocalExchangeSourceOperator {
    fn need_input(&self) -> bool {
        false
    }

    fn has_output(&self) -> bool {
        self.exchanger.has_pages(self.partition)
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _page: Page) -> Result<()> {
        Err(ExecError::internal(
            "local exchange source operator does not accept input",
        ))
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Page>> {
        Ok(self.exchanger.pop_page(self.partition))
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }

    fn source_observable(&self) -> Option<Arc<Observable>> {
        Some(self.exchanger.source_observable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::operators::local_exchange_sink::LocalExchangeSinkFactory;
    use crate::exec::page::Block;
    use crate::exec::plan::LocalPartitioning;

    #[test]
    fn local_exchange_forwards_pages() {
        let rt = RuntimeState::default();
        let exchanger = LocalExchanger::new(&LocalPartitioning::Single, 1, 1, 1 << 20).unwrap();
        let sink_factory = LocalExchangeSinkFactory::new(PlanNodeId(4), Arc::clone(&exchanger));
        let source_factory = LocalExchangeSourceFactory::new(PlanNodeId(4), Arc::clone(&exchanger));
        let mut sink = sink_factory.create(1, 0);
        let mut source = source_factory.create(1, 0);
        source.prepare().unwrap();

        for v in [1, 2] {
            sink.as_processor_mut()
                .expect("sink op")
                .push_chunk(&rt, Page::try_new(vec![Block::from_longs(vec![v])]).unwrap())
                .expect("push");
        }
        assert!(!source.is_finished());
        sink.as_processor_mut()
            .expect("sink op")
            .set_finishing(&rt)
            .expect("finish producer");

        let src = source.as_processor_mut().expect("source op");
        assert_eq!(
            src.pull_chunk(&rt).unwrap().unwrap().block(0).unwrap().get_long(0).unwrap(),
            1
        );
        assert_eq!(
            src.pull_chunk(&rt).unwrap().unwrap().block(0).unwrap().get_long(0).unwrap(),
            2
        );
        assert!(src.pull_chunk(&rt).unwrap().is_none());
        assert!(source.is_finished());
    }
}
