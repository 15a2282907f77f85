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
//! Sink side of local in-process exchange.
//!
//! Responsibilities:
//! - Pushes pages into the local exchanger according to its partitioning policy.
//! - Blocks on the exchanger's write dependency while the buffer is over its budget.
//!
//! Key exported interfaces:
//! - Types: `LocalExchangeSinkFactory`.

use std::sync::Arc;

use crate::common::ids::PlanNodeId;
use crate::common::status::Result;
use crate::exec::operators::local_exchanger::LocalExchanger;
use crate::exec::page::Page;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::exec::pipeline::schedule::observer::Observable;
use crate::novaexec_logging::debug;
use crate::runtime::runtime_state::RuntimeState;

/// Factory for local-exchange sink operators that partition and enqueue pages locally.
pub struct LocalExchangeSinkFactory {
    name: String,
    exchanger: Arc<LocalExchanger>,
}

impl LocalExchangeSinkFactory {
    pub fn new(owner_node_id: PlanNodeId, exchanger: Arc<LocalExchanger>) -> Self {
        Self {
            name: format!("LOCAL_EXCHANGE_SINK (id={owner_node_id})"),
            exchanger,
        }
    }
}

impl OperatorFactory for LocalExchangeSinkFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _dop: usize, driver_index: usize) -> Box<dyn Operator> {
        Box::new(LocalExchangeSinkOperator {
            name: self.name.clone(),
            driver_index,
            exchanger: Arc::clone(&self.exchanger),
            finished: false,
        })
    }

    fn is_sink(&self) -> bool {
        true
    }
}

struct LocalExchangeSinkOperator {
    name: String,
    driver_index: usize,
    exchanger: Arc<LocalExchanger>,
    finished: bool,
}

impl LocalExchangeSinkOperator {
    fn finish_producer(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.exchanger.finish_producer() {
            let stats = self.exchanger.stats_snapshot();
            for part in stats.partitions {
                debug!(
                    "LocalExchange stats: exchange_id={} partition={} pushed_rows={} popped_rows={} pushed_pages={} popped_pages={} buffered_pages={}",
                    stats.exchange_id,
                    part.partition,
                    part.pushed_rows,
                    part.popped_rows,
                    part.pushed_pages,
                    part.popped_pages,
                    part.buffered_pages
                );
            }
        }
    }
}

impl Operator for LocalExchangeSinkOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        // a producer that never reached set_finishing (canceled driver) still has to retire
        self.finish_producer();
        Ok(())
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }

    fn is_finished(&self) -> bool {
        self.finished || self.exchanger.is_all_sources_finished()
    }
}

impl ProcessorOperator for LocalExchangeSinkOperator {
    fn need_input(&self) -> bool {
        !self.is_finished() && !self.exchanger.is_full()
    }

    fn has_output(&self) -> bool {
        false
    }

    fn push_chunk(&mut self, _state: &RuntimeState, page: Page) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.exchanger.accept(page)
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Page>> {
        Ok(None)
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        debug!(
            "LocalExchangeSink set_finishing: exchange_id={} driver_index={} remaining_producers={}",
            self.exchanger.exchange_id(),
            self.driver_index,
            self.exchanger.remaining_producers()
        );
        self.finish_producer();
        Ok(())
    }

    fn precondition_dependency(&self) -> Option<DependencyHandle> {
        if self.is_finished() {
            return None;
        }
        let dep = self.exchanger.wait_for_writing();
        if dep.is_ready() { None } else { Some(dep) }
    }

    fn sink_observable(&self) -> Option<Arc<Observable>> {
        if self.finished {
            return None;
        }
        Some(self.exchanger.sink_observable())
    }
}
