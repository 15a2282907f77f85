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
//! Exchange source operator.
//!
//! Responsibilities:
//! - Turns remote splits from the node's split queue into exchange client locations.
//! - Emits pages fetched by the task's `ExchangeClient` for one remote source node.
//!
//! Key exported interfaces:
//! - Types: `ExchangeSourceFactory`.

use std::sync::Arc;

use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, Result};
use crate::exec::page::Page;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::exec::pipeline::scan::split_queue::SplitQueueRef;
use crate::exec::pipeline::schedule::observer::Observable;
use crate::novaexec_logging::debug;
use crate::runtime::exchange_client::ExchangeClient;
use crate::runtime::runtime_state::RuntimeState;

pub struct ExchangeSourceFactory {
    name: String,
    queue: SplitQueueRef,
    client: Arc<ExchangeClient>,
}

impl ExchangeSourceFactory {
    pub fn new(node_id: PlanNodeId, queue: SplitQueueRef, client: Arc<ExchangeClient>) -> Self {
        // new locations must wake drivers parked on the client
        let observable = client.observable();
        queue
            .observable()
            .add_observer(Arc::new(move || observable.notify_observers()));
        Self {
            name: format!("EXCHANGE_SOURCE (id={node_id})"),
            queue,
            client,
        }
    }
}

impl OperatorFactory for ExchangeSourceFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _dop: usize, _driver_index: usize) -> Box<dyn Operator> {
        Box::new(ExchangeSourceOperator {
            name: self.name.clone(),
            queue: Arc::clone(&self.queue),
            client: Arc::clone(&self.client),
            pages_emitted: 0,
        })
    }

    fn is_source(&self) -> bool {
        true
    }
}

struct ExchangeSourceOperator {
    name: String,
    queue: SplitQueueRef,
    client: Arc<ExchangeClient>,
    pages_emitted: u64,
}

impl ExchangeSourceOperator {
    fn drain_locations(&self) -> Result<()> {
        while let Some(scheduled) = self.queue.try_get() {
            let location = scheduled.split.remote_location();
            self.queue.split_finished();
            let location = location.map_err(|err| {
                ExecError::invalid_plan(format!("{}: {}", self.name, err.message))
            })?;
            self.client.add_location(location)?;
        }
        if self.queue.is_drained() {
            self.client.no_more_locations();
        }
        Ok(())
    }
}

impl Operator for ExchangeSourceOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        debug!("{} closed after {} pages", self.name, self.pages_emitted);
        self.client.close();
        Ok(())
    }

    fn cancel(&mut self) {
        self.client.close();
    }

    fn is_finished(&self) -> bool {
        self.queue.is_drained() && self.client.is_finished()
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for ExchangeSourceOperator {
    fn need_input(&self) -> bool {
        false
    }

    fn has_output(&self) -> bool {
        self.queue.has_splits()
            || self.client.has_output()
            || (self.queue.is_drained() && !self.client.has_no_more_locations())
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _page: Page) -> Result<()> {
        Err(ExecError::internal("exchange source operator does not accept input"))
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Page>> {
        self.drain_locations()?;
        let page = self.client.poll_page()?;
        if page.is_some() {
            self.pages_emitted += 1;
        }
        Ok(page)
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }

    fn source_observable(&self) -> Option<Arc<Observable>> {
        Some(self.client.observable())
    }
}
