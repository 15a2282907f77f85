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
//! Table scan source operator.
//!
//! Responsibilities:
//! - Claims splits from the task's per-node split queue and reads them through the connector.
//! - Blocks on the split queue observable while no split is available and more may arrive.
//!
//! Key exported interfaces:
//! - Types: `TableScanSourceFactory`.

use std::sync::Arc;

use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, Result};
use crate::connector::{ConnectorRegistry, PageSource};
use crate::exec::page::{ColumnType, Page};
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::exec::pipeline::scan::split_queue::SplitQueueRef;
use crate::exec::pipeline::schedule::observer::Observable;
use crate::novaexec_logging::{debug, warn};
use crate::runtime::runtime_state::RuntimeState;
use crate::scheduler::split::ScheduledSplit;

pub struct TableScanSourceFactory {
    name: String,
    output_types: Vec<ColumnType>,
    queue: SplitQueueRef,
    connectors: Arc<ConnectorRegistry>,
}

impl TableScanSourceFactory {
    pub fn new(
        node_id: PlanNodeId,
        output_types: Vec<ColumnType>,
        queue: SplitQueueRef,
        connectors: Arc<ConnectorRegistry>,
    ) -> Self {
        Self {
            name: format!("TABLE_SCAN (id={node_id})"),
            output_types,
            queue,
            connectors,
        }
    }
}

impl OperatorFactory for TableScanSourceFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _dop: usize, _driver_index: usize) -> Box<dyn Operator> {
        Box::new(TableScanSourceOperator {
            name: self.name.clone(),
            output_types: self.output_types.clone(),
            queue: Arc::clone(&self.queue),
            connectors: Arc::clone(&self.connectors),
            current: None,
            splits_read: 0,
        })
    }

    fn is_source(&self) -> bool {
        true
    }
}

struct ActiveSplit {
    split: ScheduledSplit,
    source: Box<dyn PageSource>,
}

struct TableScanSourceOperator {
    name: String,
    output_types: Vec<ColumnType>,
    queue: SplitQueueRef,
    connectors: Arc<ConnectorRegistry>,
    current: Option<ActiveSplit>,
    splits_read: usize,
}

impl TableScanSourceOperator {
    fn open_next(&mut self, state: &RuntimeState) -> Result<bool> {
        let Some(split) = self.queue.try_get() else {
            return Ok(false);
        };
        if split.split.is_remote() {
            self.queue.split_finished();
            return Err(ExecError::invalid_plan(format!(
                "{} received a remote split",
                self.name
            )));
        }
        let provider = match self.connectors.get(&split.split.catalog) {
            Ok(provider) => provider,
            Err(err) => {
                self.queue.split_finished();
                return Err(err);
            }
        };
        let source =
            match provider.create_page_source(&split.split, &self.output_types, &state.options()) {
                Ok(source) => source,
                Err(err) => {
                    self.queue.split_finished();
                    return Err(err);
                }
            };
        self.current = Some(ActiveSplit { split, source });
        Ok(true)
    }

    fn finish_current(&mut self) -> Result<()> {
        let Some(mut active) = self.current.take() else {
            return Ok(());
        };
        self.queue.split_finished();
        self.splits_read += 1;
        debug!(
            "{} finished split seq={} bytes={}",
            self.name,
            active.split.sequence_id,
            active.source.completed_bytes()
        );
        active.source.close()
    }
}

impl Operator for TableScanSourceOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut active) = self.current.take() {
            self.queue.split_finished();
            active.source.close()?;
        }
        Ok(())
    }

    fn cancel(&mut self) {
        if let Err(err) = self.close() {
            warn!("{} close on cancel failed: {}", self.name, err);
        }
    }

    fn is_finished(&self) -> bool {
        self.current.is_none() && self.queue.is_drained()
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for TableScanSourceOperator {
    fn need_input(&self) -> bool {
        false
    }

    fn has_output(&self) -> bool {
        self.current.is_some() || self.queue.has_splits()
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _page: Page) -> Result<()> {
        Err(ExecError::internal("table scan operator does not accept input"))
    }

    fn pull_chunk(&mut self, state: &RuntimeState) -> Result<Option<Page>> {
        loop {
            if self.current.is_none() && !self.open_next(state)? {
                return Ok(None);
            }
            let Some(active) = self.current.as_mut() else {
                return Ok(None);
            };
            if let Some(page) = active.source.next_page()? {
                if !page.is_empty() {
                    return Ok(Some(page));
                }
                continue;
            }
            if active.source.is_finished() {
                self.finish_current()?;
                continue;
            }
            return Ok(None);
        }
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }

    fn source_observable(&self) -> Option<Arc<Observable>> {
        Some(self.queue.observable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::sequence;
    use crate::exec::pipeline::scan::split_queue::SplitQueue;

    #[test]
    fn reads_every_queued_split_then_finishes() {
        let queue = SplitQueue::new(PlanNodeId(0));
        let factory = TableScanSourceFactory::new(
            PlanNodeId(0),
            vec![ColumnType::Int64],
            Arc::clone(&queue),
            Arc::new(ConnectorRegistry::with_builtin()),
        );
        let state = RuntimeState::default();
        let mut op = factory.create(1, 0);
        assert!(!op.as_processor_ref().unwrap().has_output());
        assert!(!op.is_finished());
        queue.add_splits(
            sequence::splits(20, 10)
                .into_iter()
                .enumerate()
                .map(|(i, split)| ScheduledSplit {
                    sequence_id: i as u64,
                    plan_node_id: PlanNodeId(0),
                    split,
                })
                .collect(),
        );
        queue.no_more_splits();
        let mut rows = 0;
        while let Some(page) = op.as_processor_mut().unwrap().pull_chunk(&state).unwrap() {
            rows += page.position_count();
        }
        assert_eq!(rows, 20);
        assert!(op.is_finished());
        assert_eq!(queue.completed(), 2);
    }
}
