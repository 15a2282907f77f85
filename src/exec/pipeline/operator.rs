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
//! Operator contracts driven by `PipelineDriver`.
//!
//! A driver owns a chain of operators. Between two neighbours it moves at most one page per
//! step: `pull_chunk` on the upstream side, `push_chunk` on the downstream side, and it
//! re-checks `need_input`/`has_output` after every page. Operators never block a thread;
//! they report a `DependencyHandle` or an observable instead and the driver parks.

use std::sync::Arc;

use crate::common::status::Result;
use crate::exec::page::Page;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::exec::pipeline::schedule::observer::Observable;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::runtime_state::RuntimeState;

/// Why a driver stopped making progress in the current slice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockedReason {
    /// The first operator has nothing to emit yet.
    InputEmpty,
    /// The last operator refuses input.
    OutputFull,
    /// Memory, local exchange capacity or output buffer space.
    Dependency(DependencyHandle),
}

/// Lifecycle half of every operator.
pub trait Operator: Send {
    fn name(&self) -> &str;

    /// Called once before `prepare` with the operator's node in the task's tracker tree.
    fn set_mem_tracker(&mut self, _tracker: Arc<MemTracker>) {}

    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release resources; called exactly once, also after failures.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn cancel(&mut self) {}

    fn is_finished(&self) -> bool {
        false
    }

    /// Finished but still flushing side effects, e.g. a remote delete in flight.
    fn pending_finish(&self) -> bool {
        false
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        None
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        None
    }
}

/// Page flow half: `push_chunk` is addInput, `pull_chunk` is getOutput.
pub trait ProcessorOperator: Operator {
    fn need_input(&self) -> bool;

    fn has_output(&self) -> bool;

    /// Only called while `need_input()` holds.
    fn push_chunk(&mut self, state: &RuntimeState, page: Page) -> Result<()>;

    fn pull_chunk(&mut self, state: &RuntimeState) -> Result<Option<Page>>;

    /// Upstream is exhausted; no further `push_chunk` follows.
    fn set_finishing(&mut self, state: &RuntimeState) -> Result<()>;

    /// Unready while the operator must not be driven, e.g. waiting for memory.
    fn precondition_dependency(&self) -> Option<DependencyHandle> {
        None
    }

    /// Fires when `has_output` may have turned true.
    fn source_observable(&self) -> Option<Arc<Observable>> {
        None
    }

    /// Fires when `need_input` may have turned true.
    fn sink_observable(&self) -> Option<Arc<Observable>> {
        None
    }
}
