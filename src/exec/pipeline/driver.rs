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
//! Pipeline driver execution loop.
//!
//! Responsibilities:
//! - Runs source/processor/sink operators with cooperative scheduling semantics.
//! - Tracks driver state transitions, blocking reasons, and the per-slice yield signal.
//!
//! Key exported interfaces:
//! - Types: `DriverState`, `YieldSignal`, `DriverContext`, `PipelineDriver`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::operator::{BlockedReason, Operator};
use crate::common::ids::TaskId;
use crate::common::status::{ExecError, Result};
use crate::exec::page::Page;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::exec::pipeline::schedule::observer::Observable;
use crate::novaexec_logging::{debug, error};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::{DriverStats, duration_nanos};
use crate::runtime::runtime_state::RuntimeState;

#[derive(Clone, Debug, PartialEq, Eq)]
/// Runtime state for a single pipeline driver.
///
/// **State machine (high level)**
/// ```text
///              (scheduled)                 (yield signal)
///   Ready ───────────────────► Running ─────────────────────► Ready
///                               │  │
///                               │  ├─ blocks on input/output/deps ──► Blocked(reason)
///                               │  │                                  │
///                               │  │        (resumed)                  │
///                               │  └──────────────────────────────────┘
///                               │
///                               ├─ completes normally ───────► Finished
///                               ├─ task terminated ──────────► Canceled
///                               └─ operator error ───────────► Failed(err)
/// ```
pub enum DriverState {
    Ready,
    Running,
    Blocked(BlockedReason),
    PendingFinish,
    Finished,
    Canceled,
    Failed(ExecError),
}

impl DriverState {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            DriverState::Finished | DriverState::Canceled | DriverState::Failed(_)
        )
    }
}

/// Per-slice deadline plus an external cooperative-yield request.
#[derive(Debug)]
pub struct YieldSignal {
    epoch: Instant,
    /// Nanoseconds since `epoch`; zero when no slice is running.
    deadline_nanos: AtomicU64,
    yield_requested: AtomicBool,
}

impl YieldSignal {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            deadline_nanos: AtomicU64::new(0),
            yield_requested: AtomicBool::new(false),
        }
    }

    pub fn set_with_delay(&self, slice: Duration) {
        let deadline = duration_nanos(self.epoch.elapsed() + slice).max(1);
        self.deadline_nanos.store(deadline, Ordering::Release);
        self.yield_requested.store(false, Ordering::Release);
    }

    pub fn reset(&self) {
        self.deadline_nanos.store(0, Ordering::Release);
        self.yield_requested.store(false, Ordering::Release);
    }

    /// Ask the running slice to return control at its next check.
    pub fn force_yield(&self) {
        self.yield_requested.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        if self.yield_requested.load(Ordering::Acquire) {
            return true;
        }
        let deadline = self.deadline_nanos.load(Ordering::Acquire);
        deadline != 0 && duration_nanos(self.epoch.elapsed()) >= deadline
    }
}

impl Default for YieldSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity and shared handles of one driver.
#[derive(Clone, Debug)]
pub struct DriverContext {
    pub task_id: TaskId,
    pub pipeline_id: u32,
    pub driver_index: usize,
    yield_signal: Arc<YieldSignal>,
}

impl DriverContext {
    pub fn new(task_id: TaskId, pipeline_id: u32, driver_index: usize) -> Self {
        Self {
            task_id,
            pipeline_id,
            driver_index,
            yield_signal: Arc::new(YieldSignal::new()),
        }
    }

    pub fn yield_signal(&self) -> Arc<YieldSignal> {
        Arc::clone(&self.yield_signal)
    }
}

#[derive(Debug)]
/// Scheduling metadata for one driver: whether it sits in the blocked poller and which
/// wake-up observers it has registered.
pub(crate) struct DriverScheduleState {
    in_blocked: AtomicBool,
    observer_mask: AtomicU8,
}

const OBSERVER_SOURCE: u8 = 1;
const OBSERVER_SINK: u8 = 1 << 1;

impl DriverScheduleState {
    pub(crate) fn new() -> Self {
        Self {
            in_blocked: AtomicBool::new(false),
            observer_mask: AtomicU8::new(0),
        }
    }

    pub(crate) fn set_in_blocked(&self, value: bool) {
        self.in_blocked.store(value, Ordering::Release);
    }

    pub(crate) fn try_mark_source_observer_registered(&self) -> bool {
        self.try_mark_observer(OBSERVER_SOURCE)
    }

    pub(crate) fn try_mark_sink_observer_registered(&self) -> bool {
        self.try_mark_observer(OBSERVER_SINK)
    }

    fn try_mark_observer(&self, mask: u8) -> bool {
        let mut current = self.observer_mask.load(Ordering::Acquire);
        loop {
            if (current & mask) != 0 {
                return false;
            }
            let next = current | mask;
            match self.observer_mask.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Cooperative execution driver that runs source/processor/sink operators for one pipeline instance.
pub struct PipelineDriver {
    context: DriverContext,
    operators: Vec<Box<dyn Operator>>,
    runtime_state: Arc<RuntimeState>,
    stats: Arc<DriverStats>,
    state: DriverState,
    closed: bool,
    schedule_state: Arc<DriverScheduleState>,
    pending_finish_state: Option<DriverState>,

    edge_pages: Vec<Option<Page>>,
    edge_closed: Vec<bool>,
    operator_finishing_set: Vec<bool>,
    operator_mem_trackers: Vec<Arc<MemTracker>>,
}

impl PipelineDriver {
    pub fn new(
        context: DriverContext,
        operators: Vec<Box<dyn Operator>>,
        runtime_state: Arc<RuntimeState>,
    ) -> Self {
        let mut operators = operators;
        let operator_count = operators.len();
        let edge_count = operator_count.saturating_sub(1);
        let names: Vec<String> = operators.iter().map(|op| op.name().to_string()).collect();
        let stats = Arc::new(DriverStats::new(
            context.pipeline_id,
            context.driver_index,
            &names,
        ));
        runtime_state.driver_stats().register(Arc::clone(&stats));
        let task_tracker = runtime_state.mem_tracker();
        let operator_mem_trackers: Vec<Arc<MemTracker>> = names
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let label = format!(
                    "pipeline {} driver {} operator {}: {}",
                    context.pipeline_id, context.driver_index, idx, name
                );
                MemTracker::new_child(label, &task_tracker)
            })
            .collect();
        for (op, tracker) in operators.iter_mut().zip(operator_mem_trackers.iter()) {
            op.set_mem_tracker(Arc::clone(tracker));
        }
        Self {
            context,
            operators,
            runtime_state,
            stats,
            state: DriverState::Ready,
            closed: false,
            schedule_state: Arc::new(DriverScheduleState::new()),
            pending_finish_state: None,

            edge_pages: vec![None; edge_count],
            edge_closed: vec![false; edge_count],
            operator_finishing_set: vec![false; operator_count],
            operator_mem_trackers,
        }
    }

    pub fn context(&self) -> &DriverContext {
        &self.context
    }

    pub fn yield_signal(&self) -> Arc<YieldSignal> {
        self.context.yield_signal()
    }

    pub fn stats(&self) -> Arc<DriverStats> {
        Arc::clone(&self.stats)
    }

    pub fn runtime_state(&self) -> &Arc<RuntimeState> {
        &self.runtime_state
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    pub(crate) fn try_mark_source_observer_registered(&self) -> bool {
        self.schedule_state.try_mark_source_observer_registered()
    }

    pub(crate) fn try_mark_sink_observer_registered(&self) -> bool {
        self.schedule_state.try_mark_sink_observer_registered()
    }

    pub(crate) fn set_in_blocked(&self, value: bool) {
        self.schedule_state.set_in_blocked(value);
    }

    pub(crate) fn has_pending_finish(&self) -> bool {
        self.operators.iter().any(|op| op.pending_finish())
    }

    fn cancel_operators(&mut self) {
        for op in self.operators.iter_mut() {
            op.cancel();
        }
    }

    /// Run until the yield signal trips, the driver blocks, or it reaches a final state.
    pub fn process(&mut self, time_slice: Duration) -> DriverState {
        let start = Instant::now();
        let signal = self.context.yield_signal();
        signal.set_with_delay(time_slice);
        let state = self.process_inner(&signal);
        signal.reset();
        self.stats.record_quantum(start.elapsed());
        if state.is_done() {
            self.stats.mark_done();
        }
        state
    }

    fn process_inner(&mut self, signal: &YieldSignal) -> DriverState {
        if let Some(final_state) = self.pending_finish_state.clone() {
            if self.has_pending_finish() {
                self.state = DriverState::PendingFinish;
                return self.state.clone();
            }
            self.pending_finish_state = None;
            return self.finish_with_state(final_state);
        }

        self.state = DriverState::Running;

        loop {
            if self.runtime_state.is_terminated() {
                return self.finish_with_state(DriverState::Canceled);
            }
            if signal.is_set() {
                self.stats.record_yield();
                self.state = DriverState::Ready;
                return self.state.clone();
            }

            if self.is_finished() {
                return self.finish_with_state(DriverState::Finished);
            }

            if let Some((idx, dep)) = self.find_precondition_dependency() {
                return self.block(idx, BlockedReason::Dependency(dep));
            }

            let mut made_progress = false;

            if let Err(err) = self.propagate_edge_closure(&mut made_progress) {
                return self.finish_with_state(DriverState::Failed(err));
            }
            if let Err(err) = self.drive_set_finishing(&mut made_progress) {
                return self.finish_with_state(DriverState::Failed(err));
            }
            if let Err(err) = self.drive_dataflow(&mut made_progress) {
                return self.finish_with_state(DriverState::Failed(err));
            }

            if made_progress {
                continue;
            }

            // With nothing buffered, source readiness decides first so an idle driver does
            // not report a full sink.
            let has_buffered = self.edge_pages.iter().any(|p| p.is_some());

            if !has_buffered {
                match self.source_blocked() {
                    Ok(true) => return self.block(0, BlockedReason::InputEmpty),
                    Ok(false) => {}
                    Err(err) => return self.finish_with_state(DriverState::Failed(err)),
                }
            }

            if let Some(sink) = self.operators.last()
                && !sink.is_finished()
            {
                let Some(proc) = sink.as_processor_ref() else {
                    return self.finish_with_state(DriverState::Failed(ExecError::internal(
                        "pipeline sink missing processor operator",
                    )));
                };
                if !proc.need_input() {
                    let idx = self.operators.len() - 1;
                    return self.block(idx, BlockedReason::OutputFull);
                }
            }

            if has_buffered {
                match self.source_blocked() {
                    Ok(true) => return self.block(0, BlockedReason::InputEmpty),
                    Ok(false) => {}
                    Err(err) => return self.finish_with_state(DriverState::Failed(err)),
                }
            }

            self.state = DriverState::Ready;
            return self.state.clone();
        }
    }

    fn source_blocked(&self) -> Result<bool> {
        let Some(source) = self.operators.first() else {
            return Ok(false);
        };
        if source.is_finished() {
            return Ok(false);
        }
        let proc = source
            .as_processor_ref()
            .ok_or_else(|| ExecError::internal("pipeline source missing processor operator"))?;
        Ok(!proc.has_output())
    }

    fn find_precondition_dependency(&self) -> Option<(usize, DependencyHandle)> {
        for (idx, op) in self.operators.iter().enumerate() {
            if op.is_finished() {
                continue;
            }
            let Some(proc) = op.as_processor_ref() else {
                continue;
            };
            let Some(dep) = proc.precondition_dependency() else {
                continue;
            };
            if dep.is_ready() {
                continue;
            }
            return Some((idx, dep));
        }
        None
    }

    pub(crate) fn source_observable(&self) -> Option<Arc<Observable>> {
        let op = self.operators.first()?;
        let proc = op.as_processor_ref()?;
        proc.source_observable()
    }

    pub(crate) fn sink_observable(&self) -> Option<Arc<Observable>> {
        let op = self.operators.last()?;
        let proc = op.as_processor_ref()?;
        proc.sink_observable()
    }

    pub(crate) fn source_ready(&self) -> bool {
        let Some(op) = self.operators.first() else {
            return true;
        };
        if op.is_finished() {
            return true;
        }
        let Some(proc) = op.as_processor_ref() else {
            return true;
        };
        proc.has_output() || op.is_finished()
    }

    pub(crate) fn sink_ready(&self) -> bool {
        let Some(op) = self.operators.last() else {
            return true;
        };
        if op.is_finished() {
            return true;
        }
        let Some(proc) = op.as_processor_ref() else {
            return true;
        };
        proc.need_input() || op.is_finished()
    }

    /// True when a parked driver should be re-enqueued.
    pub(crate) fn check_is_ready(&self) -> bool {
        if self.runtime_state.is_terminated() {
            return true;
        }
        match &self.state {
            DriverState::Blocked(reason) => match reason {
                BlockedReason::InputEmpty => {
                    self.source_ready() || self.is_finished() || self.has_ready_finishing_work()
                }
                BlockedReason::OutputFull => {
                    self.sink_ready() || self.is_finished() || self.has_ready_finishing_work()
                }
                BlockedReason::Dependency(dep) => dep.is_ready(),
            },
            DriverState::PendingFinish => !self.has_pending_finish(),
            DriverState::Ready | DriverState::Running => true,
            DriverState::Finished | DriverState::Canceled | DriverState::Failed(_) => true,
        }
    }

    fn has_ready_finishing_work(&self) -> bool {
        if self.operators.len() < 2 {
            return false;
        }
        for idx in 1..self.operators.len() {
            if self.operator_finishing_set[idx] {
                continue;
            }
            let in_edge = idx - 1;
            if in_edge >= self.edge_closed.len() {
                continue;
            }
            if self.edge_closed[in_edge] && self.edge_pages[in_edge].is_none() {
                return true;
            }
        }
        false
    }

    pub(crate) fn set_ready(&mut self) {
        self.state = DriverState::Ready;
    }

    fn is_finished(&self) -> bool {
        self.operators
            .last()
            .map(|op| op.is_finished())
            .unwrap_or(true)
    }

    fn block(&mut self, operator_idx: usize, reason: BlockedReason) -> DriverState {
        if let Some(stats) = self.stats.operator(operator_idx) {
            stats.record_blocked();
        }
        if let BlockedReason::Dependency(dep) = &reason {
            debug!(
                "Driver blocked on dependency: task={} pipeline={} driver={} dep_name={}",
                self.context.task_id,
                self.context.pipeline_id,
                self.context.driver_index,
                dep.name()
            );
        }
        self.state = DriverState::Blocked(reason);
        self.state.clone()
    }

    fn finish_with_state(&mut self, state: DriverState) -> DriverState {
        if matches!(state, DriverState::Canceled | DriverState::Failed(_)) {
            self.cancel_operators();
        }
        if state.is_done() && self.pending_finish_state.is_none() && self.has_pending_finish() {
            self.pending_finish_state = Some(state.clone());
            self.state = DriverState::PendingFinish;
            return self.state.clone();
        }
        match &state {
            DriverState::Finished => {
                let last_op = self
                    .operators
                    .last()
                    .map(|op| op.name())
                    .unwrap_or("unknown");
                debug!(
                    "Driver finished: task={} pipeline={} driver={} last_op={}",
                    self.context.task_id,
                    self.context.pipeline_id,
                    self.context.driver_index,
                    last_op
                );
            }
            DriverState::Canceled => {
                debug!(
                    "Driver canceled: task={} pipeline={} driver={}",
                    self.context.task_id, self.context.pipeline_id, self.context.driver_index
                );
            }
            DriverState::Failed(err) => {
                error!(
                    "Driver failed: task={} pipeline={} driver={} error={}",
                    self.context.task_id,
                    self.context.pipeline_id,
                    self.context.driver_index,
                    err
                );
            }
            _ => {}
        }
        if state.is_done() {
            self.close_operators();
        }
        if let DriverState::Failed(err) = &state {
            self.runtime_state.fail(err.clone());
        }
        self.state = state;
        self.state.clone()
    }

    fn close_operators(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.release_edge_buffers();
        for idx in (0..self.operators.len()).rev() {
            let op = &mut self.operators[idx];
            if let Err(err) = op.close() {
                error!("operator close failed: {}: {}", op.name(), err);
            }
        }
        debug!(
            "Driver closed: task={} pipeline={} driver={} tracked_bytes={}",
            self.context.task_id,
            self.context.pipeline_id,
            self.context.driver_index,
            self.operator_mem_trackers
                .iter()
                .map(|t| t.current())
                .sum::<i64>()
        );
        // a driver dropped by an aborted task never reports a final state from `process`
        self.stats.mark_done();
    }

    fn release_edge_buffers(&mut self) {
        for page in self.edge_pages.iter_mut() {
            let _ = page.take();
        }
    }

    fn drive_dataflow(&mut self, made_progress: &mut bool) -> Result<()> {
        if self.edge_pages.is_empty() {
            return Ok(());
        }
        self.drive_push_edges(made_progress)?;
        self.drive_pull_edges(made_progress)?;
        self.drive_push_edges(made_progress)?;
        Ok(())
    }

    fn drive_push_edges(&mut self, made_progress: &mut bool) -> Result<()> {
        for e in (0..self.edge_pages.len()).rev() {
            if self.edge_pages[e].is_none() {
                continue;
            }
            let downstream_idx = e + 1;
            let Some(downstream_op) = self.operators.get_mut(downstream_idx) else {
                return Err(ExecError::internal("pipeline operator index out of bounds"));
            };
            let downstream_name = downstream_op.name().to_string();
            let downstream = downstream_op.as_processor_mut().ok_or_else(|| {
                ExecError::internal(format!(
                    "pipeline operator {} missing processor operator",
                    downstream_name
                ))
            })?;
            if !downstream.need_input() {
                continue;
            }
            let Some(page) = self.edge_pages[e].take() else {
                continue;
            };
            let rows = page.position_count();
            let bytes = page.retained_size_in_bytes();
            let start = Instant::now();
            downstream.push_chunk(self.runtime_state.as_ref(), page)?;
            if let Some(stats) = self.stats.operator(downstream_idx) {
                stats.record_input(rows, bytes, start.elapsed());
            }
            *made_progress = true;
        }
        Ok(())
    }

    fn drive_pull_edges(&mut self, made_progress: &mut bool) -> Result<()> {
        for e in 0..self.edge_pages.len() {
            if self.edge_pages[e].is_some() {
                continue;
            }
            let upstream_idx = e;
            let downstream_idx = e + 1;

            let (left, right) = self.operators.split_at_mut(downstream_idx);
            let upstream_op = &mut left[upstream_idx];
            let downstream_op = &mut right[0];

            let upstream_name = upstream_op.name().to_string();
            let upstream = upstream_op.as_processor_mut().ok_or_else(|| {
                ExecError::internal(format!(
                    "pipeline operator {} missing processor operator",
                    upstream_name
                ))
            })?;
            let downstream_name = downstream_op.name().to_string();
            let downstream = downstream_op.as_processor_mut().ok_or_else(|| {
                ExecError::internal(format!(
                    "pipeline operator {} missing processor operator",
                    downstream_name
                ))
            })?;

            if !upstream.has_output() || !downstream.need_input() {
                continue;
            }

            let start = Instant::now();
            let maybe = upstream.pull_chunk(self.runtime_state.as_ref())?;
            let stats = self.stats.operator(upstream_idx);
            if let Some(stats) = stats {
                stats.record_get_output(start.elapsed());
            }
            if let Some(page) = maybe {
                if let Some(stats) = stats {
                    stats.record_output(page.position_count(), page.retained_size_in_bytes());
                }
                self.edge_pages[e] = Some(page);
                *made_progress = true;
            }
        }
        Ok(())
    }

    fn propagate_edge_closure(&mut self, made_progress: &mut bool) -> Result<()> {
        for e in 0..self.edge_pages.len() {
            if self.edge_closed[e] || self.edge_pages[e].is_some() {
                continue;
            }
            let upstream_finished = self
                .operators
                .get(e)
                .map(|op| op.is_finished())
                .unwrap_or(false);
            if upstream_finished {
                self.edge_closed[e] = true;
                debug!(
                    "Driver edge closed: task={} driver={} edge={} upstream_op={}",
                    self.context.task_id,
                    self.context.driver_index,
                    e,
                    self.operators[e].name()
                );
                *made_progress = true;
            }
        }
        Ok(())
    }

    fn drive_set_finishing(&mut self, made_progress: &mut bool) -> Result<()> {
        if self.operators.len() < 2 {
            return Ok(());
        }
        for idx in 1..self.operators.len() {
            if self.operator_finishing_set[idx] {
                continue;
            }
            let in_edge = idx - 1;
            if !self.edge_closed[in_edge] || self.edge_pages[in_edge].is_some() {
                continue;
            }
            let op = self
                .operators
                .get_mut(idx)
                .ok_or_else(|| ExecError::internal("pipeline operator index out of bounds"))?;
            let op_name = op.name().to_string();
            let proc = op.as_processor_mut().ok_or_else(|| {
                ExecError::internal(format!(
                    "pipeline operator {} missing processor operator",
                    op_name
                ))
            })?;
            let start = Instant::now();
            proc.set_finishing(self.runtime_state.as_ref())?;
            if let Some(stats) = self.stats.operator(idx) {
                stats.record_finish(start.elapsed());
            }
            self.operator_finishing_set[idx] = true;
            *made_progress = true;
        }
        Ok(())
    }
}

impl Drop for PipelineDriver {
    fn drop(&mut self) {
        self.close_operators();
    }
}
