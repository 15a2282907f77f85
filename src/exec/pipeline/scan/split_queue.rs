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
//! Per-scan-node split queue shared by the drivers of one task.
//!
//! Responsibilities:
//! - Buffers splits assigned by the coordinator until a scan driver claims one.
//! - Signals scan operators through an observable when splits or end-of-splits arrive.
//!
//! Key exported interfaces:
//! - Types: `SplitQueue`, `SplitQueueRef`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::ids::PlanNodeId;
use crate::exec::pipeline::schedule::observer::Observable;
use crate::novaexec_logging::debug;
use crate::scheduler::split::ScheduledSplit;

pub type SplitQueueRef = Arc<SplitQueue>;

#[derive(Default)]
struct QueueState {
    splits: VecDeque<ScheduledSplit>,
    no_more_splits: bool,
    closed: bool,
}

pub struct SplitQueue {
    plan_node_id: PlanNodeId,
    state: Mutex<QueueState>,
    size: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicUsize,
    observable: Arc<Observable>,
}

impl SplitQueue {
    pub fn new(plan_node_id: PlanNodeId) -> SplitQueueRef {
        Arc::new(Self {
            plan_node_id,
            state: Mutex::new(QueueState::default()),
            size: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            observable: Arc::new(Observable::new()),
        })
    }

    pub fn plan_node_id(&self) -> PlanNodeId {
        self.plan_node_id
    }

    /// Returns the number of splits accepted; a closed queue accepts none.
    pub fn add_splits(&self, splits: Vec<ScheduledSplit>) -> usize {
        if splits.is_empty() {
            return 0;
        }
        let notify = self.observable.defer_notify();
        let mut guard = self.state.lock().expect("split queue lock");
        if guard.closed || guard.no_more_splits {
            debug!(
                "split queue {} dropping {} splits: closed={} no_more_splits={}",
                self.plan_node_id,
                splits.len(),
                guard.closed,
                guard.no_more_splits
            );
            return 0;
        }
        let added = splits.len();
        guard.splits.extend(splits);
        self.size.fetch_add(added, Ordering::AcqRel);
        notify.arm();
        added
    }

    pub fn no_more_splits(&self) {
        let notify = self.observable.defer_notify();
        let mut guard = self.state.lock().expect("split queue lock");
        if guard.no_more_splits {
            return;
        }
        guard.no_more_splits = true;
        notify.arm();
    }

    pub fn has_no_more_splits(&self) -> bool {
        self.state.lock().expect("split queue lock").no_more_splits
    }

    pub fn try_get(&self) -> Option<ScheduledSplit> {
        if self.size.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut guard = self.state.lock().expect("split queue lock");
        let split = guard.splits.pop_front();
        if split.is_some() {
            self.size.fetch_sub(1, Ordering::AcqRel);
            self.running.fetch_add(1, Ordering::AcqRel);
        }
        split
    }

    /// Called by the scan operator once a claimed split is fully read.
    pub fn split_finished(&self) {
        let prev = self.running.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            self.running.store(0, Ordering::Release);
            return;
        }
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn has_splits(&self) -> bool {
        self.size.load(Ordering::Acquire) > 0
    }

    /// No split is queued and none can arrive.
    pub fn is_drained(&self) -> bool {
        let guard = self.state.lock().expect("split queue lock");
        guard.closed || (guard.no_more_splits && guard.splits.is_empty())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("split queue lock").closed
    }

    pub fn queued(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub fn observable(&self) -> Arc<Observable> {
        Arc::clone(&self.observable)
    }

    /// Drop queued splits and refuse new ones.
    pub fn close(&self) {
        let notify = self.observable.defer_notify();
        let mut guard = self.state.lock().expect("split queue lock");
        if guard.closed {
            return;
        }
        guard.closed = true;
        let dropped = guard.splits.len();
        guard.splits.clear();
        self.size.store(0, Ordering::Release);
        if dropped > 0 {
            debug!(
                "split queue {} closed, dropped {} queued splits",
                self.plan_node_id, dropped
            );
        }
        notify.arm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::split::Split;

    fn split(seq: u64) -> ScheduledSplit {
        ScheduledSplit {
            sequence_id: seq,
            plan_node_id: PlanNodeId(1),
            split: Split::new("sequence", serde_json::json!({"start": 0, "end": 1})),
        }
    }

    #[test]
    fn drains_in_order_then_reports_drained() {
        let q = SplitQueue::new(PlanNodeId(1));
        assert_eq!(q.add_splits(vec![split(1), split(2)]), 2);
        assert!(!q.is_drained());
        assert_eq!(q.try_get().unwrap().sequence_id, 1);
        q.no_more_splits();
        assert_eq!(q.add_splits(vec![split(3)]), 0);
        assert_eq!(q.try_get().unwrap().sequence_id, 2);
        assert!(q.try_get().is_none());
        assert!(q.is_drained());
        assert_eq!(q.running(), 2);
        q.split_finished();
        assert_eq!(q.completed(), 1);
    }

    #[test]
    fn close_discards_and_notifies() {
        let q = SplitQueue::new(PlanNodeId(1));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        q.observable().add_observer(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        q.add_splits(vec![split(1)]);
        q.close();
        assert!(q.try_get().is_none());
        assert!(q.is_drained());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
