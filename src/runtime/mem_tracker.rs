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
//! Observability-only byte counters: node -> query -> task -> operator.
//!
//! A tracker records what its owner reports and rolls every change up to its ancestors.
//! Limits are enforced by `MemoryPool` and `QueryMemoryContext`, never here.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug)]
pub struct MemTracker {
    label: String,
    parent: Option<Arc<MemTracker>>,
    current: AtomicI64,
    peak: AtomicI64,
}

impl MemTracker {
    pub fn new_root(label: impl Into<String>) -> Arc<Self> {
        Self::with_parent(label.into(), None)
    }

    pub fn new_child(label: impl Into<String>, parent: &Arc<MemTracker>) -> Arc<Self> {
        Self::with_parent(label.into(), Some(Arc::clone(parent)))
    }

    fn with_parent(label: String, parent: Option<Arc<MemTracker>>) -> Arc<Self> {
        Arc::new(Self {
            label,
            parent,
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn consume(&self, bytes: i64) {
        self.update(bytes.max(0));
    }

    pub fn release(&self, bytes: i64) {
        self.update(-bytes.max(0));
    }

    /// Apply a signed delta here and on every ancestor.
    pub fn update(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        let mut next = Some(self);
        while let Some(tracker) = next {
            let value = tracker.current.fetch_add(delta, Ordering::AcqRel) + delta;
            if delta > 0 {
                tracker.peak.fetch_max(value, Ordering::AcqRel);
            }
            next = tracker.parent.as_deref();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumption_rolls_up_to_ancestors() {
        let node = MemTracker::new_root("node");
        let query = MemTracker::new_child("query", &node);
        let op = MemTracker::new_child("op", &query);
        op.consume(100);
        op.update(-40);
        assert_eq!(node.current(), 60);
        assert_eq!(query.peak(), 100);
        assert_eq!(op.label(), "op");

        let other = MemTracker::new_child("op2", &query);
        other.consume(10);
        other.release(10);
        assert_eq!(query.current(), 60);
        assert_eq!(node.peak(), 100);
    }
}
