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
//! Local-exchange buffer budget controller.
//!
//! Responsibilities:
//! - Tracks bytes and rows buffered between local exchange sinks and sources.
//! - Exposes a write dependency that blocks sinks while the buffer is over its threshold.
//!
//! Key exported interfaces:
//! - Types: `LocalExchangeMemoryManager`.

use std::sync::Mutex;

use crate::exec::pipeline::dependency::{Dependency, DependencyHandle};
use crate::novaexec_logging::debug;

struct Usage {
    bytes: i64,
    rows: i64,
    peak_bytes: i64,
    peak_rows: i64,
}

/// Memory-budget controller for pages queued inside one local exchange.
pub struct LocalExchangeMemoryManager {
    max_bytes: i64,
    max_rows: i64,
    usage: Mutex<Usage>,
    writable: DependencyHandle,
}

impl LocalExchangeMemoryManager {
    pub fn new(max_input_dop: usize, per_driver_mem_limit: i64, max_buffered_rows: i64) -> Self {
        let per_driver = per_driver_mem_limit.max(1);
        if per_driver_mem_limit <= 0 {
            debug!(
                "LocalExchangeMemoryManager: invalid per_driver_mem_limit={}, clamped to 1",
                per_driver_mem_limit
            );
        }
        Self {
            max_bytes: per_driver.saturating_mul(max_input_dop.max(1) as i64),
            max_rows: max_buffered_rows.max(1),
            usage: Mutex::new(Usage {
                bytes: 0,
                rows: 0,
                peak_bytes: 0,
                peak_rows: 0,
            }),
            writable: Dependency::new_ready("local_exchange_writable"),
        }
    }

    /// Apply signed deltas; flips the write dependency when crossing the threshold.
    pub fn update_memory_usage(&self, bytes_delta: i64, rows_delta: i64) {
        // The flip happens under the usage lock so concurrent updates cannot reorder it.
        let mut usage = self.usage.lock().expect("local exchange memory lock");
        usage.bytes = usage.bytes.saturating_add(bytes_delta).max(0);
        usage.rows = usage.rows.saturating_add(rows_delta).max(0);
        usage.peak_bytes = usage.peak_bytes.max(usage.bytes);
        usage.peak_rows = usage.peak_rows.max(usage.rows);
        if self.is_full_locked(&usage) {
            self.writable.set_blocked();
        } else if !self.writable.is_ready() {
            self.writable.set_ready();
        }
    }

    fn is_full_locked(&self, usage: &Usage) -> bool {
        usage.bytes >= self.max_bytes || usage.rows > self.max_rows
    }

    pub fn is_full(&self) -> bool {
        let usage = self.usage.lock().expect("local exchange memory lock");
        self.is_full_locked(&usage)
    }

    /// Ready while the exchange accepts more pages.
    pub fn wait_for_writing(&self) -> DependencyHandle {
        self.writable.clone()
    }

    pub fn max_bytes(&self) -> i64 {
        self.max_bytes
    }

    pub fn memory_usage(&self) -> i64 {
        self.usage.lock().expect("local exchange memory lock").bytes
    }

    pub fn buffered_rows(&self) -> i64 {
        self.usage.lock().expect("local exchange memory lock").rows
    }

    pub fn peak_memory_usage(&self) -> i64 {
        self.usage
            .lock()
            .expect("local exchange memory lock")
            .peak_bytes
    }

    pub fn peak_rows(&self) -> i64 {
        self.usage.lock().expect("local exchange memory lock").peak_rows
    }

    pub fn clear(&self) {
        let mut usage = self.usage.lock().expect("local exchange memory lock");
        usage.bytes = 0;
        usage.rows = 0;
        self.writable.set_ready();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_dependency_follows_threshold() {
        let mgr = LocalExchangeMemoryManager::new(2, 100, 1_000);
        assert_eq!(mgr.max_bytes(), 200);
        let dep = mgr.wait_for_writing();
        mgr.update_memory_usage(150, 10);
        assert!(dep.is_ready());
        mgr.update_memory_usage(60, 10);
        assert!(mgr.is_full());
        assert!(!dep.is_ready());
        mgr.update_memory_usage(-100, -10);
        assert!(dep.is_ready());
        assert_eq!(mgr.peak_memory_usage(), 210);
        mgr.clear();
        assert_eq!(mgr.memory_usage(), 0);
    }
}
