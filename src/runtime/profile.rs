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
//! Execution counters for operators, drivers and tasks.
//!
//! Counters are lock-free atomics updated by the driver loop; snapshots are serializable and
//! travel inside task info.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub fn clamp_u128_to_u64(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

pub fn duration_nanos(d: Duration) -> u64 {
    clamp_u128_to_u64(d.as_nanos())
}

#[derive(Debug)]
pub struct OperatorStats {
    name: String,
    input_pages: AtomicU64,
    input_rows: AtomicU64,
    input_bytes: AtomicU64,
    output_pages: AtomicU64,
    output_rows: AtomicU64,
    output_bytes: AtomicU64,
    add_input_nanos: AtomicU64,
    get_output_nanos: AtomicU64,
    finish_nanos: AtomicU64,
    blocked_count: AtomicU64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperatorStatsSnapshot {
    pub name: String,
    pub input_pages: u64,
    pub input_rows: u64,
    pub input_bytes: u64,
    pub output_pages: u64,
    pub output_rows: u64,
    pub output_bytes: u64,
    pub add_input_nanos: u64,
    pub get_output_nanos: u64,
    pub finish_nanos: u64,
    pub blocked_count: u64,
}

impl OperatorStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_pages: AtomicU64::new(0),
            input_rows: AtomicU64::new(0),
            input_bytes: AtomicU64::new(0),
            output_pages: AtomicU64::new(0),
            output_rows: AtomicU64::new(0),
            output_bytes: AtomicU64::new(0),
            add_input_nanos: AtomicU64::new(0),
            get_output_nanos: AtomicU64::new(0),
            finish_nanos: AtomicU64::new(0),
            blocked_count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record_input(&self, rows: usize, bytes: usize, elapsed: Duration) {
        self.input_pages.fetch_add(1, Ordering::Relaxed);
        self.input_rows.fetch_add(rows as u64, Ordering::Relaxed);
        self.input_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.add_input_nanos
            .fetch_add(duration_nanos(elapsed), Ordering::Relaxed);
    }

    pub fn record_get_output(&self, elapsed: Duration) {
        self.get_output_nanos
            .fetch_add(duration_nanos(elapsed), Ordering::Relaxed);
    }

    pub fn record_output(&self, rows: usize, bytes: usize) {
        self.output_pages.fetch_add(1, Ordering::Relaxed);
        self.output_rows.fetch_add(rows as u64, Ordering::Relaxed);
        self.output_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_finish(&self, elapsed: Duration) {
        self.finish_nanos
            .fetch_add(duration_nanos(elapsed), Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.blocked_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn input_rows(&self) -> u64 {
        self.input_rows.load(Ordering::Relaxed)
    }

    pub fn output_rows(&self) -> u64 {
        self.output_rows.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> OperatorStatsSnapshot {
        OperatorStatsSnapshot {
            name: self.name.clone(),
            input_pages: self.input_pages.load(Ordering::Relaxed),
            input_rows: self.input_rows.load(Ordering::Relaxed),
            input_bytes: self.input_bytes.load(Ordering::Relaxed),
            output_pages: self.output_pages.load(Ordering::Relaxed),
            output_rows: self.output_rows.load(Ordering::Relaxed),
            output_bytes: self.output_bytes.load(Ordering::Relaxed),
            add_input_nanos: self.add_input_nanos.load(Ordering::Relaxed),
            get_output_nanos: self.get_output_nanos.load(Ordering::Relaxed),
            finish_nanos: self.finish_nanos.load(Ordering::Relaxed),
            blocked_count: self.blocked_count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct DriverStats {
    pipeline_id: u32,
    driver_index: usize,
    operators: Vec<Arc<OperatorStats>>,
    elapsed_nanos: AtomicU64,
    quanta: AtomicU64,
    yields: AtomicU64,
    done: AtomicU64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverStatsSnapshot {
    pub pipeline_id: u32,
    pub driver_index: usize,
    pub elapsed_nanos: u64,
    pub quanta: u64,
    pub yields: u64,
    pub done: bool,
    pub operators: Vec<OperatorStatsSnapshot>,
}

impl DriverStats {
    pub fn new(pipeline_id: u32, driver_index: usize, operator_names: &[String]) -> Self {
        Self {
            pipeline_id,
            driver_index,
            operators: operator_names
                .iter()
                .map(|n| Arc::new(OperatorStats::new(n.clone())))
                .collect(),
            elapsed_nanos: AtomicU64::new(0),
            quanta: AtomicU64::new(0),
            yields: AtomicU64::new(0),
            done: AtomicU64::new(0),
        }
    }

    pub fn operator(&self, idx: usize) -> Option<&Arc<OperatorStats>> {
        self.operators.get(idx)
    }

    pub fn operators(&self) -> &[Arc<OperatorStats>] {
        &self.operators
    }

    pub fn record_quantum(&self, elapsed: Duration) {
        self.quanta.fetch_add(1, Ordering::Relaxed);
        self.elapsed_nanos
            .fetch_add(duration_nanos(elapsed), Ordering::Relaxed);
    }

    pub fn record_yield(&self) {
        self.yields.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_done(&self) {
        self.done.store(1, Ordering::Relaxed);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Relaxed) != 0
    }

    pub fn snapshot(&self) -> DriverStatsSnapshot {
        DriverStatsSnapshot {
            pipeline_id: self.pipeline_id,
            driver_index: self.driver_index,
            elapsed_nanos: self.elapsed_nanos.load(Ordering::Relaxed),
            quanta: self.quanta.load(Ordering::Relaxed),
            yields: self.yields.load(Ordering::Relaxed),
            done: self.is_done(),
            operators: self.operators.iter().map(|o| o.snapshot()).collect(),
        }
    }
}

/// Registry of every driver a task has started.
#[derive(Debug, Default)]
pub struct DriverStatsRegistry {
    drivers: Mutex<Vec<Arc<DriverStats>>>,
}

impl DriverStatsRegistry {
    pub fn register(&self, stats: Arc<DriverStats>) {
        self.drivers
            .lock()
            .expect("driver stats lock")
            .push(stats);
    }

    pub fn drivers(&self) -> Vec<Arc<DriverStats>> {
        self.drivers.lock().expect("driver stats lock").clone()
    }

    pub fn snapshots(&self) -> Vec<DriverStatsSnapshot> {
        self.drivers()
            .iter()
            .map(|d| d.snapshot())
            .collect()
    }

    pub fn running_drivers(&self) -> usize {
        self.drivers().iter().filter(|d| !d.is_done()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_snapshot_carries_operator_counters() {
        let names = vec!["values".to_string(), "filter".to_string()];
        let stats = DriverStats::new(0, 1, &names);
        stats
            .operator(1)
            .unwrap()
            .record_input(10, 80, Duration::from_micros(3));
        stats.operator(0).unwrap().record_output(10, 80);
        stats.record_quantum(Duration::from_millis(1));
        let snap = stats.snapshot();
        assert_eq!(snap.operators[1].input_rows, 10);
        assert_eq!(snap.operators[1].add_input_nanos, 3000);
        assert_eq!(snap.operators[0].output_pages, 1);
        assert_eq!(snap.quanta, 1);
        assert!(!snap.done);
    }
}
