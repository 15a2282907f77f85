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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use novaexec::common::ids::{FragmentId, PlanNodeId, StageId};
use novaexec::connector::sequence;
use novaexec::exec::expr::{BinaryOp, Expr};
use novaexec::exec::page::{ColumnType, Page};
use novaexec::exec::plan::{
    Aggregate, AggregateFunction, AggregationStep, OutputPartitioning, PartitioningHandle,
    PlanFragment, PlanNode, SubPlan,
};
use novaexec::novaexec_config::NovaExecConfig;
use novaexec::novaexec_logging;
use novaexec::scheduler::split_source::{BufferedSplitSource, SplitSource};

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with short waits and small thread pools.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_novaexec.toml");

        let config_content = r#"
log_level = "warn"

[server]
host = "127.0.0.1"
http_port = 0
node_id = "test-node"
environment = "test"

[runtime]
exec_threads = 2
io_threads = 4
exchange_max_wait_ms = 50
exchange_min_backoff_ms = 10
exchange_max_backoff_ms = 50
exchange_max_error_duration_ms = 2000
task_status_max_wait_ms = 100
task_client_timeout_ms = 5000

[scheduler]
scheduler_wait_ms = 10
"#;

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        novaexec_logging::init_with_level("warn");
    }

    /// Load the test configuration.
    pub fn load_config(&self) -> anyhow::Result<NovaExecConfig> {
        NovaExecConfig::load_from_file(&self.config_path)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

/// Parsed test configuration; logging is initialized on the way.
pub fn test_config() -> NovaExecConfig {
    let test = TestConfig::default();
    test.init_logging();
    test.load_config().expect("load test config")
}

/// Wait for a condition to become true, with timeout.
pub fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Run `f` and fail the test if it does not finish within `timeout`.
pub fn run_with_timeout<F, T>(timeout: Duration, f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });

    match rx.recv_timeout(timeout) {
        Ok(v) => v,
        Err(_) => panic!("test timed out after {:?}", timeout),
    }
}

pub fn scan(id: u32) -> PlanNode {
    PlanNode::TableScan {
        id: PlanNodeId(id),
        catalog: sequence::CATALOG.to_string(),
        output_types: vec![ColumnType::Int64],
    }
}

pub fn remote_source(id: u32, fragments: &[u32], output_types: Vec<ColumnType>) -> PlanNode {
    PlanNode::RemoteSource {
        id: PlanNodeId(id),
        source_fragments: fragments.iter().map(|f| StageId(*f)).collect(),
        output_types,
    }
}

/// `col0 % divisor == 0`
pub fn multiple_of(source: PlanNode, id: u32, divisor: i64) -> PlanNode {
    PlanNode::Filter {
        id: PlanNodeId(id),
        source: Box::new(source),
        predicate: Expr::binary(
            BinaryOp::Eq,
            Expr::binary(BinaryOp::Modulo, Expr::col(0), Expr::long(divisor)),
            Expr::long(0),
        ),
    }
}

/// `count(*)` and `sum(col0)` in the given step.
pub fn count_and_sum(source: PlanNode, id: u32, step: AggregationStep) -> PlanNode {
    PlanNode::Aggregation {
        id: PlanNodeId(id),
        source: Box::new(source),
        group_by: Vec::new(),
        aggregates: vec![
            Aggregate::count_all(),
            Aggregate::new(AggregateFunction::Sum, 0),
        ],
        step,
    }
}

/// Three stages: a filtered scan hash-distributed into four partial aggregations, gathered
/// into one final aggregation.
///
/// Fragment 2 scans `[0, total)` and keeps multiples of `divisor`.
pub fn filtered_count_and_sum_plan(divisor: i64) -> SubPlan {
    let leaf = PlanFragment::new(
        StageId(2),
        multiple_of(scan(1), 2, divisor),
        PartitioningHandle::Source,
        OutputPartitioning::Hash { keys: vec![0] },
    )
    .expect("leaf fragment");
    let partial = PlanFragment::new(
        StageId(1),
        count_and_sum(
            remote_source(10, &[2], vec![ColumnType::Int64]),
            11,
            AggregationStep::Partial,
        ),
        PartitioningHandle::Hash { partition_count: 4 },
        OutputPartitioning::Single,
    )
    .expect("partial fragment");
    let root = PlanFragment::new(
        StageId(0),
        count_and_sum(
            remote_source(20, &[1], vec![ColumnType::Int64, ColumnType::Int64]),
            21,
            AggregationStep::Final,
        ),
        PartitioningHandle::Single,
        OutputPartitioning::Single,
    )
    .expect("root fragment");
    SubPlan::new(
        root,
        vec![SubPlan::new(partial, vec![SubPlan::leaf(leaf)])],
    )
}

/// Three stages: the scan emits `(col0 % modulus, col0)` hash-distributed on the key into four
/// grouped `sum(col0)` aggregations, whose rows the root gathers unchanged.
pub fn grouped_sum_plan(modulus: i64) -> SubPlan {
    let leaf = PlanFragment::new(
        StageId(2),
        PlanNode::Project {
            id: PlanNodeId(2),
            source: Box::new(scan(1)),
            exprs: vec![
                Expr::binary(BinaryOp::Modulo, Expr::col(0), Expr::long(modulus)),
                Expr::col(0),
            ],
        },
        PartitioningHandle::Source,
        OutputPartitioning::Hash { keys: vec![0] },
    )
    .expect("leaf fragment");
    let grouped = PlanFragment::new(
        StageId(1),
        PlanNode::Aggregation {
            id: PlanNodeId(11),
            source: Box::new(remote_source(
                10,
                &[2],
                vec![ColumnType::Int64, ColumnType::Int64],
            )),
            group_by: vec![0],
            aggregates: vec![Aggregate::new(AggregateFunction::Sum, 1)],
            step: AggregationStep::Single,
        },
        PartitioningHandle::Hash { partition_count: 4 },
        OutputPartitioning::Single,
    )
    .expect("grouped fragment");
    let root = PlanFragment::new(
        StageId(0),
        remote_source(20, &[1], vec![ColumnType::Int64, ColumnType::Int64]),
        PartitioningHandle::Single,
        OutputPartitioning::Single,
    )
    .expect("root fragment");
    SubPlan::new(
        root,
        vec![SubPlan::new(grouped, vec![SubPlan::leaf(leaf)])],
    )
}

/// Split sources for the scan fragment of `filtered_count_and_sum_plan`.
pub fn sequence_sources(total: i64, rows_per_split: i64) -> HashMap<FragmentId, Arc<dyn SplitSource>> {
    let source = BufferedSplitSource::from_splits(
        sequence::CATALOG,
        sequence::splits(total, rows_per_split),
    )
    .expect("split source");
    let mut sources: HashMap<FragmentId, Arc<dyn SplitSource>> = HashMap::new();
    sources.insert(StageId(2), Arc::new(source));
    sources
}

/// Every value of channel `channel` across `pages`, nulls skipped.
pub fn longs(pages: &[Page], channel: usize) -> Vec<i64> {
    let mut out = Vec::new();
    for page in pages {
        let block = page.block(channel).expect("channel");
        for position in 0..page.position_count() {
            if !block.is_null(position) {
                out.push(block.get_long(position).expect("long"));
            }
        }
    }
    out
}

/// Assert that a result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}

/// Assert that a result is Err.
#[macro_export]
macro_rules! assert_err {
    ($result:expr) => {
        match $result {
            Ok(value) => panic!("Expected Err, got Ok: {:?}", value),
            Err(e) => e,
        }
    };
}
