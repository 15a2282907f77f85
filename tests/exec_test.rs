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
//! End-to-end query execution on an in-process cluster.

use std::collections::HashMap;
use std::time::Duration;

use novaexec::common::ids::{NodeId, PlanNodeId, StageId};
use novaexec::connector::sequence;
use novaexec::exec::page::{ColumnType, Value};
use novaexec::exec::plan::{OutputPartitioning, PartitioningHandle, PlanFragment, PlanNode, SubPlan};
use novaexec::scheduler::query_scheduler::QueryState;
use novaexec::scheduler::split_source::{BufferedSplitSource, SplitSource};
use novaexec::{ErrorCode, LocalCluster};

use crate::common::{
    filtered_count_and_sum_plan, grouped_sum_plan, longs, sequence_sources, test_config,
};

mod common;

const TIMEOUT: Duration = Duration::from_secs(30);

#[test]
fn test_filtered_aggregation_across_three_stages() {
    let cluster = assert_ok!(LocalCluster::new(3, test_config()));
    let result = assert_ok!(cluster.query_runner().run(
        &filtered_count_and_sum_plan(3),
        sequence_sources(100, 10),
        TIMEOUT,
    ));

    assert_eq!(result.info.state, QueryState::Finished);
    assert_eq!(result.row_count(), 1);
    assert_eq!(longs(&result.pages, 0), vec![34]);
    assert_eq!(longs(&result.pages, 1), vec![1683]);

    // Only rows that passed the filter cross the first exchange.
    let leaf = result.stage(StageId(2)).expect("leaf stage stats");
    assert_eq!(leaf.exchanged_rows, 34);
    assert_eq!(leaf.input_rows, 100);

    // One partial row per hash partition, including empty ones.
    let partial = result.stage(StageId(1)).expect("partial stage stats");
    assert_eq!(partial.task_count, 4);
    assert_eq!(partial.exchanged_rows, 4);

    let root = result.stage(StageId(0)).expect("root stage stats");
    assert_eq!(root.task_count, 1);
}

#[test]
fn test_grouped_aggregation_across_hash_stage() {
    let cluster = assert_ok!(LocalCluster::new(3, test_config()));
    let result = assert_ok!(cluster.query_runner().run(
        &grouped_sum_plan(7),
        sequence_sources(100, 10),
        TIMEOUT,
    ));
    assert_eq!(result.info.state, QueryState::Finished);

    let mut groups: Vec<(i64, i64)> = longs(&result.pages, 0)
        .into_iter()
        .zip(longs(&result.pages, 1))
        .collect();
    groups.sort_unstable();
    let expected: Vec<(i64, i64)> = (0..7)
        .map(|key| (key, (0..100).filter(|v| v % 7 == key).sum()))
        .collect();
    // every key lands in exactly one hash partition
    assert_eq!(groups, expected);
    assert_eq!(result.row_count(), 7);

    let grouped = result.stage(StageId(1)).expect("grouped stage stats");
    assert_eq!(grouped.task_count, 4);
    assert_eq!(grouped.exchanged_rows, 7);
    let leaf = result.stage(StageId(2)).expect("leaf stage stats");
    assert_eq!(leaf.exchanged_rows, 100);
}

#[test]
fn test_empty_scan_still_produces_global_aggregate_row() {
    let cluster = assert_ok!(LocalCluster::new(2, test_config()));
    let result = assert_ok!(cluster.query_runner().run(
        &filtered_count_and_sum_plan(3),
        sequence_sources(0, 10),
        TIMEOUT,
    ));
    assert_eq!(result.row_count(), 1);
    assert_eq!(longs(&result.pages, 0), vec![0]);
    // sum over no rows is null
    assert!(longs(&result.pages, 1).is_empty());
}

#[test]
fn test_single_stage_values_query() {
    let cluster = assert_ok!(LocalCluster::new(1, test_config()));
    let fragment = assert_ok!(PlanFragment::new(
        StageId(0),
        PlanNode::Values {
            id: PlanNodeId(1),
            output_types: vec![ColumnType::Int64, ColumnType::Utf8],
            rows: vec![
                vec![Value::Int64(1), Value::Utf8("a".to_string())],
                vec![Value::Int64(2), Value::Null],
            ],
        },
        PartitioningHandle::Single,
        OutputPartitioning::Single,
    ));
    let result = assert_ok!(cluster.query_runner().run(
        &SubPlan::leaf(fragment),
        HashMap::new(),
        TIMEOUT,
    ));
    assert_eq!(result.row_count(), 2);
    assert_eq!(longs(&result.pages, 0), vec![1, 2]);
}

#[test]
fn test_transient_transport_failures_are_retried() {
    let cluster = assert_ok!(LocalCluster::new(3, test_config()));
    for node in ["node-0", "node-1", "node-2"] {
        cluster.transport().fail_next_calls(&NodeId::new(node), 2);
    }
    let result = assert_ok!(cluster.query_runner().run(
        &filtered_count_and_sum_plan(5),
        sequence_sources(100, 10),
        TIMEOUT,
    ));
    assert_eq!(longs(&result.pages, 0), vec![20]);
    assert_eq!(longs(&result.pages, 1), vec![950]);
}

#[test]
fn test_killed_node_receives_no_tasks() {
    let cluster = assert_ok!(LocalCluster::new(3, test_config()));
    let dead = NodeId::new("node-2");
    cluster.kill_node(&dead);
    assert!(!cluster.node_manager().get_all_nodes().is_active(&dead));

    let result = assert_ok!(cluster.query_runner().run(
        &filtered_count_and_sum_plan(3),
        sequence_sources(100, 10),
        TIMEOUT,
    ));
    assert_eq!(longs(&result.pages, 0), vec![34]);
    let node = cluster.node(&dead).expect("killed node still exists");
    assert!(node.task_manager().task_ids().is_empty());
}

#[test]
fn test_connector_failure_fails_the_query() {
    let cluster = assert_ok!(LocalCluster::new(2, test_config()));
    let source = assert_ok!(BufferedSplitSource::from_splits(
        sequence::CATALOG,
        vec![sequence::split(0, 10), sequence::split(20, 10)],
    ));
    let mut sources: HashMap<_, std::sync::Arc<dyn SplitSource>> = HashMap::new();
    sources.insert(StageId(2), std::sync::Arc::new(source));

    let err = assert_err!(cluster.query_runner().run(
        &filtered_count_and_sum_plan(3),
        sources,
        TIMEOUT,
    ));
    assert_eq!(err.code(), ErrorCode::ConnectorError);

    // Every task of the failed query ends up in a terminal state.
    let all_done = common::wait_for(
        || {
            cluster.nodes().iter().all(|node| {
                node.task_manager()
                    .all_task_status()
                    .iter()
                    .all(|status| status.is_done())
            })
        },
        Duration::from_secs(10),
    );
    assert!(all_done);
}
