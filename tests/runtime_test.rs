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
//! Integration tests for runtime components (memory pool, output buffer, exchange client).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use novaexec::common::ids::{NodeId, QueryId, StageId, TaskId};
use novaexec::common::status::Result;
use novaexec::exec::page::{Block, Page};
use novaexec::runtime::exchange_client::{ExchangeClient, ExchangeClientConfig, ExchangeTransport};
use novaexec::runtime::io::IoExecutor;
use novaexec::runtime::memory_pool::MemoryPool;
use novaexec::runtime::output_buffer::{BufferResult, OutputBuffer, OutputBufferState, OutputBuffers};
use novaexec::scheduler::split::TaskLocation;
use novaexec::{ErrorCode, ExecError};

use crate::common::{longs, wait_for};

mod common;

fn page(values: &[i64]) -> Page {
    Page::try_new(vec![Block::from_longs(values.to_vec())]).expect("page")
}

fn task_id(stage: u32, partition: u32) -> TaskId {
    TaskId::new(QueryId::local(), StageId(stage), partition)
}

#[test]
fn test_memory_pool_blocks_until_free() {
    let pool = MemoryPool::new(100);
    let query = QueryId::local();

    let dep = assert_ok!(pool.reserve(&query, "agg", 60));
    assert!(dep.is_ready());
    assert!(!assert_ok!(pool.try_reserve(&query, "agg", 50)));

    let blocked = assert_ok!(pool.reserve(&query, "sort", 50));
    assert!(!blocked.is_ready());
    assert_eq!(pool.free_bytes(), -10);
    assert_eq!(pool.tagged_allocations(&query).get("sort"), Some(&50));

    assert_ok!(pool.free(&query, "agg", 60));
    assert!(blocked.is_ready());
    assert_eq!(pool.query_memory_reservation(&query), 50);

    let err = assert_err!(pool.free(&query, "sort", 51));
    assert_eq!(err.code(), ErrorCode::InvariantViolation);
    assert_ok!(pool.free(&query, "sort", 50));
    assert!(!pool.has_query(&query));
}

#[test]
fn test_output_buffer_tokens_and_completion() {
    let buffer = OutputBuffer::new(task_id(1, 0), "instance-1", OutputBuffers::partitioned(2), 1 << 20, None);
    assert_ok!(buffer.enqueue(0, vec![page(&[1, 2]), page(&[3])]));
    assert_ok!(buffer.enqueue(1, vec![page(&[10])]));
    buffer.set_no_more_pages();

    let first = assert_ok!(buffer.get(0, 0, u64::MAX, Duration::ZERO));
    assert_eq!(first.token, 0);
    assert_eq!(first.next_token, 2);
    assert_eq!(longs(&first.pages, 0), vec![1, 2, 3]);
    assert!(!first.buffer_complete);

    // Re-reading the same token returns the same pages.
    let again = assert_ok!(buffer.get(0, 0, u64::MAX, Duration::ZERO));
    assert_eq!(again.pages.len(), 2);

    let done = assert_ok!(buffer.get(0, 2, u64::MAX, Duration::ZERO));
    assert!(done.pages.is_empty());
    assert!(done.buffer_complete);

    assert_ok!(buffer.destroy(0));
    assert_eq!(buffer.state(), OutputBufferState::Flushing);
    let other = assert_ok!(buffer.get(1, 0, u64::MAX, Duration::ZERO));
    assert_eq!(longs(&other.pages, 0), vec![10]);
    assert_ok!(buffer.destroy(1));
    assert!(buffer.is_finished());

    let info = buffer.info();
    assert_eq!(info.partitions[0].rows_added, 3);
    assert_eq!(info.partitions[1].rows_added, 1);
}

#[test]
fn test_output_buffer_back_pressure() {
    let sample = page(&[1, 2, 3, 4]);
    let limit = sample.retained_size_in_bytes() as i64;
    let buffer = OutputBuffer::new(task_id(1, 0), "instance-1", OutputBuffers::single(), limit, None);
    assert!(buffer.is_full().is_ready());

    assert_ok!(buffer.enqueue(0, vec![sample.clone(), sample]));
    let full = buffer.is_full();
    assert!(!full.is_ready());

    let result = assert_ok!(buffer.get(0, 0, u64::MAX, Duration::ZERO));
    assert_ok!(buffer.acknowledge(0, result.next_token));
    assert!(full.is_ready());
}

/// Serves reads straight from registered output buffers.
#[derive(Default)]
struct BufferTransport {
    buffers: Mutex<HashMap<TaskId, Arc<OutputBuffer>>>,
}

impl BufferTransport {
    fn add(&self, buffer: Arc<OutputBuffer>) -> TaskLocation {
        let location = TaskLocation {
            node_id: NodeId::new("producer"),
            uri: "local://producer".to_string(),
            task_id: buffer.task_id().clone(),
            buffer_id: 0,
        };
        self.buffers
            .lock()
            .unwrap()
            .insert(buffer.task_id().clone(), buffer);
        location
    }

    fn buffer(&self, location: &TaskLocation) -> Result<Arc<OutputBuffer>> {
        self.buffers
            .lock()
            .unwrap()
            .get(&location.task_id)
            .cloned()
            .ok_or_else(|| ExecError::new(ErrorCode::TaskNotFound, location.to_string()))
    }
}

impl ExchangeTransport for BufferTransport {
    fn get_results(
        &self,
        location: &TaskLocation,
        token: u64,
        max_bytes: u64,
        max_wait: Duration,
    ) -> Result<BufferResult> {
        self.buffer(location)?
            .get(location.buffer_id, token, max_bytes, max_wait)
    }

    fn acknowledge_results(&self, location: &TaskLocation, token: u64) -> Result<()> {
        self.buffer(location)?.acknowledge(location.buffer_id, token)
    }

    fn abort_results(&self, location: &TaskLocation) -> Result<()> {
        self.buffer(location)?.destroy(location.buffer_id)
    }
}

#[test]
fn test_exchange_client_merges_producers_and_releases_them() {
    let transport = Arc::new(BufferTransport::default());
    let producers: Vec<Arc<OutputBuffer>> = (0..2)
        .map(|p| OutputBuffer::new(task_id(2, p), format!("instance-{p}"), OutputBuffers::single(), 1 << 20, None))
        .collect();
    let client = ExchangeClient::new(
        ExchangeClientConfig {
            max_wait: Duration::from_millis(20),
            ..ExchangeClientConfig::default()
        },
        transport.clone(),
        Arc::new(IoExecutor::new(2)),
    );
    for producer in &producers {
        assert_ok!(client.add_location(transport.add(Arc::clone(producer))));
    }
    client.no_more_locations();

    assert_ok!(producers[0].enqueue(0, vec![page(&[1, 2])]));
    assert_ok!(producers[1].enqueue(0, vec![page(&[3])]));
    assert_ok!(producers[0].enqueue(0, vec![page(&[4])]));
    for producer in &producers {
        producer.set_no_more_pages();
    }

    let mut pages = Vec::new();
    let drained = wait_for(
        || {
            while let Ok(Some(page)) = client.poll_page() {
                pages.push(page);
            }
            client.is_finished()
        },
        Duration::from_secs(10),
    );
    assert!(drained, "exchange client did not finish");

    let mut values = longs(&pages, 0);
    values.sort();
    assert_eq!(values, vec![1, 2, 3, 4]);
    assert!(wait_for(
        || producers.iter().all(|p| p.is_finished()),
        Duration::from_secs(5)
    ));
    client.close();
}
