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
//! Local exchange buffer and partitioning implementation.
//!
//! Responsibilities:
//! - Routes pages between pipelines of one task by single, hash, round-robin or broadcast policy.
//! - Maintains per-partition FIFO queues charged to a `LocalExchangeMemoryManager`.
//! - Tracks producer and consumer counts; the exchange is done for a partition once every
//!   producer finished and the partition queue is empty.
//!
//! Key exported interfaces:
//! - Types: `LocalExchanger`, `LocalExchangeStats`, `LocalExchangePartitionStats`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::status::{ExecError, Result};
use crate::exec::hash::{HashPartitionFunction, LOCAL_PARTITION_SEED};
use crate::exec::page::Page;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::exec::pipeline::local_exchange_memory_manager::LocalExchangeMemoryManager;
use crate::exec::pipeline::schedule::observer::Observable;
use crate::exec::plan::LocalPartitioning;
use crate::novaexec_logging::debug;

static NEXT_EXCHANGE_ID: AtomicUsize = AtomicUsize::new(1);
const LOCAL_EXCHANGE_NOTIFY_LOG_EVERY: u64 = 1024;
static LOCAL_EXCHANGE_NOTIFY_LOG_COUNT: AtomicU64 = AtomicU64::new(0);

fn should_log_notify() -> bool {
    LOCAL_EXCHANGE_NOTIFY_LOG_COUNT
        .fetch_add(1, Ordering::Relaxed)
        .is_multiple_of(LOCAL_EXCHANGE_NOTIFY_LOG_EVERY)
}

enum Router {
    Single,
    Hash(HashPartitionFunction),
    RoundRobin(AtomicUsize),
    Broadcast,
}

#[derive(Default)]
struct PartitionCounters {
    pushed_rows: AtomicU64,
    popped_rows: AtomicU64,
    pushed_pages: AtomicU64,
    popped_pages: AtomicU64,
}

/// In-process exchange buffer shared by the sink drivers and source drivers of one exchange.
pub struct LocalExchanger {
    exchange_id: usize,
    partition_count: usize,
    router: Router,
    partitions: Mutex<Vec<VecDeque<Page>>>,
    memory_manager: LocalExchangeMemoryManager,
    source_observable: Arc<Observable>,
    sink_observable: Arc<Observable>,
    remaining_producers: AtomicUsize,
    finished_sources: AtomicUsize,
    counters: Vec<PartitionCounters>,
}

impl LocalExchanger {
    pub fn new(
        partitioning: &LocalPartitioning,
        partition_count: usize,
        producer_count: usize,
        buffer_limit_per_driver: i64,
    ) -> Result<Arc<Self>> {
        let partition_count = partition_count.max(1);
        let router = match partitioning {
            LocalPartitioning::Single => {
                if partition_count != 1 {
                    return Err(ExecError::invalid_plan(format!(
                        "single local exchange with {} consumers",
                        partition_count
                    )));
                }
                Router::Single
            }
            LocalPartitioning::Hash(keys) => Router::Hash(HashPartitionFunction::new(
                partition_count,
                keys.clone(),
                LOCAL_PARTITION_SEED,
            )?),
            LocalPartitioning::RoundRobin => Router::RoundRobin(AtomicUsize::new(0)),
            LocalPartitioning::Broadcast => Router::Broadcast,
        };
        let exchange_id = NEXT_EXCHANGE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            "LocalExchanger created: exchange_id={} partitioning={:?} partitions={} producers={}",
            exchange_id, partitioning, partition_count, producer_count
        );
        Ok(Arc::new(Self {
            exchange_id,
            partition_count,
            router,
            partitions: Mutex::new((0..partition_count).map(|_| VecDeque::new()).collect()),
            memory_manager: LocalExchangeMemoryManager::new(
                producer_count.max(1),
                buffer_limit_per_driver,
                i64::MAX,
            ),
            source_observable: Arc::new(Observable::new()),
            sink_observable: Arc::new(Observable::new()),
            remaining_producers: AtomicUsize::new(producer_count.max(1)),
            finished_sources: AtomicUsize::new(0),
            counters: (0..partition_count)
                .map(|_| PartitionCounters::default())
                .collect(),
        }))
    }

    pub fn exchange_id(&self) -> usize {
        self.exchange_id
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    pub fn remaining_producers(&self) -> usize {
        self.remaining_producers.load(Ordering::Acquire)
    }

    pub fn is_all_sources_finished(&self) -> bool {
        self.finished_sources.load(Ordering::Acquire) >= self.partition_count
    }

    pub fn is_full(&self) -> bool {
        self.memory_manager.is_full()
    }

    pub fn wait_for_writing(&self) -> DependencyHandle {
        self.memory_manager.wait_for_writing()
    }

    pub fn buffered_bytes(&self) -> i64 {
        self.memory_manager.memory_usage()
    }

    /// Returns true when this call retired the last producer.
    pub fn finish_producer(&self) -> bool {
        let notify = self.source_observable.defer_notify();
        let mut current = self.remaining_producers.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return true;
            }
            let next = current - 1;
            match self.remaining_producers.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    if next == 0 {
                        debug!(
                            "LocalExchange all producers finished: exchange_id={}",
                            self.exchange_id
                        );
                        notify.arm();
                        return true;
                    }
                    return false;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// A consumer left; once every consumer has left, buffered pages are dropped and
    /// producers are released.
    pub fn finish_source(&self) {
        let finished = self.finished_sources.fetch_add(1, Ordering::AcqRel) + 1;
        if finished < self.partition_count {
            return;
        }
        let notify = self.sink_observable.defer_notify();
        {
            let mut guard = self.partitions.lock().expect("local exchanger lock");
            for queue in guard.iter_mut() {
                queue.clear();
            }
            self.memory_manager.clear();
        }
        notify.arm();
    }

    pub fn accept(&self, page: Page) -> Result<()> {
        if page.is_empty() || self.is_all_sources_finished() {
            return Ok(());
        }
        match &self.router {
            Router::Single => self.push_to_partition(0, page),
            Router::RoundRobin(next) => {
                let partition = next.fetch_add(1, Ordering::Relaxed) % self.partition_count;
                self.push_to_partition(partition, page);
            }
            Router::Broadcast => {
                for partition in 0..self.partition_count {
                    self.push_to_partition(partition, page.clone());
                }
            }
            Router::Hash(function) => {
                for (partition, part) in function.partition_page(&page)? {
                    self.push_to_partition(partition, part);
                }
            }
        }
        Ok(())
    }

    pub fn pop_page(&self, partition: usize) -> Option<Page> {
        let notify = self.sink_observable.defer_notify();
        let page = {
            let mut guard = self.partitions.lock().expect("local exchanger lock");
            let was_full = self.memory_manager.is_full();
            let page = guard.get_mut(partition)?.pop_front();
            if let Some(p) = page.as_ref() {
                self.memory_manager.update_memory_usage(
                    -(p.retained_size_in_bytes() as i64),
                    -(p.position_count() as i64),
                );
            }
            if was_full && !self.memory_manager.is_full() {
                notify.arm();
            }
            page
        };
        if let Some(p) = page.as_ref()
            && let Some(counter) = self.counters.get(partition)
        {
            counter
                .popped_rows
                .fetch_add(p.position_count() as u64, Ordering::Relaxed);
            counter.popped_pages.fetch_add(1, Ordering::Relaxed);
        }
        page
    }

    pub fn has_pages(&self, partition: usize) -> bool {
        let guard = self.partitions.lock().expect("local exchanger lock");
        guard.get(partition).is_some_and(|q| !q.is_empty())
    }

    pub fn is_done(&self, partition: usize) -> bool {
        self.remaining_producers() == 0 && !self.has_pages(partition)
    }

    pub fn source_observable(&self) -> Arc<Observable> {
        Arc::clone(&self.source_observable)
    }

    pub fn sink_observable(&self) -> Arc<Observable> {
        Arc::clone(&self.sink_observable)
    }

    pub fn stats_snapshot(&self) -> LocalExchangeStats {
        let guard = self.partitions.lock().expect("local exchanger lock");
        let partitions = self
            .counters
            .iter()
            .enumerate()
            .map(|(idx, c)| LocalExchangePartitionStats {
                partition: idx,
                pushed_rows: c.pushed_rows.load(Ordering::Relaxed),
                popped_rows: c.popped_rows.load(Ordering::Relaxed),
                pushed_pages: c.pushed_pages.load(Ordering::Relaxed),
                popped_pages: c.popped_pages.load(Ordering::Relaxed),
                buffered_pages: guard.get(idx).map(|q| q.len()).unwrap_or(0),
            })
            .collect();
        LocalExchangeStats {
            exchange_id: self.exchange_id,
            remaining_producers: self.remaining_producers(),
            buffered_bytes: self.memory_manager.memory_usage(),
            peak_buffered_bytes: self.memory_manager.peak_memory_usage(),
            partitions,
        }
    }

    fn push_to_partition(&self, partition: usize, page: Page) {
        let notify = self.source_observable.defer_notify();
        let rows = page.position_count();
        if let Some(counter) = self.counters.get(partition) {
            counter.pushed_rows.fetch_add(rows as u64, Ordering::Relaxed);
            counter.pushed_pages.fetch_add(1, Ordering::Relaxed);
        }
        let buffered_after = {
            let mut guard = self.partitions.lock().expect("local exchanger lock");
            let Some(queue) = guard.get_mut(partition) else {
                return;
            };
            self.memory_manager
                .update_memory_usage(page.retained_size_in_bytes() as i64, rows as i64);
            queue.push_back(page);
            queue.len()
        };
        if should_log_notify() {
            debug!(
                "LocalExchange notify source: exchange_id={} partition={} buffered_pages={} remaining_producers={}",
                self.exchange_id,
                partition,
                buffered_after,
                self.remaining_producers()
            );
        }
        notify.arm();
    }
}

/// Per-partition queue statistics reported by local exchange.
#[derive(Clone, Debug)]
pub struct LocalExchangePartitionStats {
    pub partition: usize,
    pub pushed_rows: u64,
    pub popped_rows: u64,
    pub pushed_pages: u64,
    pub popped_pages: u64,
    pub buffered_pages: usize,
}

/// Aggregated local-exchange queue and memory statistics.
#[derive(Clone, Debug)]
pub struct LocalExchangeStats {
    pub exchange_id: usize,
    pub remaining_producers: usize,
    pub buffered_bytes: i64,
    pub peak_buffered_bytes: i64,
    pub partitions: Vec<LocalExchangePartitionStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::page::Block;

    fn page(values: Vec<i64>) -> Page {
        Page::try_new(vec![Block::from_longs(values)]).unwrap()
    }

    fn drain(exchanger: &LocalExchanger, partition: usize) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(p) = exchanger.pop_page(partition) {
            for pos in 0..p.position_count() {
                out.push(p.block(0).unwrap().get_long(pos).unwrap());
            }
        }
        out
    }

    #[test]
    fn hash_routing_is_deterministic_and_complete() {
        let exchanger =
            LocalExchanger::new(&LocalPartitioning::Hash(vec![0]), 3, 1, 1 << 20).unwrap();
        exchanger.accept(page((0..30).collect())).unwrap();
        exchanger.accept(page((0..30).collect())).unwrap();
        let mut all = Vec::new();
        for partition in 0..3 {
            let rows = drain(&exchanger, partition);
            // every key lands in exactly one partition, twice
            for key in &rows {
                assert_eq!(rows.iter().filter(|k| *k == key).count(), 2);
            }
            all.extend(rows);
        }
        all.sort();
        assert_eq!(all.len(), 60);
        assert!(!exchanger.is_done(0));
        assert!(exchanger.finish_producer());
        assert!(exchanger.is_done(0));
    }

    #[test]
    fn broadcast_and_round_robin() {
        let broadcast = LocalExchanger::new(&LocalPartitioning::Broadcast, 2, 1, 1 << 20).unwrap();
        broadcast.accept(page(vec![1, 2])).unwrap();
        assert_eq!(drain(&broadcast, 0), vec![1, 2]);
        assert_eq!(drain(&broadcast, 1), vec![1, 2]);

        let rr = LocalExchanger::new(&LocalPartitioning::RoundRobin, 2, 1, 1 << 20).unwrap();
        for v in 0..4 {
            rr.accept(page(vec![v])).unwrap();
        }
        assert_eq!(drain(&rr, 0), vec![0, 2]);
        assert_eq!(drain(&rr, 1), vec![1, 3]);
    }

    #[test]
    fn writers_block_until_pages_are_consumed() {
        let exchanger = LocalExchanger::new(&LocalPartitioning::Single, 1, 1, 64).unwrap();
        let dep = exchanger.wait_for_writing();
        exchanger.accept(page((0..64).collect())).unwrap();
        assert!(exchanger.is_full());
        assert!(!dep.is_ready());
        exchanger.pop_page(0).unwrap();
        assert!(dep.is_ready());
        assert_eq!(exchanger.buffered_bytes(), 0);
    }

    #[test]
    fn consumers_leaving_release_producers() {
        let exchanger = LocalExchanger::new(&LocalPartitioning::Single, 1, 1, 64).unwrap();
        exchanger.accept(page((0..64).collect())).unwrap();
        assert!(exchanger.is_full());
        exchanger.finish_source();
        assert!(!exchanger.is_full());
        assert!(exchanger.is_all_sources_finished());
    }
}
