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
//! Coordinator-side split sources.
//!
//! Responsibilities:
//! - Buffers splits enumerated by a connector until stage schedulers pull them in batches.
//! - All-at-once mode keeps one queue bounded by estimated bytes; crossing the hard ceiling
//!   fails the source with `ExceededSplitBufferingLimit`. Producers get a back-pressure future
//!   while the soft limit is exceeded.
//! - Bucketed mode keeps one queue per bucket; with `preload` nothing is released until the
//!   producer signals that no more splits will arrive.
//! - Failure poisons every pending and later request with the first error.
//!
//! Key exported interfaces:
//! - Traits: `SplitSource`.
//! - Types: `BufferedSplitSource`, `SplitSourceStats`, `BatchFuture`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::common::future::SettableFuture;
use crate::common::status::{ErrorCode, ExecError, Result};
use crate::novaexec_logging::{debug, warn};
use crate::scheduler::split::{Split, SplitBatch};

pub type BatchFuture = SettableFuture<Result<SplitBatch>>;

pub trait SplitSource: Send + Sync {
    fn catalog(&self) -> &str;

    /// `bucket` must be `Some` exactly for bucketed sources.
    fn get_next_batch(&self, bucket: Option<usize>, max_size: usize) -> BatchFuture;

    fn is_finished(&self) -> bool;

    fn close(&self);

    /// Buckets this source produces; empty for unbucketed sources.
    fn buckets(&self) -> Vec<usize>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    AllAtOnce { soft_limit_bytes: u64, hard_limit_bytes: u64 },
    Bucketed { bucket_count: usize, preload: bool },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSourceStats {
    pub added: u64,
    pub removed: u64,
    pub dropped: u64,
    pub buffered_splits: u64,
    pub buffered_bytes: u64,
    pub failed: bool,
}

struct PendingRequest {
    max_size: usize,
    future: BatchFuture,
}

#[derive(Default)]
struct State {
    queues: BTreeMap<Option<usize>, VecDeque<Split>>,
    pending: BTreeMap<Option<usize>, VecDeque<PendingRequest>>,
    no_more_splits: bool,
    closed: bool,
    failure: Option<ExecError>,
    suppressed_failures: Vec<ExecError>,
    producer_waiter: Option<SettableFuture<()>>,
    stats: SplitSourceStats,
}

pub struct BufferedSplitSource {
    catalog: String,
    mode: Mode,
    state: Mutex<State>,
}

type Completion = (BatchFuture, Result<SplitBatch>);

impl BufferedSplitSource {
    pub fn all_at_once(catalog: impl Into<String>, soft_limit_bytes: u64, hard_limit_bytes: u64) -> Self {
        Self::with_mode(
            catalog,
            Mode::AllAtOnce {
                soft_limit_bytes,
                hard_limit_bytes: hard_limit_bytes.max(soft_limit_bytes),
            },
        )
    }

    pub fn bucketed(catalog: impl Into<String>, bucket_count: usize, preload: bool) -> Self {
        Self::with_mode(
            catalog,
            Mode::Bucketed {
                bucket_count: bucket_count.max(1),
                preload,
            },
        )
    }

    /// All-at-once source already holding every split.
    pub fn from_splits(catalog: impl Into<String>, splits: Vec<Split>) -> Result<Self> {
        let source = Self::all_at_once(catalog, u64::MAX, u64::MAX);
        source.add_to_queue(splits)?;
        source.no_more_splits();
        Ok(source)
    }

    fn with_mode(catalog: impl Into<String>, mode: Mode) -> Self {
        Self {
            catalog: catalog.into(),
            mode,
            state: Mutex::new(State::default()),
        }
    }

    fn releasable(&self, state: &State) -> bool {
        match self.mode {
            Mode::Bucketed { preload: true, .. } => state.no_more_splits,
            _ => true,
        }
    }

    fn queue_key(&self, split: &Split) -> Result<Option<usize>> {
        match self.mode {
            Mode::AllAtOnce { .. } => Ok(None),
            Mode::Bucketed { bucket_count, .. } => match split.bucket {
                Some(bucket) if bucket < bucket_count => Ok(Some(bucket)),
                Some(bucket) => Err(ExecError::invalid_plan(format!(
                    "split bucket {} out of range for {} buckets",
                    bucket, bucket_count
                ))),
                None => Err(ExecError::invalid_plan(
                    "bucketed split source received a split without bucket",
                )),
            },
        }
    }

    /// Buffer `splits`. The returned future is done while the producer may keep adding.
    pub fn add_to_queue(&self, splits: Vec<Split>) -> Result<SettableFuture<()>> {
        let (completions, result) = {
            let mut state = self.state.lock().expect("split source lock");
            if let Some(err) = state.failure.as_ref() {
                return Err(err.clone());
            }
            if state.closed || state.no_more_splits {
                return Err(ExecError::invariant(format!(
                    "split source {} does not accept splits after completion",
                    self.catalog
                )));
            }
            let incoming: u64 = splits.iter().map(|s| s.estimated_size_bytes).sum();
            if let Mode::AllAtOnce { hard_limit_bytes, .. } = self.mode
                && state.stats.buffered_bytes.saturating_add(incoming) > hard_limit_bytes
            {
                let err = ExecError::new(
                    ErrorCode::ExceededSplitBufferingLimit,
                    format!(
                        "split source {} would buffer {} bytes, limit is {}",
                        self.catalog,
                        state.stats.buffered_bytes + incoming,
                        hard_limit_bytes
                    ),
                );
                let completions = self.fail_locked(&mut state, err.clone());
                drop(state);
                complete(completions);
                return Err(err);
            }
            let mut keyed = Vec::with_capacity(splits.len());
            for split in splits {
                keyed.push((self.queue_key(&split)?, split));
            }
            for (key, split) in keyed {
                state.stats.added += 1;
                state.stats.buffered_splits += 1;
                state.stats.buffered_bytes += split.estimated_size_bytes;
                state.queues.entry(key).or_default().push_back(split);
            }
            let completions = self.drain_pending(&mut state);
            let result = match self.mode {
                Mode::AllAtOnce { soft_limit_bytes, .. }
                    if state.stats.buffered_bytes >= soft_limit_bytes =>
                {
                    state
                        .producer_waiter
                        .get_or_insert_with(SettableFuture::new)
                        .clone()
                }
                _ => SettableFuture::completed(()),
            };
            (completions, result)
        };
        complete(completions);
        Ok(result)
    }

    pub fn no_more_splits(&self) {
        let completions = {
            let mut state = self.state.lock().expect("split source lock");
            if state.no_more_splits {
                return;
            }
            state.no_more_splits = true;
            debug!(
                "split source {} complete: added={}",
                self.catalog, state.stats.added
            );
            self.drain_pending(&mut state)
        };
        complete(completions);
    }

    /// First failure wins; buffered splits are dropped and every waiter fails.
    pub fn fail(&self, err: ExecError) {
        let completions = {
            let mut state = self.state.lock().expect("split source lock");
            self.fail_locked(&mut state, err)
        };
        complete(completions);
    }

    fn fail_locked(&self, state: &mut State, err: ExecError) -> Vec<Completion> {
        if state.failure.is_some() {
            debug!("split source {} suppressing later failure: {}", self.catalog, err);
            state.suppressed_failures.push(err);
            return Vec::new();
        }
        warn!("split source {} failed: {}", self.catalog, err);
        let dropped: u64 = state.queues.values().map(|q| q.len() as u64).sum();
        state.queues.clear();
        state.stats.dropped += dropped;
        state.stats.buffered_splits = 0;
        state.stats.buffered_bytes = 0;
        state.stats.failed = true;
        state.failure = Some(err.clone());
        if let Some(waiter) = state.producer_waiter.take() {
            waiter.set(());
        }
        std::mem::take(&mut state.pending)
            .into_values()
            .flatten()
            .map(|request| (request.future, Err(err.clone())))
            .collect()
    }

    pub fn failure(&self) -> Option<ExecError> {
        self.state.lock().expect("split source lock").failure.clone()
    }

    pub fn suppressed_failures(&self) -> Vec<ExecError> {
        self.state
            .lock()
            .expect("split source lock")
            .suppressed_failures
            .clone()
    }

    pub fn stats(&self) -> SplitSourceStats {
        self.state.lock().expect("split source lock").stats.clone()
    }

    /// Satisfy queued requests in arrival order as far as the buffered splits allow.
    /// Requests whose caller dropped the future are discarded, so their splits stay queued.
    fn drain_pending(&self, state: &mut State) -> Vec<Completion> {
        let mut completions = Vec::new();
        let keys: Vec<_> = state.pending.keys().copied().collect();
        for key in keys {
            loop {
                if let Some(queue) = state.pending.get_mut(&key) {
                    while queue.front().is_some_and(|r| r.future.is_abandoned()) {
                        queue.pop_front();
                    }
                }
                let Some(max_size) = state
                    .pending
                    .get(&key)
                    .and_then(|q| q.front())
                    .map(|r| r.max_size)
                else {
                    break;
                };
                let Some(batch) = self.try_take(state, key, max_size) else {
                    break;
                };
                if let Some(request) = state.pending.get_mut(&key).and_then(|q| q.pop_front()) {
                    completions.push((request.future, Ok(batch)));
                }
            }
            if state.pending.get(&key).is_some_and(|q| q.is_empty()) {
                state.pending.remove(&key);
            }
        }
        completions
    }

    fn try_take(&self, state: &mut State, key: Option<usize>, max_size: usize) -> Option<SplitBatch> {
        if state.closed {
            return Some(SplitBatch {
                splits: Vec::new(),
                last_batch: true,
            });
        }
        let available = state.queues.get(&key).map_or(0, VecDeque::len);
        if available == 0 && !state.no_more_splits {
            return None;
        }
        if available > 0 && !self.releasable(state) {
            return None;
        }
        let take = available.min(max_size.max(1));
        let splits: Vec<Split> = match state.queues.get_mut(&key) {
            Some(queue) => queue.drain(..take).collect(),
            None => Vec::new(),
        };
        let bytes: u64 = splits.iter().map(|s| s.estimated_size_bytes).sum();
        state.stats.removed += splits.len() as u64;
        state.stats.buffered_splits -= splits.len() as u64;
        state.stats.buffered_bytes -= bytes;
        if let Mode::AllAtOnce { soft_limit_bytes, .. } = self.mode
            && state.stats.buffered_bytes < soft_limit_bytes
            && let Some(waiter) = state.producer_waiter.take()
        {
            waiter.set(());
        }
        let last_batch =
            state.no_more_splits && state.queues.get(&key).is_none_or(VecDeque::is_empty);
        Some(SplitBatch { splits, last_batch })
    }
}

fn complete(completions: Vec<Completion>) {
    for (future, result) in completions {
        future.set(result);
    }
}

impl SplitSource for BufferedSplitSource {
    fn catalog(&self) -> &str {
        &self.catalog
    }

    fn get_next_batch(&self, bucket: Option<usize>, max_size: usize) -> BatchFuture {
        let mut state = self.state.lock().expect("split source lock");
        if let Some(err) = state.failure.as_ref() {
            return SettableFuture::completed(Err(err.clone()));
        }
        let valid = match self.mode {
            Mode::AllAtOnce { .. } => bucket.is_none(),
            Mode::Bucketed { bucket_count, .. } => bucket.is_some_and(|b| b < bucket_count),
        };
        if !valid {
            return SettableFuture::completed(Err(ExecError::invalid_plan(format!(
                "split source {} cannot serve bucket {:?}",
                self.catalog, bucket
            ))));
        }
        if let Some(queue) = state.pending.get_mut(&bucket) {
            queue.retain(|r| !r.future.is_abandoned());
        }
        let has_waiters = state.pending.get(&bucket).is_some_and(|q| !q.is_empty());
        if !has_waiters
            && let Some(batch) = self.try_take(&mut state, bucket, max_size)
        {
            return SettableFuture::completed(Ok(batch));
        }
        let future = SettableFuture::new();
        state
            .pending
            .entry(bucket)
            .or_default()
            .push_back(PendingRequest {
                max_size,
                future: future.clone(),
            });
        future
    }

    fn is_finished(&self) -> bool {
        let state = self.state.lock().expect("split source lock");
        state.closed
            || (state.failure.is_none()
                && state.no_more_splits
                && state.queues.values().all(VecDeque::is_empty))
    }

    fn close(&self) {
        let completions = {
            let mut state = self.state.lock().expect("split source lock");
            if state.closed {
                return;
            }
            state.closed = true;
            let dropped: u64 = state.queues.values().map(|q| q.len() as u64).sum();
            state.queues.clear();
            state.stats.dropped += dropped;
            state.stats.buffered_splits = 0;
            state.stats.buffered_bytes = 0;
            if let Some(waiter) = state.producer_waiter.take() {
                waiter.set(());
            }
            std::mem::take(&mut state.pending)
                .into_values()
                .flatten()
                .map(|request| {
                    let batch = SplitBatch {
                        splits: Vec::new(),
                        last_batch: true,
                    };
                    (request.future, Ok(batch))
                })
                .collect::<Vec<_>>()
        };
        complete(completions);
    }

    fn buckets(&self) -> Vec<usize> {
        match self.mode {
            Mode::AllAtOnce { .. } => Vec::new(),
            Mode::Bucketed { bucket_count, .. } => (0..bucket_count).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn split(id: i64, bytes: u64) -> Split {
        Split::new("sequence", serde_json::json!({"start": id, "end": id + 1}))
            .with_estimated_size(bytes)
    }

    fn start(s: &Split) -> i64 {
        s.info["start"].as_i64().unwrap()
    }

    #[test]
    fn counters_balance_additions_removals_and_drops() {
        let source = BufferedSplitSource::all_at_once("sequence", 1_000, 10_000);
        source.add_to_queue((0..5).map(|i| split(i, 10)).collect()).unwrap();
        let batch = source.get_next_batch(None, 2).try_get().unwrap().unwrap();
        assert_eq!(batch.splits.iter().map(start).collect::<Vec<_>>(), vec![0, 1]);
        let stats = source.stats();
        assert_eq!(stats.buffered_splits, stats.added - stats.removed - stats.dropped);
        source.fail(ExecError::internal("boom"));
        let stats = source.stats();
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.buffered_splits, stats.added - stats.removed - stats.dropped);
    }

    #[test]
    fn exceeding_hard_limit_fails_with_resource_error() {
        let source = BufferedSplitSource::all_at_once("sequence", 50, 100);
        let backpressure = source.add_to_queue(vec![split(0, 60)]).unwrap();
        assert!(!backpressure.is_done());
        let err = source.add_to_queue(vec![split(1, 60)]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExceededSplitBufferingLimit);
        assert!(backpressure.is_done());
        let err = source.get_next_batch(None, 10).try_get().unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExceededSplitBufferingLimit);
    }

    #[test]
    fn producer_backpressure_released_when_drained() {
        let source = BufferedSplitSource::all_at_once("sequence", 50, 1_000);
        let backpressure = source.add_to_queue(vec![split(0, 30), split(1, 30)]).unwrap();
        assert!(!backpressure.is_done());
        source.get_next_batch(None, 1).try_get().unwrap().unwrap();
        assert!(backpressure.is_done());
    }

    #[test]
    fn blocked_consumer_completes_once_when_split_arrives() {
        let source = BufferedSplitSource::all_at_once("sequence", 1_000, 1_000);
        let future = source.get_next_batch(None, 10);
        assert!(!future.is_done());
        source.add_to_queue(vec![split(7, 1)]).unwrap();
        let batch = future.wait_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(batch.splits.iter().map(start).collect::<Vec<_>>(), vec![7]);
        assert!(!batch.last_batch);
        source.no_more_splits();
        let last = source.get_next_batch(None, 10).try_get().unwrap().unwrap();
        assert!(last.splits.is_empty() && last.last_batch);
        assert!(source.is_finished());
    }

    #[test]
    fn first_failure_poisons_pending_and_later_requests() {
        let source = BufferedSplitSource::all_at_once("sequence", 1_000, 1_000);
        let pending = source.get_next_batch(None, 10);
        source.fail(ExecError::new(ErrorCode::ConnectorError, "first"));
        source.fail(ExecError::new(ErrorCode::GenericInternalError, "second"));
        let err = pending.try_get().unwrap().unwrap_err();
        assert_eq!(err.message, "first");
        let later = source.get_next_batch(None, 10).try_get().unwrap().unwrap_err();
        assert_eq!(later.code(), ErrorCode::ConnectorError);
        assert_eq!(source.suppressed_failures().len(), 1);
        assert!(source.add_to_queue(vec![split(0, 1)]).is_err());
    }

    #[test]
    fn preload_holds_every_bucket_until_no_more_splits() {
        let source = BufferedSplitSource::bucketed("sequence", 2, true);
        let bucket0 = source.get_next_batch(Some(0), 10);
        source
            .add_to_queue(vec![split(0, 1).with_bucket(0), split(1, 1).with_bucket(1)])
            .unwrap();
        assert!(!bucket0.is_done());
        let bucket1 = source.get_next_batch(Some(1), 10);
        assert!(!bucket1.is_done());
        source.no_more_splits();
        let batch = bucket0.try_get().unwrap().unwrap();
        assert_eq!(batch.splits.iter().map(start).collect::<Vec<_>>(), vec![0]);
        assert!(batch.last_batch);
        let batch = bucket1.try_get().unwrap().unwrap();
        assert_eq!(batch.splits.iter().map(start).collect::<Vec<_>>(), vec![1]);
        assert_eq!(source.buckets(), vec![0, 1]);
    }

    #[test]
    fn dropped_request_leaves_its_splits_queued() {
        let source = BufferedSplitSource::all_at_once("sequence", 1_000, 1_000);
        drop(source.get_next_batch(None, 10));
        let kept = source.get_next_batch(None, 1);
        source.add_to_queue(vec![split(0, 1), split(1, 1)]).unwrap();
        let batch = kept.try_get().unwrap().unwrap();
        assert_eq!(batch.splits.iter().map(start).collect::<Vec<_>>(), vec![0]);
        let batch = source.get_next_batch(None, 10).try_get().unwrap().unwrap();
        assert_eq!(batch.splits.iter().map(start).collect::<Vec<_>>(), vec![1]);
        let stats = source.stats();
        assert_eq!(stats.removed, 2);
        assert_eq!(stats.buffered_splits, 0);
    }

    #[test]
    fn bucketed_without_preload_releases_immediately() {
        let source = BufferedSplitSource::bucketed("sequence", 2, false);
        source.add_to_queue(vec![split(3, 1).with_bucket(1)]).unwrap();
        let batch = source.get_next_batch(Some(1), 10).try_get().unwrap().unwrap();
        assert_eq!(batch.splits.len(), 1);
        assert!(!batch.last_batch);
        assert!(source.add_to_queue(vec![split(4, 1)]).is_err());
    }
}
