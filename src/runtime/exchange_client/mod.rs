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
//! Remote exchange client.
//!
//! Responsibilities:
//! - Pulls pages from every producer location feeding one exchange source, one
//!   `PageBufferClient` per location with at most one request in flight each.
//! - Buffers received pages up to a byte limit and only schedules new reads while below it.
//! - Surfaces the first unrecoverable transport failure to the consuming operator.
//!
//! Key exported interfaces:
//! - Traits: `ExchangeTransport`.
//! - Types: `ExchangeClient`, `ExchangeClientConfig`, `ExchangeClientStatus`.

pub mod backoff;
mod page_buffer_client;

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::app_config::RuntimeConfig;
use crate::common::status::{ExecError, Result};
use crate::exec::page::Page;
use crate::exec::pipeline::schedule::observer::Observable;
use crate::novaexec_logging::{debug, info};
use crate::runtime::io::{IoExecutor, IoTaskHandle};
use crate::runtime::output_buffer::BufferResult;
use crate::scheduler::split::TaskLocation;

use backoff::Backoff;
pub use page_buffer_client::PageBufferClientStatus;
use page_buffer_client::{PageBufferClient, RequestOutcome};

/// Wire operations against a producer's output buffer.
pub trait ExchangeTransport: Send + Sync {
    /// Read pages starting at `token`; implicitly acknowledges everything before it.
    fn get_results(
        &self,
        location: &TaskLocation,
        token: u64,
        max_bytes: u64,
        max_wait: Duration,
    ) -> Result<BufferResult>;

    fn acknowledge_results(&self, location: &TaskLocation, token: u64) -> Result<()>;

    /// Destroy the consumer's buffer on the producer. Must be idempotent.
    fn abort_results(&self, location: &TaskLocation) -> Result<()>;
}

#[derive(Clone, Copy, Debug)]
pub struct ExchangeClientConfig {
    pub max_buffered_bytes: u64,
    pub max_response_bytes: u64,
    pub max_wait: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub max_error_duration: Duration,
}

impl Default for ExchangeClientConfig {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for ExchangeClientConfig {
    fn from(cfg: &RuntimeConfig) -> Self {
        Self {
            max_buffered_bytes: cfg.exchange_max_buffered_bytes as u64,
            max_response_bytes: cfg.exchange_max_response_bytes as u64,
            max_wait: cfg.exchange_max_wait(),
            min_backoff: Duration::from_millis(cfg.exchange_min_backoff_ms),
            max_backoff: Duration::from_millis(cfg.exchange_max_backoff_ms),
            max_error_duration: cfg.exchange_max_error_duration(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeClientStatus {
    pub buffered_bytes: u64,
    pub buffered_pages: usize,
    pub no_more_locations: bool,
    pub closed: bool,
    pub clients: Vec<PageBufferClientStatus>,
}

struct Inner {
    clients: Vec<Arc<PageBufferClient>>,
    locations: HashSet<TaskLocation>,
    no_more_locations: bool,
    pages: VecDeque<Page>,
    buffered_bytes: u64,
    failure: Option<ExecError>,
    closed: bool,
    requests: Vec<IoTaskHandle>,
}

pub struct ExchangeClient {
    config: ExchangeClientConfig,
    transport: Arc<dyn ExchangeTransport>,
    io: Arc<IoExecutor>,
    inner: Mutex<Inner>,
    observable: Arc<Observable>,
}

impl ExchangeClient {
    pub fn new(
        config: ExchangeClientConfig,
        transport: Arc<dyn ExchangeTransport>,
        io: Arc<IoExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            io,
            inner: Mutex::new(Inner {
                clients: Vec::new(),
                locations: HashSet::new(),
                no_more_locations: false,
                pages: VecDeque::new(),
                buffered_bytes: 0,
                failure: None,
                closed: false,
                requests: Vec::new(),
            }),
            observable: Arc::new(Observable::new()),
        })
    }

    /// Register a producer location; duplicates are ignored.
    pub fn add_location(self: &Arc<Self>, location: TaskLocation) -> Result<()> {
        {
            let mut inner = self.inner.lock().expect("exchange client lock");
            if inner.closed || inner.locations.contains(&location) {
                return Ok(());
            }
            if inner.no_more_locations {
                return Err(ExecError::invariant(format!(
                    "location {} added after no more locations",
                    location
                )));
            }
            debug!("exchange client added location {}", location);
            inner.locations.insert(location.clone());
            let backoff = Backoff::new(
                self.config.min_backoff,
                self.config.max_backoff,
                self.config.max_error_duration,
            );
            inner.clients.push(Arc::new(PageBufferClient::new(
                location,
                backoff,
                self.config.max_response_bytes,
                self.config.max_wait,
            )));
        }
        self.schedule();
        Ok(())
    }

    pub fn no_more_locations(&self) {
        let notify = self.observable.defer_notify();
        let mut inner = self.inner.lock().expect("exchange client lock");
        if !inner.no_more_locations {
            inner.no_more_locations = true;
            notify.arm();
        }
    }

    pub fn has_no_more_locations(&self) -> bool {
        self.inner.lock().expect("exchange client lock").no_more_locations
    }

    /// Next buffered page; `Err` once any producer failed unrecoverably.
    pub fn poll_page(self: &Arc<Self>) -> Result<Option<Page>> {
        let page = {
            let mut inner = self.inner.lock().expect("exchange client lock");
            if let Some(err) = inner.failure.as_ref() {
                return Err(err.clone());
            }
            let page = inner.pages.pop_front();
            if let Some(page) = page.as_ref() {
                let bytes = page.retained_size_in_bytes() as u64;
                inner.buffered_bytes = inner.buffered_bytes.saturating_sub(bytes);
            }
            page
        };
        if page.is_some() {
            self.schedule();
        }
        Ok(page)
    }

    pub fn has_output(&self) -> bool {
        let inner = self.inner.lock().expect("exchange client lock");
        inner.failure.is_some() || !inner.pages.is_empty()
    }

    /// All locations known, every one drained and deleted, nothing left to poll.
    pub fn is_finished(&self) -> bool {
        let inner = self.inner.lock().expect("exchange client lock");
        if inner.failure.is_some() {
            return false;
        }
        inner.closed
            || (inner.no_more_locations
                && inner.pages.is_empty()
                && inner.clients.iter().all(|c| c.is_finished()))
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.inner.lock().expect("exchange client lock").buffered_bytes
    }

    pub fn observable(&self) -> Arc<Observable> {
        Arc::clone(&self.observable)
    }

    /// Drop buffered pages and release every producer buffer that was not yet deleted.
    pub fn close(&self) {
        let notify = self.observable.defer_notify();
        let (to_release, requests) = {
            let mut inner = self.inner.lock().expect("exchange client lock");
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.pages.clear();
            inner.buffered_bytes = 0;
            let to_release: Vec<_> = inner
                .clients
                .iter()
                .filter(|c| c.close())
                .map(Arc::clone)
                .collect();
            (to_release, std::mem::take(&mut inner.requests))
        };
        for handle in requests {
            handle.cancel();
        }
        for client in to_release {
            let transport = Arc::clone(&self.transport);
            // best effort: the producer also drops abandoned buffers
            self.io.submit(move |_ctx| {
                if let Err(err) = transport.abort_results(client.location()) {
                    debug!("release of {} failed: {}", client.location(), err);
                }
            });
        }
        notify.arm();
    }

    pub fn status(&self) -> ExchangeClientStatus {
        let inner = self.inner.lock().expect("exchange client lock");
        ExchangeClientStatus {
            buffered_bytes: inner.buffered_bytes,
            buffered_pages: inner.pages.len(),
            no_more_locations: inner.no_more_locations,
            closed: inner.closed,
            clients: inner.clients.iter().map(|c| c.status()).collect(),
        }
    }

    fn schedule(self: &Arc<Self>) {
        let mut inner = self.inner.lock().expect("exchange client lock");
        if inner.closed || inner.failure.is_some() {
            return;
        }
        inner.requests.retain(|h| !h.is_finished());
        if inner.buffered_bytes >= self.config.max_buffered_bytes {
            return;
        }
        let ready: Vec<_> = inner
            .clients
            .iter()
            .filter(|c| c.try_start_request())
            .map(Arc::clone)
            .collect();
        for client in ready {
            let me = Arc::clone(self);
            let handle = self.io.submit(move |ctx| {
                let outcome = client.process(me.transport.as_ref(), &ctx);
                // pages are appended before the client can issue its next read
                let more = me.handle_outcome(&client, outcome);
                client.request_done();
                if more {
                    me.schedule();
                }
            });
            inner.requests.push(handle);
        }
    }

    /// Returns whether more requests should be scheduled.
    fn handle_outcome(&self, client: &PageBufferClient, outcome: RequestOutcome) -> bool {
        let notify = self.observable.defer_notify();
        let mut inner = self.inner.lock().expect("exchange client lock");
        match outcome {
            RequestOutcome::Pages { pages, bytes } => {
                if inner.closed {
                    return false;
                }
                if !pages.is_empty() {
                    inner.pages.extend(pages);
                    inner.buffered_bytes += bytes;
                    notify.arm();
                }
                true
            }
            RequestOutcome::Finished => {
                notify.arm();
                if inner.no_more_locations && inner.clients.iter().all(|c| c.is_finished()) {
                    info!(
                        "exchange client finished reading {} locations",
                        inner.clients.len()
                    );
                }
                false
            }
            RequestOutcome::Retry => true,
            RequestOutcome::Failed(err) => {
                debug!("exchange client failed on {}: {}", client.location(), err);
                if inner.failure.is_none() {
                    inner.failure = Some(err);
                }
                notify.arm();
                false
            }
            RequestOutcome::Closed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::{NodeId, QueryId, StageId, TaskId};
    use crate::common::status::ErrorCode;
    use crate::exec::page::Block;
    use crate::runtime::output_buffer::{OutputBuffer, OutputBuffers};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct BufferTransport {
        buffers: HashMap<TaskId, Arc<OutputBuffer>>,
        failures_left: AtomicUsize,
        always_fail: bool,
        aborts: AtomicUsize,
    }

    impl BufferTransport {
        fn buffer(&self, location: &TaskLocation) -> Result<&Arc<OutputBuffer>> {
            self.buffers
                .get(&location.task_id)
                .ok_or_else(|| ExecError::new(ErrorCode::TaskNotFound, "no task"))
        }

        fn maybe_fail(&self) -> Result<()> {
            if self.always_fail {
                return Err(ExecError::new(ErrorCode::PageTransportError, "connection refused"));
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ExecError::new(ErrorCode::PageTransportError, "reset by peer"));
            }
            Ok(())
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
            self.maybe_fail()?;
            self.buffer(location)?
                .get(location.buffer_id, token, max_bytes, max_wait)
        }

        fn acknowledge_results(&self, location: &TaskLocation, token: u64) -> Result<()> {
            self.buffer(location)?.acknowledge(location.buffer_id, token)
        }

        fn abort_results(&self, location: &TaskLocation) -> Result<()> {
            self.maybe_fail()?;
            self.aborts.fetch_add(1, Ordering::SeqCst);
            self.buffer(location)?.destroy(location.buffer_id)
        }
    }

    fn task(partition: u32) -> TaskId {
        TaskId::new(QueryId::local(), StageId(1), partition)
    }

    fn location(partition: u32) -> TaskLocation {
        TaskLocation {
            node_id: NodeId::new("node-1"),
            uri: String::new(),
            task_id: task(partition),
            buffer_id: 0,
        }
    }

    fn producer(partition: u32, values: &[i64]) -> Arc<OutputBuffer> {
        let buffer = OutputBuffer::new(task(partition), "instance", OutputBuffers::single(), 1 << 20, None);
        let pages = values
            .iter()
            .map(|v| Page::try_new(vec![Block::from_longs(vec![*v; 3])]).unwrap())
            .collect();
        buffer.enqueue(0, pages).unwrap();
        buffer.set_no_more_pages();
        buffer
    }

    fn config() -> ExchangeClientConfig {
        ExchangeClientConfig {
            max_buffered_bytes: 1 << 20,
            max_response_bytes: 1 << 20,
            max_wait: Duration::from_millis(20),
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            max_error_duration: Duration::from_millis(50),
        }
    }

    fn drain(client: &Arc<ExchangeClient>) -> Result<Vec<i64>> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut values = Vec::new();
        while !client.is_finished() {
            assert!(Instant::now() < deadline, "exchange did not finish");
            match client.poll_page()? {
                Some(page) => values.push(page.block(0).unwrap().get_long(0).unwrap()),
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        Ok(values)
    }

    #[test]
    fn reads_every_location_in_order_and_deletes_buffers() {
        let producers = vec![producer(0, &[1, 2, 3]), producer(1, &[10, 20])];
        let transport = Arc::new(BufferTransport {
            buffers: producers.iter().map(|b| (b.task_id().clone(), Arc::clone(b))).collect(),
            failures_left: AtomicUsize::new(3),
            always_fail: false,
            aborts: AtomicUsize::new(0),
        });
        let client = ExchangeClient::new(config(), transport.clone(), Arc::new(IoExecutor::new(4)));
        client.add_location(location(0)).unwrap();
        client.add_location(location(1)).unwrap();
        client.add_location(location(1)).unwrap();
        client.no_more_locations();

        let values = drain(&client).unwrap();
        let from_first: Vec<_> = values.iter().copied().filter(|v| *v < 10).collect();
        let from_second: Vec<_> = values.iter().copied().filter(|v| *v >= 10).collect();
        assert_eq!(from_first, vec![1, 2, 3]);
        assert_eq!(from_second, vec![10, 20]);
        assert_eq!(transport.aborts.load(Ordering::SeqCst), 2);
        assert!(producers.iter().all(|b| b.is_finished()));
    }

    #[test]
    fn persistent_failures_surface_as_timeout() {
        let transport = Arc::new(BufferTransport {
            buffers: HashMap::new(),
            failures_left: AtomicUsize::new(0),
            always_fail: true,
            aborts: AtomicUsize::new(0),
        });
        let client = ExchangeClient::new(config(), transport, Arc::new(IoExecutor::new(2)));
        client.add_location(location(0)).unwrap();
        client.no_more_locations();

        let err = drain(&client).expect_err("failure expected");
        assert_eq!(err.code(), ErrorCode::PageTransportTimeout);
        assert!(err.location.as_deref().unwrap_or_default().contains("node-1"));
    }
}
