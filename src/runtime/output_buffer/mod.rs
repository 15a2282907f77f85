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
//! Task output buffer.
//!
//! Responsibilities:
//! - Holds the pages a task produced until each downstream consumer acknowledged them.
//! - Serves token-based long-poll reads per destination buffer, preserving page order.
//! - Bounds buffered bytes through `OutputBufferMemoryManager`, back-pressuring the sinks.
//!
//! State flow: `Open -> NoMorePages -> Flushing -> Finished`, or `Aborted` / `Failed` from
//! any non-terminal state. The buffer is finished once no more pages will arrive and every
//! destination buffer has been destroyed by its consumer.
//!
//! Key exported interfaces:
//! - Types: `OutputBuffer`, `OutputBuffers`, `OutputBufferState`, `BufferResult`, `OutputBufferInfo`.

mod client_buffer;
mod memory_manager;

pub use client_buffer::{BufferResult, ClientBufferInfo};
pub use memory_manager::{OutputBufferMemoryManager, PageReference};

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::common::ids::TaskId;
use crate::common::status::{ExecError, Result};
use crate::exec::page::Page;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::novaexec_logging::debug;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::state_machine::StateMachine;
use client_buffer::ClientBuffer;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputBufferKind {
    /// Page `p` of partition `i` goes only to buffer `i`.
    Partitioned,
    /// Every page goes to every buffer.
    Broadcast,
}

/// Output buffer layout requested by the coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBuffers {
    pub kind: OutputBufferKind,
    pub buffer_count: usize,
}

impl OutputBuffers {
    pub fn partitioned(buffer_count: usize) -> Self {
        Self {
            kind: OutputBufferKind::Partitioned,
            buffer_count: buffer_count.max(1),
        }
    }

    pub fn broadcast(buffer_count: usize) -> Self {
        Self {
            kind: OutputBufferKind::Broadcast,
            buffer_count: buffer_count.max(1),
        }
    }

    pub fn single() -> Self {
        Self::partitioned(1)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputBufferState {
    Open,
    NoMorePages,
    Flushing,
    Finished,
    Aborted,
    Failed,
}

impl OutputBufferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutputBufferState::Finished | OutputBufferState::Aborted | OutputBufferState::Failed
        )
    }

    pub fn can_add_pages(self) -> bool {
        self == OutputBufferState::Open
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub partition: usize,
    pub rows_added: u64,
    pub pages_added: u64,
    pub bytes_added: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBufferInfo {
    pub kind: OutputBufferKind,
    pub state: OutputBufferState,
    pub can_add_pages: bool,
    pub buffered_bytes: i64,
    pub peak_buffered_bytes: i64,
    pub buffered_pages: usize,
    pub overutilized: bool,
    pub buffers: Vec<ClientBufferInfo>,
    pub partitions: Vec<PartitionInfo>,
}

struct Inner {
    clients: Vec<ClientBuffer>,
    partitions: Vec<PartitionInfo>,
}

pub struct OutputBuffer {
    task_id: TaskId,
    task_instance_id: String,
    descriptor: OutputBuffers,
    state: StateMachine<OutputBufferState>,
    inner: Mutex<Inner>,
    cv: Condvar,
    memory: Arc<OutputBufferMemoryManager>,
}

impl OutputBuffer {
    pub fn new(
        task_id: TaskId,
        task_instance_id: impl Into<String>,
        descriptor: OutputBuffers,
        max_buffered_bytes: i64,
        tracker: Option<Arc<MemTracker>>,
    ) -> Arc<Self> {
        let count = descriptor.buffer_count.max(1);
        let partition_count = match descriptor.kind {
            OutputBufferKind::Partitioned => count,
            OutputBufferKind::Broadcast => 1,
        };
        Arc::new(Self {
            state: StateMachine::new(
                format!("output_buffer({})", task_id),
                OutputBufferState::Open,
                OutputBufferState::is_terminal,
            ),
            task_id,
            task_instance_id: task_instance_id.into(),
            descriptor,
            inner: Mutex::new(Inner {
                clients: (0..count as u32).map(ClientBuffer::new).collect(),
                partitions: (0..partition_count)
                    .map(|partition| PartitionInfo {
                        partition,
                        ..PartitionInfo::default()
                    })
                    .collect(),
            }),
            cv: Condvar::new(),
            memory: Arc::new(OutputBufferMemoryManager::new(max_buffered_bytes, tracker)),
        })
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn task_instance_id(&self) -> &str {
        &self.task_instance_id
    }

    pub fn descriptor(&self) -> &OutputBuffers {
        &self.descriptor
    }

    pub fn state(&self) -> OutputBufferState {
        self.state.get()
    }

    pub fn is_finished(&self) -> bool {
        self.state.get() == OutputBufferState::Finished
    }

    pub fn add_state_change_listener(
        &self,
        listener: impl Fn(&OutputBufferState) + Send + Sync + 'static,
    ) {
        self.state.add_state_change_listener(listener);
    }

    /// Accept a later copy of the layout; the layout itself cannot change.
    pub fn set_output_buffers(&self, descriptor: &OutputBuffers) -> Result<()> {
        if descriptor != &self.descriptor {
            return Err(ExecError::invariant(format!(
                "output buffers of task {} cannot change from {:?} to {:?}",
                self.task_id, self.descriptor, descriptor
            )));
        }
        Ok(())
    }

    /// Dependency that is ready while the buffer accepts more pages.
    pub fn is_full(&self) -> DependencyHandle {
        self.memory.is_full()
    }

    pub fn is_overutilized(&self) -> bool {
        self.memory.is_overutilized()
    }

    pub fn buffer_count(&self) -> usize {
        self.descriptor.buffer_count
    }

    pub fn enqueue(&self, partition: usize, pages: Vec<Page>) -> Result<()> {
        if !self.state.get().can_add_pages() {
            return Ok(());
        }
        let mut dropped = Vec::new();
        {
            let mut inner = self.inner.lock().expect("output buffer lock");
            let stats_partition = match self.descriptor.kind {
                OutputBufferKind::Partitioned => partition,
                OutputBufferKind::Broadcast => 0,
            };
            if self.descriptor.kind == OutputBufferKind::Partitioned
                && partition >= inner.clients.len()
            {
                return Err(ExecError::invariant(format!(
                    "task {} has no output partition {}",
                    self.task_id, partition
                )));
            }
            for page in pages {
                if page.is_empty() {
                    continue;
                }
                if let Some(stats) = inner.partitions.get_mut(stats_partition) {
                    stats.rows_added += page.position_count() as u64;
                    stats.pages_added += 1;
                    stats.bytes_added += page.retained_size_in_bytes() as u64;
                }
                let page_ref = PageReference::new(page, Arc::clone(&self.memory));
                match self.descriptor.kind {
                    OutputBufferKind::Partitioned => inner.clients[partition].enqueue(page_ref),
                    OutputBufferKind::Broadcast => {
                        for client in inner.clients.iter_mut() {
                            client.enqueue(Arc::clone(&page_ref));
                        }
                    }
                }
            }
            // pages offered to destroyed buffers are released right away
            if inner.clients.iter().all(ClientBuffer::is_destroyed) {
                for client in inner.clients.iter_mut() {
                    dropped.extend(client.destroy());
                }
            }
        }
        drop(dropped);
        self.cv.notify_all();
        Ok(())
    }

    /// Long-poll read: waits up to `max_wait` for pages at `token` or buffer completion.
    pub fn get(
        &self,
        buffer_id: u32,
        token: u64,
        max_bytes: u64,
        max_wait: Duration,
    ) -> Result<BufferResult> {
        let deadline = Instant::now() + max_wait;
        let mut inner = self.inner.lock().expect("output buffer lock");
        let result = loop {
            let state = self.state.get();
            if matches!(
                state,
                OutputBufferState::Aborted | OutputBufferState::Failed
            ) {
                break BufferResult::empty(&self.task_instance_id, token, false);
            }
            let client = inner
                .clients
                .get_mut(buffer_id as usize)
                .ok_or_else(|| unknown_buffer(&self.task_id, buffer_id))?;
            let result = client.get_pages(&self.task_instance_id, token, max_bytes)?;
            let stale = token < client.current_token();
            if !result.is_empty() || result.buffer_complete || stale {
                break result;
            }
            let now = Instant::now();
            if now >= deadline {
                break result;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(inner, deadline - now)
                .expect("output buffer wait");
            inner = guard;
        };
        drop(inner);
        self.check_flush_complete();
        Ok(result)
    }

    pub fn acknowledge(&self, buffer_id: u32, token: u64) -> Result<()> {
        {
            let mut inner = self.inner.lock().expect("output buffer lock");
            let client = inner
                .clients
                .get_mut(buffer_id as usize)
                .ok_or_else(|| unknown_buffer(&self.task_id, buffer_id))?;
            client.acknowledge(token)?;
        }
        self.check_flush_complete();
        Ok(())
    }

    /// Consumer is done with `buffer_id`; idempotent.
    pub fn destroy(&self, buffer_id: u32) -> Result<()> {
        let released = {
            let mut inner = self.inner.lock().expect("output buffer lock");
            let client = inner
                .clients
                .get_mut(buffer_id as usize)
                .ok_or_else(|| unknown_buffer(&self.task_id, buffer_id))?;
            if client.is_destroyed() {
                Vec::new()
            } else {
                debug!("output buffer {} destroyed by consumer: task={}", buffer_id, self.task_id);
                client.destroy()
            }
        };
        drop(released);
        self.cv.notify_all();
        self.check_flush_complete();
        Ok(())
    }

    pub fn set_no_more_pages(&self) {
        if !self.state.compare_and_set(&OutputBufferState::Open, OutputBufferState::NoMorePages) {
            return;
        }
        {
            let mut inner = self.inner.lock().expect("output buffer lock");
            for client in inner.clients.iter_mut() {
                client.set_no_more_pages();
            }
        }
        // the buffer layout is fixed at creation, so no buffer can be added from here
        self.state
            .compare_and_set(&OutputBufferState::NoMorePages, OutputBufferState::Flushing);
        self.cv.notify_all();
        self.check_flush_complete();
    }

    /// Drop all pages; used when the task is canceled or aborted.
    pub fn abort(&self) {
        self.terminate(OutputBufferState::Aborted);
    }

    pub fn fail(&self) {
        self.terminate(OutputBufferState::Failed);
    }

    fn terminate(&self, state: OutputBufferState) {
        if self.state.is_terminal() {
            return;
        }
        self.state.set(state);
        let released: Vec<_> = {
            let mut inner = self.inner.lock().expect("output buffer lock");
            inner.clients.iter_mut().flat_map(|c| c.clear()).collect()
        };
        debug!(
            "output buffer of task {} terminated as {:?}, released {} pages",
            self.task_id,
            state,
            released.len()
        );
        drop(released);
        self.cv.notify_all();
    }

    fn check_flush_complete(&self) {
        if self.state.get() != OutputBufferState::Flushing {
            return;
        }
        let all_destroyed = {
            let inner = self.inner.lock().expect("output buffer lock");
            inner.clients.iter().all(ClientBuffer::is_destroyed)
        };
        if all_destroyed {
            self.state
                .compare_and_set(&OutputBufferState::Flushing, OutputBufferState::Finished);
        }
    }

    pub fn info(&self) -> OutputBufferInfo {
        let state = self.state.get();
        let inner = self.inner.lock().expect("output buffer lock");
        OutputBufferInfo {
            kind: self.descriptor.kind,
            state,
            can_add_pages: state.can_add_pages(),
            buffered_bytes: self.memory.buffered_bytes(),
            peak_buffered_bytes: self.memory.peak_bytes(),
            buffered_pages: inner.clients.iter().map(ClientBuffer::buffered_pages).sum(),
            overutilized: self.memory.is_overutilized(),
            buffers: inner.clients.iter().map(ClientBuffer::info).collect(),
            partitions: inner.partitions.clone(),
        }
    }
}

fn unknown_buffer(task_id: &TaskId, buffer_id: u32) -> ExecError {
    ExecError::invariant(format!("task {} has no output buffer {}", task_id, buffer_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::{QueryId, StageId};
    use crate::exec::page::Block;
    use std::thread;

    fn page(v: i64) -> Page {
        Page::try_new(vec![Block::from_longs(vec![v; 4])]).unwrap()
    }

    fn first_value(p: &Page) -> i64 {
        p.block(0).unwrap().get_long(0).unwrap()
    }

    fn buffer(descriptor: OutputBuffers, max_bytes: i64) -> Arc<OutputBuffer> {
        OutputBuffer::new(
            TaskId::new(QueryId::local(), StageId(0), 0),
            "instance-1",
            descriptor,
            max_bytes,
            None,
        )
    }

    #[test]
    fn token_reads_acknowledge_earlier_pages() {
        let buf = buffer(OutputBuffers::single(), 1 << 20);
        buf.enqueue(0, vec![page(1), page(2), page(3)]).unwrap();
        let first = buf.get(0, 0, u64::MAX, Duration::ZERO).unwrap();
        assert_eq!((first.token, first.next_token), (0, 3));
        assert_eq!(first.pages.iter().map(first_value).collect::<Vec<_>>(), vec![1, 2, 3]);
        // re-reading the same token returns the same pages
        let again = buf.get(0, 0, 1, Duration::ZERO).unwrap();
        assert_eq!(again.pages.len(), 1);
        let later = buf.get(0, 2, u64::MAX, Duration::ZERO).unwrap();
        assert_eq!(later.pages.iter().map(first_value).collect::<Vec<_>>(), vec![3]);
        assert_eq!(buf.info().buffers[0].pages_sent, 2);
        // stale token after acknowledgement
        let stale = buf.get(0, 1, u64::MAX, Duration::ZERO).unwrap();
        assert!(stale.pages.is_empty() && !stale.buffer_complete);
    }

    #[test]
    fn completion_and_destroy_finish_the_buffer() {
        let buf = buffer(OutputBuffers::partitioned(2), 1 << 20);
        buf.enqueue(1, vec![page(7)]).unwrap();
        buf.set_no_more_pages();
        assert_eq!(buf.state(), OutputBufferState::Flushing);
        let done0 = buf.get(0, 0, u64::MAX, Duration::ZERO).unwrap();
        assert!(done0.buffer_complete);
        buf.destroy(0).unwrap();
        buf.destroy(0).unwrap();
        let r = buf.get(1, 0, u64::MAX, Duration::ZERO).unwrap();
        assert_eq!(r.pages.len(), 1);
        let r = buf.get(1, r.next_token, u64::MAX, Duration::ZERO).unwrap();
        assert!(r.buffer_complete);
        assert!(!buf.is_finished());
        buf.destroy(1).unwrap();
        assert!(buf.is_finished());
        assert!(buf.enqueue(5, vec![page(1)]).is_ok());
    }

    #[test]
    fn memory_backpressure_released_on_ack() {
        let one = page(1).retained_size_in_bytes() as i64;
        let buf = buffer(OutputBuffers::single(), one * 2);
        let writable = buf.is_full();
        buf.enqueue(0, vec![page(1), page(2)]).unwrap();
        assert!(!writable.is_ready());
        assert!(buf.info().overutilized);
        buf.acknowledge(0, 1).unwrap();
        assert!(writable.is_ready());
        assert_eq!(buf.info().buffered_bytes, one);
    }

    #[test]
    fn broadcast_delivers_each_page_to_every_buffer() {
        let buf = buffer(OutputBuffers::broadcast(3), 1 << 20);
        buf.enqueue(0, vec![page(9)]).unwrap();
        for id in 0..3 {
            let r = buf.get(id, 0, u64::MAX, Duration::ZERO).unwrap();
            assert_eq!(r.pages.len(), 1);
        }
        // shared page charged once
        assert_eq!(buf.info().buffered_bytes, page(9).retained_size_in_bytes() as i64);
    }

    #[test]
    fn long_poll_wakes_on_enqueue_and_abort_drops_pages() {
        let buf = buffer(OutputBuffers::single(), 1 << 20);
        let reader = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || buf.get(0, 0, u64::MAX, Duration::from_secs(5)).unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        buf.enqueue(0, vec![page(4)]).unwrap();
        let r = reader.join().unwrap();
        assert_eq!(r.pages.len(), 1);
        buf.abort();
        assert_eq!(buf.state(), OutputBufferState::Aborted);
        assert_eq!(buf.info().buffered_bytes, 0);
        let r = buf.get(0, 0, u64::MAX, Duration::ZERO).unwrap();
        assert!(r.pages.is_empty());
    }
}
