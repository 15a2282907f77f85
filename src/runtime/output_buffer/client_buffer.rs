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
//! Per-destination page queue with token-based reads.
//!
//! Tokens number the pages of one buffer from zero. A read at token `t` acknowledges every
//! page before `t` and returns pages starting at `t`; acknowledged pages are dropped and their
//! memory released.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::memory_manager::PageReference;
use crate::common::status::{ExecError, Result};
use crate::exec::page::Page;

#[derive(Clone, Debug)]
pub struct BufferResult {
    pub task_instance_id: String,
    pub token: u64,
    pub next_token: u64,
    pub pages: Vec<Page>,
    pub buffer_complete: bool,
}

impl BufferResult {
    pub fn empty(task_instance_id: &str, token: u64, buffer_complete: bool) -> Self {
        Self {
            task_instance_id: task_instance_id.to_string(),
            token,
            next_token: token,
            pages: Vec::new(),
            buffer_complete,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientBufferInfo {
    pub buffer_id: u32,
    pub destroyed: bool,
    pub buffered_pages: usize,
    pub pages_added: u64,
    pub pages_sent: u64,
    pub rows_sent: u64,
}

pub(crate) struct ClientBuffer {
    buffer_id: u32,
    pages: VecDeque<Arc<PageReference>>,
    /// Token of the first page still held.
    current_sequence_id: u64,
    no_more_pages: bool,
    destroyed: bool,
    pages_added: u64,
    rows_sent: u64,
}

impl ClientBuffer {
    pub(crate) fn new(buffer_id: u32) -> Self {
        Self {
            buffer_id,
            pages: VecDeque::new(),
            current_sequence_id: 0,
            no_more_pages: false,
            destroyed: false,
            pages_added: 0,
            rows_sent: 0,
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub(crate) fn current_token(&self) -> u64 {
        self.current_sequence_id
    }

    pub(crate) fn buffered_pages(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn enqueue(&mut self, page: Arc<PageReference>) {
        if self.destroyed || self.no_more_pages {
            return;
        }
        self.pages_added += 1;
        self.pages.push_back(page);
    }

    pub(crate) fn set_no_more_pages(&mut self) {
        self.no_more_pages = true;
    }

    /// Drop every page before `token`.
    pub(crate) fn acknowledge(&mut self, token: u64) -> Result<()> {
        if self.destroyed || token <= self.current_sequence_id {
            return Ok(());
        }
        let end = self.current_sequence_id + self.pages.len() as u64;
        if token > end {
            return Err(ExecError::invariant(format!(
                "buffer {} acknowledged token {} beyond produced token {}",
                self.buffer_id, token, end
            )));
        }
        for _ in self.current_sequence_id..token {
            if let Some(page) = self.pages.pop_front() {
                self.rows_sent += page.page().position_count() as u64;
            }
        }
        self.current_sequence_id = token;
        Ok(())
    }

    pub(crate) fn get_pages(
        &mut self,
        task_instance_id: &str,
        token: u64,
        max_bytes: u64,
    ) -> Result<BufferResult> {
        self.acknowledge(token)?;
        if self.destroyed {
            return Ok(BufferResult::empty(task_instance_id, token, true));
        }
        // stale request for pages already acknowledged
        if token < self.current_sequence_id {
            return Ok(BufferResult::empty(task_instance_id, token, false));
        }
        if self.pages.is_empty() {
            return Ok(BufferResult::empty(
                task_instance_id,
                token,
                self.no_more_pages,
            ));
        }
        let mut bytes = 0u64;
        let mut pages = Vec::new();
        for page in &self.pages {
            let size = page.bytes().max(0) as u64;
            if !pages.is_empty() && bytes + size > max_bytes {
                break;
            }
            bytes += size;
            pages.push(page.page().clone());
        }
        Ok(BufferResult {
            task_instance_id: task_instance_id.to_string(),
            token,
            next_token: token + pages.len() as u64,
            pages,
            buffer_complete: false,
        })
    }

    pub(crate) fn destroy(&mut self) -> Vec<Arc<PageReference>> {
        self.destroyed = true;
        self.pages.drain(..).collect()
    }

    /// Discard buffered pages but keep the buffer readable.
    pub(crate) fn clear(&mut self) -> Vec<Arc<PageReference>> {
        self.current_sequence_id += self.pages.len() as u64;
        self.pages.drain(..).collect()
    }

    pub(crate) fn info(&self) -> ClientBufferInfo {
        ClientBufferInfo {
            buffer_id: self.buffer_id,
            destroyed: self.destroyed,
            buffered_pages: self.pages.len(),
            pages_added: self.pages_added,
            pages_sent: self.current_sequence_id,
            rows_sent: self.rows_sent,
        }
    }
}
