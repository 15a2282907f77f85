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
//! Byte budget for pages held by an output buffer.
//!
//! Pages are charged when enqueued and released when the last client buffer drops them.
//! `is_full()` hands the sink a dependency that turns ready once usage falls below the limit.

use std::sync::Arc;
use std::sync::Mutex;

use crate::exec::page::Page;
use crate::exec::pipeline::dependency::{Dependency, DependencyHandle};
use crate::runtime::mem_tracker::MemTracker;

struct Usage {
    bytes: i64,
    peak_bytes: i64,
}

pub struct OutputBufferMemoryManager {
    max_bytes: i64,
    usage: Mutex<Usage>,
    not_full: DependencyHandle,
    tracker: Option<Arc<MemTracker>>,
}

impl OutputBufferMemoryManager {
    pub fn new(max_bytes: i64, tracker: Option<Arc<MemTracker>>) -> Self {
        Self {
            max_bytes: max_bytes.max(1),
            usage: Mutex::new(Usage {
                bytes: 0,
                peak_bytes: 0,
            }),
            not_full: Dependency::new_ready("output_buffer_not_full"),
            tracker,
        }
    }

    pub fn update(&self, delta: i64) {
        let mut usage = self.usage.lock().expect("output buffer memory lock");
        usage.bytes = (usage.bytes + delta).max(0);
        usage.peak_bytes = usage.peak_bytes.max(usage.bytes);
        if let Some(tracker) = self.tracker.as_ref() {
            tracker.update(delta);
        }
        if usage.bytes >= self.max_bytes {
            self.not_full.set_blocked();
        } else if !self.not_full.is_ready() {
            self.not_full.set_ready();
        }
    }

    /// Ready while the buffer is below its limit.
    pub fn is_full(&self) -> DependencyHandle {
        self.not_full.clone()
    }

    pub fn is_overutilized(&self) -> bool {
        !self.not_full.is_ready()
    }

    pub fn buffered_bytes(&self) -> i64 {
        self.usage.lock().expect("output buffer memory lock").bytes
    }

    pub fn peak_bytes(&self) -> i64 {
        self.usage.lock().expect("output buffer memory lock").peak_bytes
    }

    pub fn max_bytes(&self) -> i64 {
        self.max_bytes
    }
}

/// A page charged to the memory manager; the charge is released on drop.
pub struct PageReference {
    page: Page,
    bytes: i64,
    memory: Arc<OutputBufferMemoryManager>,
}

impl PageReference {
    pub fn new(page: Page, memory: Arc<OutputBufferMemoryManager>) -> Arc<Self> {
        let bytes = page.retained_size_in_bytes() as i64;
        memory.update(bytes);
        Arc::new(Self {
            page,
            bytes,
            memory,
        })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn bytes(&self) -> i64 {
        self.bytes
    }
}

impl Drop for PageReference {
    fn drop(&mut self) {
        self.memory.update(-self.bytes);
    }
}
