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
//! Blocking network work (exchange fetches, deletes) on a bounded `threadpool`.
//!
//! Every submitted request gets an `IoTaskHandle`: a cancel flag the request polls between
//! blocking calls plus a completion future that resolves even if the request panics.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use threadpool::ThreadPool;

use crate::common::app_config::RuntimeConfig;
use crate::common::future::SettableFuture;
use crate::novaexec_logging::error;

/// Passed to the request body.
pub struct IoTaskContext {
    cancelled: Arc<AtomicBool>,
}

impl IoTaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
pub struct IoTaskHandle {
    cancelled: Arc<AtomicBool>,
    done: SettableFuture<()>,
}

impl IoTaskHandle {
    /// Cooperative: a request already inside a blocking call finishes that call first.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_done()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.done.wait_timeout(timeout).is_some()
    }
}

/// Owned by `NodeContext` (and by the coordinator side of a local cluster).
pub struct IoExecutor {
    pool: Mutex<ThreadPool>,
}

impl IoExecutor {
    pub fn new(num_threads: usize) -> Self {
        Self {
            pool: Mutex::new(ThreadPool::with_name("io_task".to_string(), num_threads.max(1))),
        }
    }

    /// `io_threads = 0` sizes the pool after the driver executor, with a floor of 4.
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        match cfg.io_threads {
            0 => Self::new(cfg.actual_exec_threads().max(4)),
            n => Self::new(n),
        }
    }

    pub fn submit<F>(&self, task: F) -> IoTaskHandle
    where
        F: FnOnce(IoTaskContext) + Send + 'static,
    {
        let handle = IoTaskHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
            done: SettableFuture::new(),
        };
        let ctx = IoTaskContext {
            cancelled: Arc::clone(&handle.cancelled),
        };
        let done = handle.done.clone();
        self.pool.lock().expect("io pool lock").execute(move || {
            if catch_unwind(AssertUnwindSafe(|| task(ctx))).is_err() {
                error!("io task panicked");
            }
            done.set(());
        });
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn submitted_tasks_complete_and_observe_cancel() {
        let executor = IoExecutor::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let handle = executor.submit(move |_ctx| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.wait_timeout(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let (tx, rx) = std::sync::mpsc::channel();
        let handle = executor.submit(move |ctx| {
            while !ctx.is_cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
            let _ = tx.send(());
        });
        handle.cancel();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(handle.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn panicking_task_still_completes() {
        let executor = IoExecutor::new(1);
        let handle = executor.submit(|_ctx| panic!("boom"));
        assert!(handle.wait_timeout(Duration::from_secs(5)));
        // the worker thread survives for later requests
        let next = executor.submit(|_ctx| {});
        assert!(next.wait_timeout(Duration::from_secs(5)));
    }
}
