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
//! Value-carrying completion primitive.
//!
//! A `SettableFuture` is resolved at most once by its producer. Consumers may block with a
//! timeout, poll, or register listeners. Dropping a consumer never affects the producer.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

type Listener<T> = Box<dyn FnOnce(&T) + Send + 'static>;

struct FutureState<T> {
    value: Option<T>,
    listeners: Vec<Listener<T>>,
}

struct Inner<T> {
    state: Mutex<FutureState<T>>,
    cv: Condvar,
}

/// Shared handle to a value that becomes available once.
pub struct SettableFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SettableFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> SettableFuture<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(FutureState {
                    value: None,
                    listeners: Vec::new(),
                }),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn completed(value: T) -> Self {
        let future = Self::new();
        future.set(value);
        future
    }

    /// Resolve the future. Returns false when it was already resolved; the first value wins.
    pub fn set(&self, value: T) -> bool {
        let listeners = {
            let mut guard = self.inner.state.lock().expect("settable future lock");
            if guard.value.is_some() {
                return false;
            }
            guard.value = Some(value.clone());
            std::mem::take(&mut guard.listeners)
        };
        self.inner.cv.notify_all();
        for listener in listeners {
            listener(&value);
        }
        true
    }

    pub fn is_done(&self) -> bool {
        self.inner
            .state
            .lock()
            .expect("settable future lock")
            .value
            .is_some()
    }

    /// True while unresolved with no listener and no handle other than this one.
    pub fn is_abandoned(&self) -> bool {
        let guard = self.inner.state.lock().expect("settable future lock");
        guard.value.is_none() && guard.listeners.is_empty() && Arc::strong_count(&self.inner) == 1
    }

    pub fn try_get(&self) -> Option<T> {
        self.inner
            .state
            .lock()
            .expect("settable future lock")
            .value
            .clone()
    }

    /// Wait up to `timeout` for the value.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.state.lock().expect("settable future lock");
        loop {
            if let Some(value) = guard.value.as_ref() {
                return Some(value.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self
                .inner
                .cv
                .wait_timeout(guard, deadline - now)
                .expect("settable future wait");
            guard = next;
        }
    }

    pub fn wait(&self) -> T {
        let mut guard = self.inner.state.lock().expect("settable future lock");
        loop {
            if let Some(value) = guard.value.as_ref() {
                return value.clone();
            }
            guard = self.inner.cv.wait(guard).expect("settable future wait");
        }
    }

    /// Run `listener` once the value is set; immediately if it already is.
    pub fn add_listener(&self, listener: impl FnOnce(&T) + Send + 'static) {
        let value = {
            let mut guard = self.inner.state.lock().expect("settable future lock");
            match guard.value.as_ref() {
                Some(value) => value.clone(),
                None => {
                    guard.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        listener(&value);
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone + Send + 'static> Default for SettableFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SettableFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = self
            .inner
            .state
            .lock()
            .map(|g| g.value.is_some())
            .unwrap_or(false);
        f.debug_struct("SettableFuture").field("done", &done).finish()
    }
}
