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
//! Generic observable state holder.
//!
//! Transitions out of a terminal state are rejected silently: the caller gets the existing
//! state back. Listeners run for every transition, on the transitioning thread, after the
//! lock has been released. Everyone waiting on the current state shares one pending future,
//! so long-polls that time out leave nothing behind.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::future::SettableFuture;
use crate::novaexec_logging::debug;

type StateListener<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

struct Inner<T> {
    state: T,
    version: u64,
    listeners: Vec<StateListener<T>>,
    /// Resolved with the next state; exists only while someone waits on the current one.
    next: Option<SettableFuture<T>>,
}

pub struct StateMachine<T> {
    name: String,
    is_terminal: fn(&T) -> bool,
    inner: Mutex<Inner<T>>,
}

impl<T> StateMachine<T>
where
    T: Clone + PartialEq + fmt::Debug + Send + 'static,
{
    pub fn new(name: impl Into<String>, initial: T, is_terminal: fn(&T) -> bool) -> Self {
        Self {
            name: name.into(),
            is_terminal,
            inner: Mutex::new(Inner {
                state: initial,
                version: 0,
                listeners: Vec::new(),
                next: None,
            }),
        }
    }

    pub fn get(&self) -> T {
        self.inner.lock().expect("state machine lock").state.clone()
    }

    /// Number of transitions applied so far.
    pub fn version(&self) -> u64 {
        self.inner.lock().expect("state machine lock").version
    }

    pub fn is_terminal(&self) -> bool {
        let guard = self.inner.lock().expect("state machine lock");
        (self.is_terminal)(&guard.state)
    }

    /// Move to `new_state` unless the current state is terminal. Returns the state held
    /// before the call.
    pub fn set(&self, new_state: T) -> T {
        self.transition(|_| true, new_state).0
    }

    /// Move to `new_state` only when the current state equals `expected`.
    pub fn compare_and_set(&self, expected: &T, new_state: T) -> bool {
        self.transition(|current| current == expected, new_state).1
    }

    /// Move to `new_state` only when `predicate` accepts the current state.
    pub fn set_if(&self, new_state: T, predicate: impl FnOnce(&T) -> bool) -> bool {
        self.transition(predicate, new_state).1
    }

    fn transition(&self, predicate: impl FnOnce(&T) -> bool, new_state: T) -> (T, bool) {
        let (old, listeners, next) = {
            let mut guard = self.inner.lock().expect("state machine lock");
            let old = guard.state.clone();
            if (self.is_terminal)(&old) || old == new_state || !predicate(&old) {
                return (old, false);
            }
            guard.state = new_state.clone();
            guard.version += 1;
            (
                old,
                guard.listeners.clone(),
                guard.next.take(),
            )
        };
        debug!(
            "{} state change: {:?} -> {:?}",
            self.name, old, new_state
        );
        if let Some(next) = next {
            next.set(new_state.clone());
        }
        for listener in listeners {
            listener(&new_state);
        }
        (old, true)
    }

    pub fn add_state_change_listener(&self, listener: impl Fn(&T) + Send + Sync + 'static) {
        let mut guard = self.inner.lock().expect("state machine lock");
        guard.listeners.push(Arc::new(listener));
    }

    /// Future resolving with the first state different from `current`.
    pub fn state_change(&self, current: &T) -> SettableFuture<T> {
        let mut guard = self.inner.lock().expect("state machine lock");
        if &guard.state != current || (self.is_terminal)(&guard.state) {
            return SettableFuture::completed(guard.state.clone());
        }
        guard.next.get_or_insert_with(SettableFuture::new).clone()
    }

    /// Long-poll helper: wait up to `max_wait` for a state other than `current`.
    pub fn wait_for_state_change(&self, current: &T, max_wait: Duration) -> T {
        let future = self.state_change(current);
        future.wait_timeout(max_wait).unwrap_or_else(|| self.get())
    }

    #[cfg(test)]
    fn pending_futures(&self) -> usize {
        usize::from(self.inner.lock().expect("state machine lock").next.is_some())
    }
}
