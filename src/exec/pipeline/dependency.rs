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
//! Pipeline dependency primitives.
//!
//! Responsibilities:
//! - Defines dependency handles with a readiness flag that operators report as their blocking
//!   condition (memory, splits, back-pressure).
//! - Wakes registered waiters exactly once per ready transition, outside of any lock.
//!
//! Key exported interfaces:
//! - Types: `DependencyHandle`, `Dependency`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::exec::pipeline::schedule::observer::Observer;
use crate::novaexec_logging::debug;

static NEXT_DEP_ID: AtomicUsize = AtomicUsize::new(1);

/// Reference-counted handle to one pipeline dependency object.
pub type DependencyHandle = Arc<Dependency>;

/// Blocking condition that becomes ready when the guarded resource is available again.
pub struct Dependency {
    id: usize,
    name: String,
    ready: AtomicBool,
    waiters: Mutex<Vec<Observer>>,
    cv: Condvar,
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl PartialEq for Dependency {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Dependency {}

impl Dependency {
    /// New dependency in the blocked state.
    pub fn new(name: impl Into<String>) -> DependencyHandle {
        Arc::new(Self {
            id: NEXT_DEP_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            ready: AtomicBool::new(false),
            waiters: Mutex::new(Vec::new()),
            cv: Condvar::new(),
        })
    }

    pub fn new_ready(name: impl Into<String>) -> DependencyHandle {
        let dep = Self::new(name);
        dep.ready.store(true, Ordering::Release);
        dep
    }

    /// Fresh dependency that is already ready; the caller owns it exclusively.
    pub fn ready() -> DependencyHandle {
        Self::new_ready("ready")
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self) {
        let waiters = {
            let mut guard = self.waiters.lock().expect("dependency lock");
            if self.ready.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *guard)
        };
        self.cv.notify_all();
        debug!(
            "Dependency ready: dep_id={} name={} waiters={}",
            self.id,
            self.name,
            waiters.len()
        );
        for waiter in waiters {
            waiter();
        }
    }

    pub fn set_blocked(&self) {
        let _guard = self.waiters.lock().expect("dependency lock");
        self.ready.store(false, Ordering::Release);
    }

    /// Run `observer` once the dependency is ready; immediately if it already is.
    pub fn add_waiter(&self, observer: Observer) {
        {
            let mut guard = self.waiters.lock().expect("dependency lock");
            if !self.is_ready() {
                guard.push(observer);
                return;
            }
        }
        observer();
    }

    /// Block the calling thread until ready or `timeout` elapses. Returns readiness.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.waiters.lock().expect("dependency lock");
        loop {
            if self.is_ready() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .cv
                .wait_timeout(guard, deadline - now)
                .expect("dependency wait");
            guard = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn waiters_run_once_per_ready_transition() {
        let dep = Dependency::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        dep.add_waiter(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        dep.set_ready();
        dep.set_ready();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // waiter registered on a ready dependency runs inline
        let h = Arc::clone(&hits);
        dep.add_waiter(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wait_timeout_observes_cross_thread_ready() {
        let dep = Dependency::new("cross");
        assert!(!dep.wait_timeout(Duration::from_millis(5)));
        let d = Arc::clone(&dep);
        let handle = thread::spawn(move || d.set_ready());
        assert!(dep.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
        dep.set_blocked();
        assert!(!dep.is_ready());
    }

    #[test]
    fn blocking_a_ready_handle_leaves_other_ready_handles_alone() {
        let first = Dependency::ready();
        let second = Dependency::ready();
        assert_ne!(first.id(), second.id());
        first.set_blocked();
        assert!(!first.is_ready());
        assert!(second.is_ready());
        assert!(Dependency::ready().is_ready());

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        first.add_waiter(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        first.set_ready();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
