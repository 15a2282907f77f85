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
//! Wake-up callbacks for parked drivers.
//!
//! Sources and sinks expose an `Observable`; the blocked driver poller registers an observer
//! on it that re-enqueues the driver. Producers notify through `DeferNotify` so the callback
//! always runs after their own lock is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::logging::LogEvery;
use crate::novaexec_logging::debug;

static NOTIFY_LOG: LogEvery = LogEvery::new(1024);

pub type Observer = Arc<dyn Fn() + Send + Sync + 'static>;

/// Observers stay registered for the lifetime of the observable.
#[derive(Default)]
pub struct Observable {
    observers: Mutex<Vec<Observer>>,
}

impl Observable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&self, observer: Observer) {
        self.observers.lock().expect("observable lock").push(observer);
    }

    /// Notifier that fires on drop once `arm()` was called.
    pub fn defer_notify(self: &Arc<Self>) -> DeferNotify {
        DeferNotify {
            observable: Arc::clone(self),
            armed: AtomicBool::new(false),
        }
    }

    /// Callbacks run on the caller's thread, outside the observer lock.
    pub fn notify_observers(&self) {
        let observers = self.observers.lock().expect("observable lock").clone();
        if NOTIFY_LOG.should_log() {
            debug!("observable notify: observers={}", observers.len());
        }
        for observer in observers {
            observer();
        }
    }
}

/// Arm after the state change is committed; notification happens at scope exit.
#[must_use]
pub struct DeferNotify {
    observable: Arc<Observable>,
    armed: AtomicBool,
}

impl DeferNotify {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }
}

impl Drop for DeferNotify {
    fn drop(&mut self) {
        if self.armed.load(Ordering::Acquire) {
            self.observable.notify_observers();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn unarmed_notifier_is_silent() {
        let observable = Arc::new(Observable::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        observable.add_observer(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        {
            let _notify = observable.defer_notify();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        {
            let notify = observable.defer_notify();
            notify.arm();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        observable.notify_observers();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
