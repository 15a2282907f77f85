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
//! Node-wide memory pool.
//!
//! Responsibilities:
//! - Tracks regular and revocable reservations per query and per allocation tag.
//! - Hands out a blocking dependency when a reservation over-commits the pool.
//!
//! Key exported interfaces:
//! - Types: `MemoryPool`, `MemoryPoolInfo`.
//!
//! Reservations are granted speculatively: free bytes may go negative. While the pool is
//! over-committed every reserving caller receives the same pending dependency, which becomes
//! ready once frees bring free bytes back to zero or above.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::common::ids::QueryId;
use crate::common::status::{ExecError, Result};
use crate::exec::pipeline::dependency::{Dependency, DependencyHandle};
use crate::novaexec_logging::{debug, warn};

type PoolListener = Arc<dyn Fn(&MemoryPoolInfo) + Send + Sync + 'static>;

#[derive(Default, Debug)]
struct QueryReservation {
    bytes: i64,
    revocable_bytes: i64,
    tags: HashMap<String, i64>,
}

impl QueryReservation {
    fn is_empty(&self) -> bool {
        self.bytes == 0 && self.revocable_bytes == 0
    }
}

#[derive(Default)]
struct PoolInner {
    reserved_bytes: i64,
    reserved_revocable_bytes: i64,
    queries: HashMap<QueryId, QueryReservation>,
    pending: Option<DependencyHandle>,
}

#[derive(Clone, Debug, Serialize)]
pub struct MemoryPoolInfo {
    pub max_bytes: i64,
    pub reserved_bytes: i64,
    pub reserved_revocable_bytes: i64,
    pub free_bytes: i64,
    pub query_reservations: HashMap<String, i64>,
    pub query_allocations: HashMap<String, HashMap<String, i64>>,
    pub blocked: bool,
}

pub struct MemoryPool {
    max_bytes: i64,
    inner: Mutex<PoolInner>,
    listeners: Mutex<Vec<PoolListener>>,
}

impl MemoryPool {
    pub fn new(max_bytes: i64) -> Self {
        Self {
            max_bytes: max_bytes.max(0),
            inner: Mutex::new(PoolInner::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn max_bytes(&self) -> i64 {
        self.max_bytes
    }

    /// May be negative while the pool is over-committed.
    pub fn free_bytes(&self) -> i64 {
        let guard = self.inner.lock().expect("memory pool lock");
        self.free_bytes_locked(&guard)
    }

    pub fn reserved_bytes(&self) -> i64 {
        self.inner.lock().expect("memory pool lock").reserved_bytes
    }

    pub fn reserved_revocable_bytes(&self) -> i64 {
        self.inner
            .lock()
            .expect("memory pool lock")
            .reserved_revocable_bytes
    }

    fn free_bytes_locked(&self, inner: &PoolInner) -> i64 {
        self.max_bytes - inner.reserved_bytes - inner.reserved_revocable_bytes
    }

    /// Reserve `bytes` for `query` under `tag`. The returned dependency is ready when the pool
    /// still has non-negative free bytes; otherwise it is the pool's pending dependency.
    pub fn reserve(&self, query: &QueryId, tag: &str, bytes: i64) -> Result<DependencyHandle> {
        check_non_negative(bytes)?;
        let result = {
            let mut guard = self.inner.lock().expect("memory pool lock");
            if bytes > 0 {
                guard.reserved_bytes += bytes;
                let entry = guard.queries.entry(query.clone()).or_default();
                entry.bytes += bytes;
                *entry.tags.entry(tag.to_string()).or_insert(0) += bytes;
            }
            self.blocking_dependency_locked(&mut guard)
        };
        if bytes > 0 {
            self.notify_listeners();
        }
        Ok(result)
    }

    /// Reserve only if the pool can grant it without over-committing.
    pub fn try_reserve(&self, query: &QueryId, tag: &str, bytes: i64) -> Result<bool> {
        check_non_negative(bytes)?;
        {
            let mut guard = self.inner.lock().expect("memory pool lock");
            if self.free_bytes_locked(&guard) - bytes < 0 {
                return Ok(false);
            }
            if bytes == 0 {
                return Ok(true);
            }
            guard.reserved_bytes += bytes;
            let entry = guard.queries.entry(query.clone()).or_default();
            entry.bytes += bytes;
            *entry.tags.entry(tag.to_string()).or_insert(0) += bytes;
        }
        self.notify_listeners();
        Ok(true)
    }

    pub fn reserve_revocable(&self, query: &QueryId, bytes: i64) -> Result<DependencyHandle> {
        check_non_negative(bytes)?;
        let result = {
            let mut guard = self.inner.lock().expect("memory pool lock");
            if bytes > 0 {
                guard.reserved_revocable_bytes += bytes;
                guard.queries.entry(query.clone()).or_default().revocable_bytes += bytes;
            }
            self.blocking_dependency_locked(&mut guard)
        };
        if bytes > 0 {
            self.notify_listeners();
        }
        Ok(result)
    }

    fn blocking_dependency_locked(&self, inner: &mut PoolInner) -> DependencyHandle {
        if self.free_bytes_locked(inner) >= 0 {
            return Dependency::ready();
        }
        match inner.pending.as_ref() {
            Some(dep) => Arc::clone(dep),
            None => {
                debug!(
                    "memory pool over-committed: max={} reserved={} revocable={}",
                    self.max_bytes, inner.reserved_bytes, inner.reserved_revocable_bytes
                );
                let dep = Dependency::new("memory_pool");
                inner.pending = Some(Arc::clone(&dep));
                dep
            }
        }
    }

    /// Release `bytes` previously reserved by `query` under `tag`.
    pub fn free(&self, query: &QueryId, tag: &str, bytes: i64) -> Result<()> {
        check_non_negative(bytes)?;
        if bytes == 0 {
            return Ok(());
        }
        let unblocked = {
            let mut guard = self.inner.lock().expect("memory pool lock");
            let Some(entry) = guard.queries.get_mut(query) else {
                return Err(ExecError::invariant(format!(
                    "free of {} bytes for query {} without a reservation",
                    bytes, query
                )));
            };
            let tagged = entry.tags.get(tag).copied().unwrap_or(0);
            if bytes > entry.bytes || bytes > tagged {
                return Err(ExecError::invariant(format!(
                    "free of {} bytes for query {} tag {} exceeds reservation of {} ({} tagged)",
                    bytes, query, tag, entry.bytes, tagged
                )));
            }
            entry.bytes -= bytes;
            if tagged == bytes {
                entry.tags.remove(tag);
            } else if let Some(t) = entry.tags.get_mut(tag) {
                *t -= bytes;
            }
            if entry.is_empty() {
                guard.queries.remove(query);
            }
            guard.reserved_bytes -= bytes;
            self.take_unblocked_locked(&mut guard)
        };
        self.after_free(unblocked);
        Ok(())
    }

    pub fn free_revocable(&self, query: &QueryId, bytes: i64) -> Result<()> {
        check_non_negative(bytes)?;
        if bytes == 0 {
            return Ok(());
        }
        let unblocked = {
            let mut guard = self.inner.lock().expect("memory pool lock");
            let Some(entry) = guard.queries.get_mut(query) else {
                return Err(ExecError::invariant(format!(
                    "revocable free of {} bytes for query {} without a reservation",
                    bytes, query
                )));
            };
            if bytes > entry.revocable_bytes {
                return Err(ExecError::invariant(format!(
                    "revocable free of {} bytes for query {} exceeds reservation of {}",
                    bytes, query, entry.revocable_bytes
                )));
            }
            entry.revocable_bytes -= bytes;
            if entry.is_empty() {
                guard.queries.remove(query);
            }
            guard.reserved_revocable_bytes -= bytes;
            self.take_unblocked_locked(&mut guard)
        };
        self.after_free(unblocked);
        Ok(())
    }

    fn take_unblocked_locked(&self, inner: &mut PoolInner) -> Option<DependencyHandle> {
        if self.free_bytes_locked(inner) >= 0 {
            inner.pending.take()
        } else {
            None
        }
    }

    fn after_free(&self, unblocked: Option<DependencyHandle>) {
        if let Some(dep) = unblocked {
            debug!("memory pool available again: free={}", self.free_bytes());
            dep.set_ready();
        }
        self.notify_listeners();
    }

    pub fn query_memory_reservation(&self, query: &QueryId) -> i64 {
        let guard = self.inner.lock().expect("memory pool lock");
        guard.queries.get(query).map(|q| q.bytes).unwrap_or(0)
    }

    pub fn query_revocable_memory_reservation(&self, query: &QueryId) -> i64 {
        let guard = self.inner.lock().expect("memory pool lock");
        guard.queries.get(query).map(|q| q.revocable_bytes).unwrap_or(0)
    }

    pub fn has_query(&self, query: &QueryId) -> bool {
        let guard = self.inner.lock().expect("memory pool lock");
        guard.queries.contains_key(query)
    }

    pub fn tagged_allocations(&self, query: &QueryId) -> HashMap<String, i64> {
        let guard = self.inner.lock().expect("memory pool lock");
        guard
            .queries
            .get(query)
            .map(|q| q.tags.clone())
            .unwrap_or_default()
    }

    pub fn info(&self) -> MemoryPoolInfo {
        let guard = self.inner.lock().expect("memory pool lock");
        MemoryPoolInfo {
            max_bytes: self.max_bytes,
            reserved_bytes: guard.reserved_bytes,
            reserved_revocable_bytes: guard.reserved_revocable_bytes,
            free_bytes: self.free_bytes_locked(&guard),
            query_reservations: guard
                .queries
                .iter()
                .map(|(q, r)| (q.to_string(), r.bytes))
                .collect(),
            query_allocations: guard
                .queries
                .iter()
                .map(|(q, r)| (q.to_string(), r.tags.clone()))
                .collect(),
            blocked: guard.pending.is_some(),
        }
    }

    pub fn add_listener(&self, listener: impl Fn(&MemoryPoolInfo) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("memory pool listener lock")
            .push(Arc::new(listener));
    }

    fn notify_listeners(&self) {
        let listeners = self
            .listeners
            .lock()
            .expect("memory pool listener lock")
            .clone();
        if listeners.is_empty() {
            return;
        }
        let info = self.info();
        for listener in listeners {
            listener(&info);
        }
    }
}

fn check_non_negative(bytes: i64) -> Result<()> {
    if bytes < 0 {
        warn!("negative memory request: {}", bytes);
        return Err(ExecError::invariant(format!(
            "memory request must be non-negative, got {}",
            bytes
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn q(id: &str) -> QueryId {
        QueryId::new(id).unwrap()
    }

    #[test]
    fn reserve_then_free_restores_pool() {
        let pool = MemoryPool::new(1000);
        let before = pool.reserved_bytes();
        assert!(pool.reserve(&q("a"), "agg", 300).unwrap().is_ready());
        assert_eq!(pool.query_memory_reservation(&q("a")), 300);
        pool.free(&q("a"), "agg", 300).unwrap();
        assert_eq!(pool.reserved_bytes(), before);
        assert!(!pool.has_query(&q("a")));
    }

    #[test]
    fn over_free_is_invariant_violation() {
        let pool = MemoryPool::new(1000);
        pool.reserve(&q("a"), "agg", 10).unwrap();
        let err = pool.free(&q("a"), "agg", 11).unwrap_err();
        assert_eq!(err.code(), crate::common::status::ErrorCode::InvariantViolation);
        let err = pool.free(&q("b"), "agg", 1).unwrap_err();
        assert_eq!(err.code(), crate::common::status::ErrorCode::InvariantViolation);
        assert_eq!(pool.query_memory_reservation(&q("a")), 10);
    }

    #[test]
    fn over_commit_shares_one_pending_dependency() {
        let pool = MemoryPool::new(100);
        let first = pool.reserve(&q("a"), "x", 150).unwrap();
        assert!(!first.is_ready());
        assert_eq!(pool.free_bytes(), -50);
        let second = pool.reserve(&q("b"), "y", 10).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        pool.free(&q("b"), "y", 10).unwrap();
        assert!(!first.is_ready());
        pool.free(&q("a"), "x", 50).unwrap();
        assert!(first.is_ready());
        assert!(!pool.info().blocked);
    }

    #[test]
    fn try_reserve_is_strict_and_revocable_is_separate() {
        let pool = MemoryPool::new(100);
        assert!(pool.try_reserve(&q("a"), "x", 60).unwrap());
        assert!(!pool.try_reserve(&q("a"), "x", 41).unwrap());
        assert!(pool.reserve_revocable(&q("a"), 40).unwrap().is_ready());
        assert_eq!(pool.free_bytes(), 0);
        assert_eq!(pool.query_revocable_memory_reservation(&q("a")), 40);
        assert!(pool.free_revocable(&q("a"), 41).is_err());
        pool.free_revocable(&q("a"), 40).unwrap();
        pool.free(&q("a"), "x", 60).unwrap();
        assert!(!pool.has_query(&q("a")));
    }

    #[test]
    fn listeners_see_changes() {
        let pool = MemoryPool::new(100);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        pool.add_listener(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        pool.reserve(&q("a"), "x", 1).unwrap();
        pool.free(&q("a"), "x", 1).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(pool.tagged_allocations(&q("a")).len(), 0);
    }
}
