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
//! Per-query state shared by all tasks of one query on this node.
//!
//! Responsibilities:
//! - Enforces the per-query memory limit on top of the node memory pool.
//! - Hands out `LocalMemoryContext` handles that operators use to report their footprint.
//!
//! Key exported interfaces:
//! - Types: `QueryContext`, `QueryContextManager`, `LocalMemoryContext`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::common::ids::QueryId;
use crate::common::status::{ErrorCode, ExecError, Result};
use crate::exec::pipeline::dependency::{Dependency, DependencyHandle};
use crate::novaexec_logging::{debug, warn};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::memory_pool::MemoryPool;

pub struct QueryContext {
    query_id: QueryId,
    pool: Arc<MemoryPool>,
    max_memory_bytes: i64,
    mem_tracker: Arc<MemTracker>,
    reserved: Mutex<i64>,
}

impl QueryContext {
    pub fn new(
        query_id: QueryId,
        pool: Arc<MemoryPool>,
        max_memory_bytes: i64,
        parent_tracker: &Arc<MemTracker>,
    ) -> Self {
        let mem_tracker = MemTracker::new_child(format!("query_{}", query_id), parent_tracker);
        Self {
            query_id,
            pool,
            max_memory_bytes,
            mem_tracker,
            reserved: Mutex::new(0),
        }
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub fn mem_tracker(&self) -> Arc<MemTracker> {
        Arc::clone(&self.mem_tracker)
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    pub fn max_memory_bytes(&self) -> i64 {
        self.max_memory_bytes
    }

    pub fn reserved_bytes(&self) -> i64 {
        *self.reserved.lock().expect("query memory lock")
    }

    fn update(&self, tag: &str, delta: i64) -> Result<DependencyHandle> {
        if delta == 0 {
            return Ok(Dependency::ready());
        }
        let mut reserved = self.reserved.lock().expect("query memory lock");
        if delta < 0 {
            self.pool.free(&self.query_id, tag, -delta)?;
            *reserved += delta;
            return Ok(Dependency::ready());
        }
        let next = *reserved + delta;
        if next > self.max_memory_bytes {
            return Err(ExecError::new(
                ErrorCode::ExceededQueryMemoryLimit,
                format!(
                    "query {} exceeded per-node memory limit of {} bytes (requested {}, reserved {})",
                    self.query_id, self.max_memory_bytes, delta, *reserved
                ),
            ));
        }
        if next > self.pool.max_bytes() {
            return Err(ExecError::new(
                ErrorCode::ExceededNodeMemoryLimit,
                format!(
                    "query {} needs {} bytes but the node pool holds {}",
                    self.query_id,
                    next,
                    self.pool.max_bytes()
                ),
            ));
        }
        let blocked = self.pool.reserve(&self.query_id, tag, delta)?;
        *reserved = next;
        Ok(blocked)
    }

    /// Operator-level memory handle tagged with `tag`.
    pub fn new_local_memory_context(self: &Arc<Self>, tag: impl Into<String>) -> LocalMemoryContext {
        LocalMemoryContext {
            query: Arc::clone(self),
            tag: tag.into(),
            bytes: 0,
            tracker: None,
        }
    }
}

impl Drop for QueryContext {
    fn drop(&mut self) {
        let reserved = *self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        if reserved != 0 {
            warn!(
                "query {} context dropped with {} bytes still reserved",
                self.query_id, reserved
            );
        }
    }
}

/// Memory accounted by one operator. `set_bytes` moves the reservation to an absolute value.
/// Whatever is still held is released on drop.
pub struct LocalMemoryContext {
    query: Arc<QueryContext>,
    tag: String,
    bytes: i64,
    tracker: Option<Arc<MemTracker>>,
}

impl LocalMemoryContext {
    pub fn set_tracker(&mut self, tracker: Arc<MemTracker>) {
        if let Some(old) = self.tracker.as_ref() {
            old.release(self.bytes);
        }
        tracker.consume(self.bytes);
        self.tracker = Some(tracker);
    }

    pub fn bytes(&self) -> i64 {
        self.bytes
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns the pool dependency to wait on when the node pool is over-committed.
    pub fn set_bytes(&mut self, bytes: i64) -> Result<DependencyHandle> {
        let bytes = bytes.max(0);
        let delta = bytes - self.bytes;
        let blocked = self.query.update(&self.tag, delta)?;
        if let Some(tracker) = self.tracker.as_ref() {
            tracker.update(delta);
        }
        self.bytes = bytes;
        Ok(blocked)
    }

    pub fn close(&mut self) {
        if self.bytes == 0 {
            return;
        }
        if let Err(err) = self.set_bytes(0) {
            warn!(
                "failed to release {} bytes for {}: {}",
                self.bytes, self.tag, err
            );
        }
    }
}

impl Drop for LocalMemoryContext {
    fn drop(&mut self) {
        self.close();
    }
}

/// Node-local registry. Contexts live as long as some task holds them.
pub struct QueryContextManager {
    pool: Arc<MemoryPool>,
    max_query_memory_bytes: i64,
    root_tracker: Arc<MemTracker>,
    contexts: Mutex<HashMap<QueryId, Weak<QueryContext>>>,
}

impl QueryContextManager {
    pub fn new(
        pool: Arc<MemoryPool>,
        max_query_memory_bytes: i64,
        root_tracker: Arc<MemTracker>,
    ) -> Self {
        Self {
            pool,
            max_query_memory_bytes,
            root_tracker,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, query_id: &QueryId) -> Arc<QueryContext> {
        let mut guard = self.contexts.lock().expect("query context manager lock");
        guard.retain(|_, ctx| ctx.strong_count() > 0);
        if let Some(existing) = guard.get(query_id).and_then(Weak::upgrade) {
            return existing;
        }
        debug!("register query context {}", query_id);
        let ctx = Arc::new(QueryContext::new(
            query_id.clone(),
            Arc::clone(&self.pool),
            self.max_query_memory_bytes,
            &self.root_tracker,
        ));
        guard.insert(query_id.clone(), Arc::downgrade(&ctx));
        ctx
    }

    pub fn get(&self, query_id: &QueryId) -> Option<Arc<QueryContext>> {
        let guard = self.contexts.lock().expect("query context manager lock");
        guard.get(query_id).and_then(Weak::upgrade)
    }

    pub fn active_queries(&self) -> usize {
        let guard = self.contexts.lock().expect("query context manager lock");
        guard.values().filter(|c| c.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(pool_bytes: i64, query_bytes: i64) -> (Arc<MemoryPool>, QueryContextManager) {
        let pool = Arc::new(MemoryPool::new(pool_bytes));
        let mgr = QueryContextManager::new(
            Arc::clone(&pool),
            query_bytes,
            MemTracker::new_root("node"),
        );
        (pool, mgr)
    }

    #[test]
    fn local_context_releases_on_drop() {
        let (pool, mgr) = manager(1000, 500);
        let q = QueryId::new("q1").unwrap();
        let ctx = mgr.get_or_create(&q);
        {
            let mut local = ctx.new_local_memory_context("agg");
            assert!(local.set_bytes(200).unwrap().is_ready());
            local.set_bytes(120).unwrap();
            assert_eq!(pool.query_memory_reservation(&q), 120);
        }
        assert_eq!(pool.reserved_bytes(), 0);
        assert_eq!(ctx.reserved_bytes(), 0);
    }

    #[test]
    fn query_limit_fails_without_reserving() {
        let (pool, mgr) = manager(1000, 100);
        let q = QueryId::new("q1").unwrap();
        let ctx = mgr.get_or_create(&q);
        let mut local = ctx.new_local_memory_context("agg");
        let err = local.set_bytes(101).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExceededQueryMemoryLimit);
        assert_eq!(pool.reserved_bytes(), 0);
        assert_eq!(local.bytes(), 0);
    }

    #[test]
    fn tasks_of_one_query_share_a_context() {
        let (_pool, mgr) = manager(1000, 100);
        let q = QueryId::new("q1").unwrap();
        let a = mgr.get_or_create(&q);
        let b = mgr.get_or_create(&q);
        assert!(Arc::ptr_eq(&a, &b));
        drop(a);
        drop(b);
        assert!(mgr.get(&q).is_none());
        assert_eq!(mgr.active_queries(), 0);
    }
}
