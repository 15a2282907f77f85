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
//! Cluster membership for placement decisions.
//!
//! Responsibilities:
//! - Polls a `NodeDiscovery` implementation and publishes immutable `AllNodes` snapshots.
//! - Nodes whose last successful announcement is older than the staleness bound are reported
//!   inactive regardless of the state they last announced.
//! - Notifies listeners whenever a refresh produces a different snapshot.
//!
//! Key exported interfaces:
//! - Traits: `NodeDiscovery`.
//! - Types: `NodeManager`, `AllNodes`, `InternalNode`, `NodeState`, `StaticNodeDiscovery`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::common::app_config::StaticNodeConfig;
use crate::common::ids::NodeId;
use crate::common::status::{ErrorCode, ExecError, Result};
use crate::novaexec_logging::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Active,
    Inactive,
    ShuttingDown,
}

impl NodeState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Some(NodeState::Active),
            "inactive" => Some(NodeState::Inactive),
            "shutting_down" | "shutting-down" => Some(NodeState::ShuttingDown),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InternalNode {
    pub node_id: NodeId,
    pub uri: String,
    pub coordinator: bool,
    /// Catalogs this node can read splits of; empty means every catalog.
    pub connectors: BTreeSet<String>,
}

impl InternalNode {
    pub fn new(node_id: NodeId, uri: impl Into<String>) -> Self {
        Self {
            node_id,
            uri: uri.into(),
            coordinator: false,
            connectors: BTreeSet::new(),
        }
    }

    pub fn with_coordinator(mut self, coordinator: bool) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn with_connectors<I, S>(mut self, connectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.connectors = connectors.into_iter().map(Into::into).collect();
        self
    }

    pub fn serves_catalog(&self, catalog: &str) -> bool {
        self.connectors.is_empty() || self.connectors.contains(catalog)
    }
}

/// One discovery announcement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAnnouncement {
    pub node: InternalNode,
    pub state: NodeState,
}

/// Source of membership announcements. `announcements` is called from the refresh loop.
pub trait NodeDiscovery: Send + Sync {
    fn announcements(&self) -> Result<Vec<NodeAnnouncement>>;
}

/// Membership fixed at startup from the `[discovery]` config section; states can be changed
/// at runtime, e.g. when a node announces shutdown or a test removes it.
pub struct StaticNodeDiscovery {
    nodes: Mutex<BTreeMap<NodeId, NodeAnnouncement>>,
}

impl StaticNodeDiscovery {
    pub fn new(nodes: Vec<NodeAnnouncement>) -> Self {
        Self {
            nodes: Mutex::new(
                nodes
                    .into_iter()
                    .map(|a| (a.node.node_id.clone(), a))
                    .collect(),
            ),
        }
    }

    pub fn from_config(configs: &[StaticNodeConfig]) -> Result<Self> {
        let mut nodes = Vec::with_capacity(configs.len());
        for cfg in configs {
            let state = NodeState::parse(&cfg.state).ok_or_else(|| {
                ExecError::invalid_plan(format!(
                    "node {} has unknown state {:?}",
                    cfg.node_id, cfg.state
                ))
            })?;
            let node = InternalNode::new(NodeId::new(cfg.node_id.clone()), cfg.uri.clone())
                .with_coordinator(cfg.coordinator)
                .with_connectors(cfg.connectors.iter().cloned());
            nodes.push(NodeAnnouncement { node, state });
        }
        Ok(Self::new(nodes))
    }

    pub fn set_state(&self, node_id: &NodeId, state: NodeState) -> bool {
        let mut nodes = self.nodes.lock().expect("static discovery lock");
        match nodes.get_mut(node_id) {
            Some(announcement) => {
                announcement.state = state;
                true
            }
            None => false,
        }
    }

    pub fn add(&self, node: InternalNode, state: NodeState) {
        let mut nodes = self.nodes.lock().expect("static discovery lock");
        nodes.insert(node.node_id.clone(), NodeAnnouncement { node, state });
    }

    /// A removed node stops announcing and ages out after the staleness bound.
    pub fn remove(&self, node_id: &NodeId) -> bool {
        self.nodes
            .lock()
            .expect("static discovery lock")
            .remove(node_id)
            .is_some()
    }
}

impl NodeDiscovery for StaticNodeDiscovery {
    fn announcements(&self) -> Result<Vec<NodeAnnouncement>> {
        Ok(self
            .nodes
            .lock()
            .expect("static discovery lock")
            .values()
            .cloned()
            .collect())
    }
}

/// Immutable membership snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllNodes {
    pub active: BTreeSet<InternalNode>,
    pub inactive: BTreeSet<InternalNode>,
    pub shutting_down: BTreeSet<InternalNode>,
    pub coordinators: BTreeSet<InternalNode>,
}

impl AllNodes {
    pub fn is_active(&self, node_id: &NodeId) -> bool {
        self.active.iter().any(|n| &n.node_id == node_id)
    }

    pub fn find(&self, node_id: &NodeId) -> Option<&InternalNode> {
        self.active
            .iter()
            .chain(self.shutting_down.iter())
            .chain(self.inactive.iter())
            .find(|n| &n.node_id == node_id)
    }
}

type NodesListener = Arc<dyn Fn(&Arc<AllNodes>) + Send + Sync>;

struct Seen {
    node: InternalNode,
    state: NodeState,
    last_seen: Instant,
}

struct RefreshLoop {
    stop: Mutex<bool>,
    cv: Condvar,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

pub struct NodeManager {
    discovery: Arc<dyn NodeDiscovery>,
    staleness: Duration,
    seen: Mutex<BTreeMap<NodeId, Seen>>,
    snapshot: RwLock<Arc<AllNodes>>,
    listeners: Mutex<Vec<NodesListener>>,
    refresh_loop: RefreshLoop,
    started: AtomicBool,
}

impl NodeManager {
    /// Performs one synchronous refresh so the first snapshot is populated.
    pub fn new(discovery: Arc<dyn NodeDiscovery>, staleness: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            discovery,
            staleness,
            seen: Mutex::new(BTreeMap::new()),
            snapshot: RwLock::new(Arc::new(AllNodes::default())),
            listeners: Mutex::new(Vec::new()),
            refresh_loop: RefreshLoop {
                stop: Mutex::new(false),
                cv: Condvar::new(),
                handle: Mutex::new(None),
            },
            started: AtomicBool::new(false),
        });
        manager.refresh_nodes();
        manager
    }

    pub fn get_all_nodes(&self) -> Arc<AllNodes> {
        Arc::clone(&self.snapshot.read().expect("node snapshot lock"))
    }

    pub fn get_active_connector_nodes(&self, catalog: &str) -> Vec<InternalNode> {
        self.get_all_nodes()
            .active
            .iter()
            .filter(|n| n.serves_catalog(catalog))
            .cloned()
            .collect()
    }

    /// Active worker nodes, falling back to every active node when all of them coordinate.
    pub fn get_active_workers(&self) -> Vec<InternalNode> {
        let nodes = self.get_all_nodes();
        let workers: Vec<_> = nodes.active.iter().filter(|n| !n.coordinator).cloned().collect();
        if workers.is_empty() {
            nodes.active.iter().cloned().collect()
        } else {
            workers
        }
    }

    pub fn get_coordinators(&self) -> BTreeSet<InternalNode> {
        self.get_all_nodes().coordinators.clone()
    }

    pub fn add_nodes_listener(&self, listener: impl Fn(&Arc<AllNodes>) + Send + Sync + 'static) {
        let listener: NodesListener = Arc::new(listener);
        let current = self.get_all_nodes();
        self.listeners
            .lock()
            .expect("node listeners lock")
            .push(Arc::clone(&listener));
        listener(&current);
    }

    /// Poll discovery once. On discovery failure the previous announcements are kept and
    /// age out through the staleness bound.
    pub fn refresh_nodes(&self) -> Arc<AllNodes> {
        let now = Instant::now();
        let announcements = match self.discovery.announcements() {
            Ok(announcements) => announcements,
            Err(err) => {
                warn!("node discovery failed: {}", err);
                Vec::new()
            }
        };
        let next = {
            let mut seen = self.seen.lock().expect("node seen lock");
            for announcement in announcements {
                seen.insert(
                    announcement.node.node_id.clone(),
                    Seen {
                        node: announcement.node,
                        state: announcement.state,
                        last_seen: now,
                    },
                );
            }
            let mut next = AllNodes::default();
            for entry in seen.values() {
                let state = if now.duration_since(entry.last_seen) > self.staleness {
                    NodeState::Inactive
                } else {
                    entry.state
                };
                match state {
                    NodeState::Active => {
                        next.active.insert(entry.node.clone());
                        if entry.node.coordinator {
                            next.coordinators.insert(entry.node.clone());
                        }
                    }
                    NodeState::Inactive => {
                        next.inactive.insert(entry.node.clone());
                    }
                    NodeState::ShuttingDown => {
                        next.shutting_down.insert(entry.node.clone());
                    }
                }
            }
            next
        };
        let changed = {
            let mut snapshot = self.snapshot.write().expect("node snapshot lock");
            if **snapshot == next {
                None
            } else {
                let next = Arc::new(next);
                *snapshot = Arc::clone(&next);
                Some(next)
            }
        };
        match changed {
            Some(next) => {
                info!(
                    "cluster membership changed: active={} inactive={} shutting_down={}",
                    next.active.len(),
                    next.inactive.len(),
                    next.shutting_down.len()
                );
                let listeners = self.listeners.lock().expect("node listeners lock").clone();
                for listener in listeners {
                    listener(&next);
                }
                next
            }
            None => self.get_all_nodes(),
        }
    }

    pub fn start_refresh(self: &Arc<Self>, interval: Duration) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let weak = Arc::downgrade(self);
        let interval = interval.max(Duration::from_millis(10));
        let handle = thread::Builder::new()
            .name("node_refresh".to_string())
            .spawn(move || {
                loop {
                    let Some(manager) = weak.upgrade() else {
                        break;
                    };
                    {
                        let stop = manager.refresh_loop.stop.lock().expect("node refresh lock");
                        let (stop, _) = manager
                            .refresh_loop
                            .cv
                            .wait_timeout(stop, interval)
                            .unwrap_or_else(|e| e.into_inner());
                        if *stop {
                            break;
                        }
                    }
                    manager.refresh_nodes();
                }
                debug!("node refresh loop stopped");
            })
            .map_err(|e| {
                ExecError::new(
                    ErrorCode::GenericInternalError,
                    format!("spawn node refresh thread: {}", e),
                )
            })?;
        *self.refresh_loop.handle.lock().expect("node refresh handle lock") = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        *self.refresh_loop.stop.lock().expect("node refresh lock") = true;
        self.refresh_loop.cv.notify_all();
        let handle = self
            .refresh_loop
            .handle
            .lock()
            .expect("node refresh handle lock")
            .take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for NodeManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn node(id: &str) -> InternalNode {
        InternalNode::new(NodeId::new(id), "")
    }

    #[test]
    fn snapshot_classifies_nodes_and_filters_connectors() {
        let discovery = Arc::new(StaticNodeDiscovery::new(vec![
            NodeAnnouncement {
                node: node("coord").with_coordinator(true),
                state: NodeState::Active,
            },
            NodeAnnouncement {
                node: node("w1").with_connectors(["sequence"]),
                state: NodeState::Active,
            },
            NodeAnnouncement {
                node: node("w2").with_connectors(["values"]),
                state: NodeState::ShuttingDown,
            },
        ]));
        let manager = NodeManager::new(discovery, Duration::from_secs(60));
        let all = manager.get_all_nodes();
        assert_eq!(all.active.len(), 2);
        assert_eq!(all.shutting_down.len(), 1);
        assert_eq!(manager.get_coordinators().len(), 1);
        let seq: Vec<_> = manager
            .get_active_connector_nodes("sequence")
            .into_iter()
            .map(|n| n.node_id.0)
            .collect();
        assert_eq!(seq, vec!["coord".to_string(), "w1".to_string()]);
        assert_eq!(manager.get_active_workers().len(), 1);
    }

    #[test]
    fn refresh_publishes_new_snapshot_and_notifies() {
        let discovery = Arc::new(StaticNodeDiscovery::new(vec![NodeAnnouncement {
            node: node("w1"),
            state: NodeState::Active,
        }]));
        let manager = NodeManager::new(Arc::clone(&discovery) as Arc<dyn NodeDiscovery>, Duration::from_secs(60));
        let before = manager.get_all_nodes();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        manager.add_nodes_listener(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        manager.refresh_nodes();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        discovery.set_state(&NodeId::new("w1"), NodeState::ShuttingDown);
        let after = manager.refresh_nodes();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(before.is_active(&NodeId::new("w1")));
        assert!(!after.is_active(&NodeId::new("w1")));
    }

    #[test]
    fn silent_nodes_become_inactive_after_staleness() {
        let discovery = Arc::new(StaticNodeDiscovery::new(vec![NodeAnnouncement {
            node: node("w1"),
            state: NodeState::Active,
        }]));
        let manager = NodeManager::new(Arc::clone(&discovery) as Arc<dyn NodeDiscovery>, Duration::from_millis(20));
        discovery.remove(&NodeId::new("w1"));
        assert!(manager.refresh_nodes().is_active(&NodeId::new("w1")));
        thread::sleep(Duration::from_millis(40));
        let all = manager.refresh_nodes();
        assert!(all.active.is_empty());
        assert_eq!(all.inactive.len(), 1);
    }

    #[test]
    fn rejects_unknown_configured_state() {
        let cfg = StaticNodeConfig {
            node_id: "w1".to_string(),
            uri: String::new(),
            coordinator: false,
            connectors: Vec::new(),
            state: "sleepy".to_string(),
        };
        assert!(StaticNodeDiscovery::from_config(&[cfg]).is_err());
    }
}
