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
//! Bucket-to-node placement for bucketed execution.

use std::sync::Mutex;

use crate::common::status::{ErrorCode, ExecError, Result};
use crate::scheduler::node_manager::InternalNode;

pub trait BucketNodeMap: Send + Sync {
    fn bucket_count(&self) -> usize;

    fn get_assigned_node(&self, bucket: usize) -> Option<InternalNode>;

    fn assign_bucket_to_node(&self, bucket: usize, node: InternalNode) -> Result<()>;

    fn is_dynamic(&self) -> bool;
}

/// Pre-computed placement. Reassignment of any bucket is an invariant violation.
pub struct FixedBucketNodeMap {
    nodes: Vec<InternalNode>,
}

impl FixedBucketNodeMap {
    pub fn new(nodes: Vec<InternalNode>) -> Self {
        Self { nodes }
    }

    /// Round-robin buckets over `nodes`.
    pub fn uniform(bucket_count: usize, nodes: &[InternalNode]) -> Result<Self> {
        if nodes.is_empty() {
            return Err(ExecError::new(
                ErrorCode::NoNodesAvailable,
                "no nodes available for bucketed placement",
            ));
        }
        Ok(Self::new(
            (0..bucket_count)
                .map(|b| nodes[b % nodes.len()].clone())
                .collect(),
        ))
    }
}

impl BucketNodeMap for FixedBucketNodeMap {
    fn bucket_count(&self) -> usize {
        self.nodes.len()
    }

    fn get_assigned_node(&self, bucket: usize) -> Option<InternalNode> {
        self.nodes.get(bucket).cloned()
    }

    fn assign_bucket_to_node(&self, bucket: usize, node: InternalNode) -> Result<()> {
        Err(ExecError::invariant(format!(
            "cannot reassign bucket {} to node {} in a fixed bucket node map",
            bucket, node.node_id
        )))
    }

    fn is_dynamic(&self) -> bool {
        false
    }
}

/// Buckets are placed lazily; each bucket can be assigned exactly once.
pub struct DynamicBucketNodeMap {
    nodes: Mutex<Vec<Option<InternalNode>>>,
}

impl DynamicBucketNodeMap {
    pub fn new(bucket_count: usize) -> Self {
        Self {
            nodes: Mutex::new(vec![None; bucket_count]),
        }
    }
}

impl BucketNodeMap for DynamicBucketNodeMap {
    fn bucket_count(&self) -> usize {
        self.nodes.lock().expect("bucket node map lock").len()
    }

    fn get_assigned_node(&self, bucket: usize) -> Option<InternalNode> {
        self.nodes
            .lock()
            .expect("bucket node map lock")
            .get(bucket)
            .cloned()
            .flatten()
    }

    fn assign_bucket_to_node(&self, bucket: usize, node: InternalNode) -> Result<()> {
        let mut nodes = self.nodes.lock().expect("bucket node map lock");
        let count = nodes.len();
        let slot = nodes.get_mut(bucket).ok_or_else(|| {
            ExecError::invariant(format!("bucket {} out of range for {} buckets", bucket, count))
        })?;
        match slot {
            Some(existing) if existing.node_id != node.node_id => Err(ExecError::invariant(format!(
                "bucket {} already assigned to node {}",
                bucket, existing.node_id
            ))),
            Some(_) => Ok(()),
            None => {
                *slot = Some(node);
                Ok(())
            }
        }
    }

    fn is_dynamic(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::NodeId;

    fn node(id: &str) -> InternalNode {
        InternalNode::new(NodeId::new(id), "")
    }

    #[test]
    fn fixed_map_is_immutable() {
        let map = FixedBucketNodeMap::uniform(4, &[node("a"), node("b")]).unwrap();
        assert_eq!(map.get_assigned_node(2).unwrap().node_id, NodeId::new("a"));
        assert_eq!(map.get_assigned_node(3).unwrap().node_id, NodeId::new("b"));
        let err = map.assign_bucket_to_node(0, node("a")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvariantViolation);
        assert!(FixedBucketNodeMap::uniform(4, &[]).is_err());
    }

    #[test]
    fn dynamic_map_assigns_once() {
        let map = DynamicBucketNodeMap::new(2);
        assert!(map.get_assigned_node(0).is_none());
        map.assign_bucket_to_node(0, node("a")).unwrap();
        map.assign_bucket_to_node(0, node("a")).unwrap();
        assert!(map.assign_bucket_to_node(0, node("b")).is_err());
        assert!(map.assign_bucket_to_node(5, node("b")).is_err());
    }
}
