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
//! Row hashing for partitioned exchange.
//!
//! FNV-1a over the little-endian bytes of each key value, combined across key channels.
//! Remote (cross-node) and local (intra-task) partitioning use different seeds so that rows
//! routed to one task by the remote hash still spread over all local partitions.

use arrow::array::{Array, AsArray};
use arrow::datatypes::{DataType, Float64Type, Int64Type};

use crate::common::status::{ExecError, Result};
use crate::exec::page::Page;

const FNV_SEED: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Seed for partitioning between tasks.
pub const REMOTE_PARTITION_SEED: u64 = FNV_SEED;
/// Seed for partitioning between drivers of one task.
pub const LOCAL_PARTITION_SEED: u64 = 0x9e3779b97f4a7c15;

fn fnv_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn hash_null(hash: u64) -> u64 {
    hash.wrapping_mul(FNV_PRIME)
}

/// Fold the key channels of every row into `hashes` (one entry per position).
pub fn hash_rows(page: &Page, channels: &[usize], seed: u64) -> Result<Vec<u64>> {
    let mut hashes = vec![seed; page.position_count()];
    for channel in channels {
        let array = page.block(*channel)?.array();
        match array.data_type() {
            DataType::Int64 => {
                let values = array.as_primitive::<Int64Type>();
                for (i, h) in hashes.iter_mut().enumerate() {
                    *h = if values.is_null(i) {
                        hash_null(*h)
                    } else {
                        fnv_bytes(*h, &values.value(i).to_le_bytes())
                    };
                }
            }
            DataType::Float64 => {
                let values = array.as_primitive::<Float64Type>();
                for (i, h) in hashes.iter_mut().enumerate() {
                    *h = if values.is_null(i) {
                        hash_null(*h)
                    } else {
                        fnv_bytes(*h, &values.value(i).to_bits().to_le_bytes())
                    };
                }
            }
            DataType::Boolean => {
                let values = array.as_boolean();
                for (i, h) in hashes.iter_mut().enumerate() {
                    *h = if values.is_null(i) {
                        hash_null(*h)
                    } else {
                        fnv_bytes(*h, &[values.value(i) as u8])
                    };
                }
            }
            DataType::Utf8 => {
                let values = array.as_string::<i32>();
                for (i, h) in hashes.iter_mut().enumerate() {
                    *h = if values.is_null(i) {
                        hash_null(*h)
                    } else {
                        fnv_bytes(*h, values.value(i).as_bytes())
                    };
                }
            }
            other => {
                return Err(ExecError::not_supported(format!(
                    "hash partitioning on {:?}",
                    other
                )));
            }
        }
    }
    Ok(hashes)
}

/// Maps rows onto `partition_count` partitions by hashing key channels.
#[derive(Clone, Debug)]
pub struct HashPartitionFunction {
    partition_count: usize,
    channels: Vec<usize>,
    seed: u64,
}

impl HashPartitionFunction {
    pub fn new(partition_count: usize, channels: Vec<usize>, seed: u64) -> Result<Self> {
        if partition_count == 0 {
            return Err(ExecError::invalid_plan("partition count must be positive"));
        }
        Ok(Self {
            partition_count,
            channels,
            seed,
        })
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Position lists per partition, each in input order.
    pub fn partition_positions(&self, page: &Page) -> Result<Vec<Vec<u32>>> {
        let hashes = hash_rows(page, &self.channels, self.seed)?;
        let mut positions = vec![Vec::new(); self.partition_count];
        for (row, hash) in hashes.into_iter().enumerate() {
            let partition = (hash % self.partition_count as u64) as usize;
            positions[partition].push(row as u32);
        }
        Ok(positions)
    }

    /// Split a page into one sub-page per non-empty partition.
    pub fn partition_page(&self, page: &Page) -> Result<Vec<(usize, Page)>> {
        let positions = self.partition_positions(page)?;
        let mut out = Vec::new();
        for (partition, rows) in positions.into_iter().enumerate() {
            if rows.is_empty() {
                continue;
            }
            if rows.len() == page.position_count() {
                out.push((partition, page.clone()));
            } else {
                out.push((partition, page.copy_positions(&rows)?));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::page::Block;

    #[test]
    fn same_key_lands_in_same_partition() {
        let page = Page::try_new(vec![Block::from_longs(vec![7, 8, 7, 9, 7])]).unwrap();
        let f = HashPartitionFunction::new(4, vec![0], REMOTE_PARTITION_SEED).unwrap();
        let positions = f.partition_positions(&page).unwrap();
        let owner = positions
            .iter()
            .position(|rows| rows.contains(&0))
            .unwrap();
        assert!(positions[owner].contains(&2));
        assert!(positions[owner].contains(&4));
        let total: usize = positions.iter().map(|p| p.len()).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn partition_page_preserves_all_rows() {
        let page = Page::try_new(vec![
            Block::from_longs((0..100).collect()),
            Block::from_strings(&(0..100).map(|i| format!("v{}", i)).collect::<Vec<_>>()),
        ])
        .unwrap();
        let f = HashPartitionFunction::new(3, vec![0, 1], LOCAL_PARTITION_SEED).unwrap();
        let parts = f.partition_page(&page).unwrap();
        let rows: usize = parts.iter().map(|(_, p)| p.position_count()).sum();
        assert_eq!(rows, 100);
        assert!(parts.len() > 1);
    }

    #[test]
    fn seeds_change_placement() {
        let page = Page::try_new(vec![Block::from_longs((0..64).collect())]).unwrap();
        let remote = hash_rows(&page, &[0], REMOTE_PARTITION_SEED).unwrap();
        let local = hash_rows(&page, &[0], LOCAL_PARTITION_SEED).unwrap();
        assert_ne!(remote, local);
    }
}
