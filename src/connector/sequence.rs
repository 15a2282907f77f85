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
//! Built-in `sequence` connector.
//!
//! A split covers the half-open range `[start, end)` and produces a single Int64 column in
//! pages of at most `page_target_rows` rows.

use serde::{Deserialize, Serialize};

use super::{PageSource, PageSourceProvider, connector_error};
use crate::common::status::Result;
use crate::exec::page::{Block, ColumnType, Page};
use crate::runtime::runtime_state::ExecOptions;
use crate::scheduler::split::Split;

pub const CATALOG: &str = "sequence";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSplit {
    pub start: i64,
    pub end: i64,
}

/// Split over `[start, end)` with a size estimate of 8 bytes per row.
pub fn split(start: i64, end: i64) -> Split {
    let rows = end.saturating_sub(start).max(0) as u64;
    Split::new(CATALOG, serde_json::json!({ "start": start, "end": end }))
        .with_estimated_size(rows * 8)
}

/// Splits of `rows_per_split` rows covering `[0, total)`.
pub fn splits(total: i64, rows_per_split: i64) -> Vec<Split> {
    let step = rows_per_split.max(1);
    (0..total)
        .step_by(step as usize)
        .map(|start| split(start, (start + step).min(total)))
        .collect()
}

pub struct SequenceConnector;

impl PageSourceProvider for SequenceConnector {
    fn name(&self) -> &'static str {
        CATALOG
    }

    fn create_page_source(
        &self,
        split: &Split,
        output_types: &[ColumnType],
        options: &ExecOptions,
    ) -> Result<Box<dyn PageSource>> {
        if output_types != [ColumnType::Int64] {
            return Err(connector_error(
                CATALOG,
                format!("produces one Int64 column, scan expects {:?}", output_types),
            ));
        }
        let range: SequenceSplit = serde_json::from_value(split.info.clone())
            .map_err(|e| connector_error(CATALOG, format!("malformed split: {}", e)))?;
        if range.end < range.start {
            return Err(connector_error(
                CATALOG,
                format!("empty range [{}, {})", range.start, range.end),
            ));
        }
        Ok(Box::new(SequencePageSource {
            next: range.start,
            end: range.end,
            rows_per_page: options.page_target_rows.max(1) as i64,
            completed_bytes: 0,
        }))
    }
}

struct SequencePageSource {
    next: i64,
    end: i64,
    rows_per_page: i64,
    completed_bytes: u64,
}

impl PageSource for SequencePageSource {
    fn next_page(&mut self) -> Result<Option<Page>> {
        if self.next >= self.end {
            return Ok(None);
        }
        let stop = self.next.saturating_add(self.rows_per_page).min(self.end);
        let values: Vec<i64> = (self.next..stop).collect();
        self.next = stop;
        let page = Page::try_new(vec![Block::from_longs(values)])?;
        self.completed_bytes += page.retained_size_in_bytes() as u64;
        Ok(Some(page))
    }

    fn is_finished(&self) -> bool {
        self.next >= self.end
    }

    fn completed_bytes(&self) -> u64 {
        self.completed_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_cover_the_range() {
        let options = ExecOptions {
            page_target_bytes: 1 << 20,
            page_target_rows: 4,
        };
        let mut source = SequenceConnector
            .create_page_source(&split(10, 20), &[ColumnType::Int64], &options)
            .unwrap();
        let mut seen = Vec::new();
        while let Some(page) = source.next_page().unwrap() {
            assert!(page.position_count() <= 4);
            for pos in 0..page.position_count() {
                seen.push(page.block(0).unwrap().get_long(pos).unwrap());
            }
        }
        assert!(source.is_finished());
        assert_eq!(seen, (10..20).collect::<Vec<_>>());
    }

    #[test]
    fn splits_partition_the_total() {
        let all = splits(10, 4);
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].info, serde_json::json!({"start": 8, "end": 10}));
        assert_eq!(all[0].estimated_size_bytes, 32);
    }
}
