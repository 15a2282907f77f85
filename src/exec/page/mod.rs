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
//! Columnar page model.
//!
//! Responsibilities:
//! - Defines `Block` (one typed column) and `Page` (blocks sharing one position count).
//! - Pages are immutable after construction and cheap to clone across threads.
//!
//! Key exported interfaces:
//! - Types: `ColumnType`, `Value`, `Block`, `Page`, `PageBuilder`, `PagesSerde`.

mod builder;
mod pages_serde;

pub use builder::PageBuilder;
pub use pages_serde::PagesSerde;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, UInt32Array,
    new_null_array,
};
use arrow::compute::{filter, take};
use arrow::datatypes::DataType;
use serde::{Deserialize, Serialize};

use crate::common::status::{ExecError, Result};

/// Element type of a block.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Boolean,
    Int64,
    Float64,
    Utf8,
}

impl ColumnType {
    pub fn to_arrow(self) -> DataType {
        match self {
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Utf8 => DataType::Utf8,
        }
    }

    pub fn from_arrow(data_type: &DataType) -> Result<Self> {
        match data_type {
            DataType::Boolean => Ok(ColumnType::Boolean),
            DataType::Int64 => Ok(ColumnType::Int64),
            DataType::Float64 => Ok(ColumnType::Float64),
            DataType::Utf8 => Ok(ColumnType::Utf8),
            other => Err(ExecError::not_supported(format!(
                "unsupported block type: {:?}",
                other
            ))),
        }
    }

    /// Approximate bytes per element used for page sizing.
    pub fn estimated_width(self) -> usize {
        match self {
            ColumnType::Boolean => 1,
            ColumnType::Int64 | ColumnType::Float64 => 8,
            ColumnType::Utf8 => 16,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Int64 | ColumnType::Float64)
    }
}

/// Single scalar value, used for literals, group keys and row access.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::Utf8(a), Value::Utf8(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(v) => v.hash(state),
            Value::Int64(v) => v.hash(state),
            Value::Float64(v) => v.to_bits().hash(state),
            Value::Utf8(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Utf8(v) => write!(f, "'{}'", v),
        }
    }
}

impl Value {
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Int64(_) => Some(ColumnType::Int64),
            Value::Float64(_) => Some(ColumnType::Float64),
            Value::Utf8(_) => Some(ColumnType::Utf8),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            Value::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Materialize the value as an array of `len` copies.
    pub fn to_array(&self, column_type: ColumnType, len: usize) -> Result<ArrayRef> {
        let array: ArrayRef = match (self, column_type) {
            (Value::Null, ty) => new_null_array(&ty.to_arrow(), len),
            (Value::Boolean(v), ColumnType::Boolean) => {
                Arc::new(BooleanArray::from(vec![*v; len]))
            }
            (Value::Int64(v), ColumnType::Int64) => Arc::new(Int64Array::from_value(*v, len)),
            (Value::Int64(v), ColumnType::Float64) => {
                Arc::new(Float64Array::from_value(*v as f64, len))
            }
            (Value::Float64(v), ColumnType::Float64) => {
                Arc::new(Float64Array::from_value(*v, len))
            }
            (Value::Utf8(v), ColumnType::Utf8) => {
                Arc::new(StringArray::from_iter_values(std::iter::repeat_n(v.as_str(), len)))
            }
            (value, ty) => {
                return Err(ExecError::invalid_plan(format!(
                    "value {} cannot be used as {:?}",
                    value, ty
                )));
            }
        };
        Ok(array)
    }
}

/// One typed column of a page.
#[derive(Clone, Debug)]
pub struct Block {
    array: ArrayRef,
    column_type: ColumnType,
}

impl Block {
    pub fn try_new(array: ArrayRef) -> Result<Self> {
        let column_type = ColumnType::from_arrow(array.data_type())?;
        Ok(Self { array, column_type })
    }

    pub fn from_longs(values: Vec<i64>) -> Self {
        Self {
            array: Arc::new(Int64Array::from(values)),
            column_type: ColumnType::Int64,
        }
    }

    pub fn from_optional_longs(values: Vec<Option<i64>>) -> Self {
        Self {
            array: Arc::new(Int64Array::from(values)),
            column_type: ColumnType::Int64,
        }
    }

    pub fn from_doubles(values: Vec<f64>) -> Self {
        Self {
            array: Arc::new(Float64Array::from(values)),
            column_type: ColumnType::Float64,
        }
    }

    pub fn from_booleans(values: Vec<bool>) -> Self {
        Self {
            array: Arc::new(BooleanArray::from(values)),
            column_type: ColumnType::Boolean,
        }
    }

    pub fn from_strings<S: AsRef<str>>(values: &[S]) -> Self {
        Self {
            array: Arc::new(StringArray::from_iter_values(
                values.iter().map(|s| s.as_ref()),
            )),
            column_type: ColumnType::Utf8,
        }
    }

    pub fn position_count(&self) -> usize {
        self.array.len()
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn array(&self) -> &ArrayRef {
        &self.array
    }

    pub fn is_null(&self, position: usize) -> bool {
        self.array.is_null(position)
    }

    fn check_position(&self, position: usize) -> Result<()> {
        if position >= self.array.len() {
            return Err(ExecError::invariant(format!(
                "position {} out of range for block of {} positions",
                position,
                self.array.len()
            )));
        }
        Ok(())
    }

    fn type_mismatch(&self, expected: ColumnType) -> ExecError {
        ExecError::internal(format!(
            "block type mismatch: expected {:?}, actual {:?}",
            expected, self.column_type
        ))
    }

    pub fn get_long(&self, position: usize) -> Result<i64> {
        self.check_position(position)?;
        let array = self
            .array
            .as_any()
            .downcast_ref::<Int64Array>()
            .ok_or_else(|| self.type_mismatch(ColumnType::Int64))?;
        Ok(array.value(position))
    }

    pub fn get_double(&self, position: usize) -> Result<f64> {
        self.check_position(position)?;
        let array = self
            .array
            .as_any()
            .downcast_ref::<Float64Array>()
            .ok_or_else(|| self.type_mismatch(ColumnType::Float64))?;
        Ok(array.value(position))
    }

    pub fn get_boolean(&self, position: usize) -> Result<bool> {
        self.check_position(position)?;
        let array = self
            .array
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| self.type_mismatch(ColumnType::Boolean))?;
        Ok(array.value(position))
    }

    pub fn get_string(&self, position: usize) -> Result<&str> {
        self.check_position(position)?;
        let array = self
            .array
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| self.type_mismatch(ColumnType::Utf8))?;
        Ok(array.value(position))
    }

    pub fn get_value(&self, position: usize) -> Result<Value> {
        self.check_position(position)?;
        if self.is_null(position) {
            return Ok(Value::Null);
        }
        Ok(match self.column_type {
            ColumnType::Boolean => Value::Boolean(self.get_boolean(position)?),
            ColumnType::Int64 => Value::Int64(self.get_long(position)?),
            ColumnType::Float64 => Value::Float64(self.get_double(position)?),
            ColumnType::Utf8 => Value::Utf8(self.get_string(position)?.to_string()),
        })
    }

    /// New block holding only `positions`, in the given order.
    pub fn copy_positions(&self, positions: &[u32]) -> Result<Block> {
        let indices = UInt32Array::from(positions.to_vec());
        let array = take(self.array.as_ref(), &indices, None)?;
        Ok(Self {
            array,
            column_type: self.column_type,
        })
    }

    pub fn region(&self, offset: usize, length: usize) -> Result<Block> {
        if offset.saturating_add(length) > self.array.len() {
            return Err(ExecError::invariant(format!(
                "region [{}, {}) out of range for block of {} positions",
                offset,
                offset + length,
                self.array.len()
            )));
        }
        Ok(Self {
            array: self.array.slice(offset, length),
            column_type: self.column_type,
        })
    }

    fn filter(&self, predicate: &BooleanArray) -> Result<Block> {
        let array = filter(self.array.as_ref(), predicate)?;
        Ok(Self {
            array,
            column_type: self.column_type,
        })
    }

    pub fn retained_size_in_bytes(&self) -> usize {
        self.array.get_array_memory_size()
    }
}

/// Immutable batch of blocks with a shared position count.
#[derive(Clone, Debug)]
pub struct Page {
    blocks: Arc<[Block]>,
    position_count: usize,
}

impl Page {
    pub fn try_new(blocks: Vec<Block>) -> Result<Self> {
        let Some(first) = blocks.first() else {
            return Err(ExecError::invariant(
                "page without blocks needs an explicit position count",
            ));
        };
        let position_count = first.position_count();
        Self::with_position_count(blocks, position_count)
    }

    /// Build a page, allowing zero blocks (e.g. rows for `count(*)`).
    pub fn with_position_count(blocks: Vec<Block>, position_count: usize) -> Result<Self> {
        for (idx, block) in blocks.iter().enumerate() {
            if block.position_count() != position_count {
                return Err(ExecError::invariant(format!(
                    "block {} has {} positions, page has {}",
                    idx,
                    block.position_count(),
                    position_count
                )));
            }
        }
        Ok(Self {
            blocks: blocks.into(),
            position_count,
        })
    }

    pub fn position_count(&self) -> usize {
        self.position_count
    }

    pub fn is_empty(&self) -> bool {
        self.position_count == 0
    }

    pub fn channel_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, channel: usize) -> Result<&Block> {
        self.blocks.get(channel).ok_or_else(|| {
            ExecError::invariant(format!(
                "channel {} out of range for page with {} blocks",
                channel,
                self.blocks.len()
            ))
        })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn types(&self) -> Vec<ColumnType> {
        self.blocks.iter().map(|b| b.column_type()).collect()
    }

    pub fn retained_size_in_bytes(&self) -> usize {
        self.blocks.iter().map(|b| b.retained_size_in_bytes()).sum()
    }

    pub fn copy_positions(&self, positions: &[u32]) -> Result<Page> {
        let blocks = self
            .blocks
            .iter()
            .map(|b| b.copy_positions(positions))
            .collect::<Result<Vec<_>>>()?;
        Page::with_position_count(blocks, positions.len())
    }

    pub fn region(&self, offset: usize, length: usize) -> Result<Page> {
        let blocks = self
            .blocks
            .iter()
            .map(|b| b.region(offset, length))
            .collect::<Result<Vec<_>>>()?;
        Page::with_position_count(blocks, length)
    }

    pub fn filter(&self, predicate: &BooleanArray) -> Result<Page> {
        if predicate.len() != self.position_count {
            return Err(ExecError::invariant(format!(
                "filter mask has {} positions, page has {}",
                predicate.len(),
                self.position_count
            )));
        }
        let selected = predicate.true_count();
        let blocks = self
            .blocks
            .iter()
            .map(|b| b.filter(predicate))
            .collect::<Result<Vec<_>>>()?;
        Page::with_position_count(blocks, selected)
    }

    pub fn select_columns(&self, channels: &[usize]) -> Result<Page> {
        let blocks = channels
            .iter()
            .map(|c| self.block(*c).cloned())
            .collect::<Result<Vec<_>>>()?;
        Page::with_position_count(blocks, self.position_count)
    }

    pub fn append_column(&self, block: Block) -> Result<Page> {
        let mut blocks = self.blocks.to_vec();
        blocks.push(block);
        Page::with_position_count(blocks, self.position_count)
    }

    pub fn row_values(&self, position: usize) -> Result<Vec<Value>> {
        self.blocks.iter().map(|b| b.get_value(position)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rejects_mismatched_block_lengths() {
        let err = Page::try_new(vec![
            Block::from_longs(vec![1, 2, 3]),
            Block::from_longs(vec![1, 2]),
        ])
        .unwrap_err();
        assert_eq!(err.code(), crate::common::status::ErrorCode::InvariantViolation);
    }

    #[test]
    fn copy_positions_keeps_requested_order() {
        let page = Page::try_new(vec![
            Block::from_longs(vec![10, 20, 30, 40]),
            Block::from_strings(&["a", "b", "c", "d"]),
        ])
        .unwrap();
        let copied = page.copy_positions(&[3, 0]).unwrap();
        assert_eq!(copied.position_count(), 2);
        assert_eq!(
            copied.row_values(0).unwrap(),
            vec![Value::Int64(40), Value::Utf8("d".to_string())]
        );
        assert_eq!(copied.block(0).unwrap().get_long(1).unwrap(), 10);
    }

    #[test]
    fn retained_size_is_sum_of_blocks() {
        let a = Block::from_longs((0..100).collect());
        let b = Block::from_doubles(vec![1.5; 100]);
        let expected = a.retained_size_in_bytes() + b.retained_size_in_bytes();
        let page = Page::try_new(vec![a, b]).unwrap();
        assert_eq!(page.retained_size_in_bytes(), expected);
        assert!(expected >= 1600);
    }

    #[test]
    fn nulls_read_as_null_values() {
        let block = Block::from_optional_longs(vec![Some(1), None]);
        assert!(!block.is_null(0));
        assert!(block.is_null(1));
        assert_eq!(block.get_value(1).unwrap(), Value::Null);
        assert!(block.get_long(5).is_err());
        assert!(block.get_double(0).is_err());
    }

    #[test]
    fn zero_column_page_tracks_positions() {
        let page = Page::with_position_count(Vec::new(), 7).unwrap();
        assert_eq!(page.position_count(), 7);
        assert_eq!(page.copy_positions(&[1, 2]).unwrap().position_count(), 2);
    }
}
