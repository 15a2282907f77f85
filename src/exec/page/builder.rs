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
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder};

use super::{Block, ColumnType, Page, Value};
use crate::common::status::{ExecError, Result};

enum ColumnBuilder {
    Boolean(BooleanBuilder),
    Int64(Int64Builder),
    Float64(Float64Builder),
    Utf8(StringBuilder),
}

impl ColumnBuilder {
    fn new(column_type: ColumnType) -> Self {
        match column_type {
            ColumnType::Boolean => ColumnBuilder::Boolean(BooleanBuilder::new()),
            ColumnType::Int64 => ColumnBuilder::Int64(Int64Builder::new()),
            ColumnType::Float64 => ColumnBuilder::Float64(Float64Builder::new()),
            ColumnType::Utf8 => ColumnBuilder::Utf8(StringBuilder::new()),
        }
    }

    /// Appends one value and returns its estimated size in bytes.
    fn append(&mut self, value: &Value) -> Result<usize> {
        match (self, value) {
            (ColumnBuilder::Boolean(b), Value::Null) => b.append_null(),
            (ColumnBuilder::Int64(b), Value::Null) => b.append_null(),
            (ColumnBuilder::Float64(b), Value::Null) => b.append_null(),
            (ColumnBuilder::Utf8(b), Value::Null) => b.append_null(),
            (ColumnBuilder::Boolean(b), Value::Boolean(v)) => b.append_value(*v),
            (ColumnBuilder::Int64(b), Value::Int64(v)) => b.append_value(*v),
            (ColumnBuilder::Float64(b), Value::Float64(v)) => b.append_value(*v),
            (ColumnBuilder::Float64(b), Value::Int64(v)) => b.append_value(*v as f64),
            (ColumnBuilder::Utf8(b), Value::Utf8(v)) => {
                b.append_value(v);
                return Ok(v.len() + 4);
            }
            (_, value) => {
                return Err(ExecError::internal(format!(
                    "page builder: value {} does not match column type",
                    value
                )));
            }
        }
        Ok(match value {
            Value::Boolean(_) => 1,
            _ => 8,
        })
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Boolean(b) => Arc::new(b.finish()),
            ColumnBuilder::Int64(b) => Arc::new(b.finish()),
            ColumnBuilder::Float64(b) => Arc::new(b.finish()),
            ColumnBuilder::Utf8(b) => Arc::new(b.finish()),
        }
    }
}

fn accepts(column_type: ColumnType, value: &Value) -> bool {
    matches!(
        (column_type, value),
        (_, Value::Null)
            | (ColumnType::Boolean, Value::Boolean(_))
            | (ColumnType::Int64, Value::Int64(_))
            | (ColumnType::Float64, Value::Float64(_) | Value::Int64(_))
            | (ColumnType::Utf8, Value::Utf8(_))
    )
}

/// Row-at-a-time page accumulator.
///
/// `is_full` trips on whichever of the byte or row threshold is reached first; `build`
/// seals the rows into an immutable page and resets the builder.
pub struct PageBuilder {
    types: Vec<ColumnType>,
    builders: Vec<ColumnBuilder>,
    position_count: usize,
    estimated_bytes: usize,
    target_bytes: usize,
    target_rows: usize,
}

impl PageBuilder {
    pub fn new(types: Vec<ColumnType>, target_bytes: usize, target_rows: usize) -> Self {
        let builders = types.iter().map(|t| ColumnBuilder::new(*t)).collect();
        Self {
            types,
            builders,
            position_count: 0,
            estimated_bytes: 0,
            target_bytes: target_bytes.max(1),
            target_rows: target_rows.max(1),
        }
    }

    pub fn types(&self) -> &[ColumnType] {
        &self.types
    }

    pub fn append_row(&mut self, row: &[Value]) -> Result<()> {
        if row.len() != self.builders.len() {
            return Err(ExecError::internal(format!(
                "page builder expects {} values per row, got {}",
                self.builders.len(),
                row.len()
            )));
        }
        for (column_type, value) in self.types.iter().zip(row) {
            if !accepts(*column_type, value) {
                return Err(ExecError::internal(format!(
                    "page builder: value {} does not match column type {:?}",
                    value, column_type
                )));
            }
        }
        for (builder, value) in self.builders.iter_mut().zip(row) {
            self.estimated_bytes += builder.append(value)?;
        }
        self.position_count += 1;
        Ok(())
    }

    pub fn position_count(&self) -> usize {
        self.position_count
    }

    pub fn is_empty(&self) -> bool {
        self.position_count == 0
    }

    pub fn estimated_size_in_bytes(&self) -> usize {
        self.estimated_bytes
    }

    pub fn is_full(&self) -> bool {
        self.position_count >= self.target_rows || self.estimated_bytes >= self.target_bytes
    }

    pub fn build(&mut self) -> Result<Page> {
        let blocks = self
            .builders
            .iter_mut()
            .map(|b| Block::try_new(b.finish()))
            .collect::<Result<Vec<_>>>()?;
        let page = Page::with_position_count(blocks, self.position_count)?;
        self.position_count = 0;
        self.estimated_bytes = 0;
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushes_on_row_threshold() {
        let mut builder = PageBuilder::new(vec![ColumnType::Int64], usize::MAX, 3);
        for i in 0..3 {
            assert!(!builder.is_full());
            builder.append_row(&[Value::Int64(i)]).unwrap();
        }
        assert!(builder.is_full());
        let page = builder.build().unwrap();
        assert_eq!(page.position_count(), 3);
        assert!(builder.is_empty());
        assert!(!builder.is_full());
    }

    #[test]
    fn flushes_on_byte_threshold() {
        let mut builder = PageBuilder::new(vec![ColumnType::Utf8], 20, usize::MAX);
        builder
            .append_row(&[Value::Utf8("0123456789".to_string())])
            .unwrap();
        assert!(!builder.is_full());
        builder
            .append_row(&[Value::Utf8("0123456789".to_string())])
            .unwrap();
        assert!(builder.is_full());
    }

    #[test]
    fn rejects_mismatched_values() {
        let mut builder = PageBuilder::new(vec![ColumnType::Int64, ColumnType::Boolean], 1024, 16);
        assert!(builder.append_row(&[Value::Int64(1)]).is_err());
        assert!(
            builder
                .append_row(&[Value::Utf8("x".to_string()), Value::Boolean(true)])
                .is_err()
        );
        builder
            .append_row(&[Value::Null, Value::Boolean(false)])
            .unwrap();
        let page = builder.build().unwrap();
        assert!(page.block(0).unwrap().is_null(0));
    }
}
