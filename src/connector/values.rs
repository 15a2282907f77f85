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
//! Built-in `values` connector: rows are embedded in the split as JSON arrays.

use super::{PageSource, PageSourceProvider, connector_error};
use crate::common::status::Result;
use crate::exec::page::{ColumnType, Page, PageBuilder, Value};
use crate::runtime::runtime_state::ExecOptions;
use crate::scheduler::split::Split;

pub const CATALOG: &str = "values";

/// Split carrying `rows`; every row must have one JSON scalar per output column.
pub fn split(rows: serde_json::Value) -> Split {
    Split::new(CATALOG, serde_json::json!({ "rows": rows }))
}

pub struct ValuesConnector;

impl PageSourceProvider for ValuesConnector {
    fn name(&self) -> &'static str {
        CATALOG
    }

    fn create_page_source(
        &self,
        split: &Split,
        output_types: &[ColumnType],
        options: &ExecOptions,
    ) -> Result<Box<dyn PageSource>> {
        let rows = split
            .info
            .get("rows")
            .and_then(|r| r.as_array())
            .ok_or_else(|| connector_error(CATALOG, "split has no rows array"))?;
        let mut decoded = Vec::with_capacity(rows.len());
        for row in rows {
            let cells = row
                .as_array()
                .ok_or_else(|| connector_error(CATALOG, "row is not an array"))?;
            if cells.len() != output_types.len() {
                return Err(connector_error(
                    CATALOG,
                    format!("row has {} cells, expected {}", cells.len(), output_types.len()),
                ));
            }
            let values = cells
                .iter()
                .zip(output_types)
                .map(|(cell, ty)| json_to_value(cell, *ty))
                .collect::<Result<Vec<_>>>()?;
            decoded.push(values);
        }
        Ok(Box::new(ValuesPageSource {
            types: output_types.to_vec(),
            rows: decoded.into_iter(),
            options: *options,
        }))
    }
}

fn json_to_value(cell: &serde_json::Value, ty: ColumnType) -> Result<Value> {
    let value = match (cell, ty) {
        (serde_json::Value::Null, _) => Some(Value::Null),
        (serde_json::Value::Bool(b), ColumnType::Boolean) => Some(Value::Boolean(*b)),
        (serde_json::Value::Number(n), ColumnType::Int64) => n.as_i64().map(Value::Int64),
        (serde_json::Value::Number(n), ColumnType::Float64) => n.as_f64().map(Value::Float64),
        (serde_json::Value::String(s), ColumnType::Utf8) => Some(Value::Utf8(s.clone())),
        _ => None,
    };
    value.ok_or_else(|| connector_error(CATALOG, format!("cell {} is not {:?}", cell, ty)))
}

struct ValuesPageSource {
    types: Vec<ColumnType>,
    rows: std::vec::IntoIter<Vec<Value>>,
    options: ExecOptions,
}

impl PageSource for ValuesPageSource {
    fn next_page(&mut self) -> Result<Option<Page>> {
        let mut builder = PageBuilder::new(
            self.types.clone(),
            self.options.page_target_bytes,
            self.options.page_target_rows,
        );
        while !builder.is_full() {
            let Some(row) = self.rows.next() else {
                break;
            };
            builder.append_row(&row)?;
        }
        if builder.is_empty() {
            return Ok(None);
        }
        Ok(Some(builder.build()?))
    }

    fn is_finished(&self) -> bool {
        self.rows.len() == 0
    }
}
