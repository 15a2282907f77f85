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
use std::io::Cursor;
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::ipc::CompressionType;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::{IpcWriteOptions, StreamWriter};
use arrow::record_batch::RecordBatchOptions;
use bytes::Bytes;

use super::{Block, ColumnType, Page};
use crate::common::status::{ErrorCode, ExecError, Result};

/// Encodes page lists as an Arrow IPC stream, optionally LZ4 compressed.
///
/// Every page in one payload must share the same channel types.
#[derive(Clone, Copy, Debug)]
pub struct PagesSerde {
    compression: bool,
}

impl PagesSerde {
    pub fn new(compression: bool) -> Self {
        Self { compression }
    }

    pub fn serialize(&self, pages: &[Page]) -> Result<Bytes> {
        let Some(first) = pages.first() else {
            return Ok(Bytes::new());
        };
        let types = first.types();
        let schema = schema_for(&types);
        let mut options = IpcWriteOptions::default();
        if self.compression {
            options = options.try_with_compression(Some(CompressionType::LZ4_FRAME))?;
        }
        let mut buf = Vec::new();
        {
            let mut writer = StreamWriter::try_new_with_options(&mut buf, &schema, options)?;
            for page in pages {
                if page.types() != types {
                    return Err(ExecError::internal(
                        "cannot serialize pages with different channel types in one payload",
                    ));
                }
                let batch = RecordBatch::try_new_with_options(
                    Arc::clone(&schema),
                    page.blocks().iter().map(|b| Arc::clone(b.array())).collect(),
                    &RecordBatchOptions::new().with_row_count(Some(page.position_count())),
                )?;
                writer.write(&batch)?;
            }
            writer.finish()?;
        }
        Ok(Bytes::from(buf))
    }

    /// Decode a payload; failures are reported as corrupt pages from `location`.
    pub fn deserialize(&self, payload: &[u8], location: &str) -> Result<Vec<Page>> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        let corrupt = |detail: String| {
            ExecError::new(ErrorCode::CorruptPage, detail).with_location(location.to_string())
        };
        let reader = StreamReader::try_new(Cursor::new(payload), None)
            .map_err(|e| corrupt(format!("invalid page stream header: {}", e)))?;
        let mut pages = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|e| corrupt(format!("invalid page: {}", e)))?;
            let blocks = batch
                .columns()
                .iter()
                .map(|c| Block::try_new(Arc::clone(c)))
                .collect::<Result<Vec<_>>>()
                .map_err(|e| corrupt(e.message))?;
            pages.push(Page::with_position_count(blocks, batch.num_rows())?);
        }
        Ok(pages)
    }
}

fn schema_for(types: &[ColumnType]) -> SchemaRef {
    let fields = types
        .iter()
        .enumerate()
        .map(|(i, t)| Field::new(format!("c{}", i), t.to_arrow(), true))
        .collect::<Vec<_>>();
    Arc::new(Schema::new(fields))
}
