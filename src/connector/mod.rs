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
//! Connector boundary: turns splits into page streams.
//!
//! Responsibilities:
//! - Defines the page source contract scan operators consume.
//! - Maps catalog names to page source providers; each node owns its own registry.
//!
//! Key exported interfaces:
//! - Types: `ConnectorRegistry`.
//! - Traits: `PageSource`, `PageSourceProvider`.

pub mod sequence;
pub mod values;

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::status::{ErrorCode, ExecError, Result};
use crate::exec::page::{ColumnType, Page};
use crate::runtime::runtime_state::ExecOptions;
use crate::scheduler::split::Split;

/// Stream of pages produced for one split.
pub trait PageSource: Send {
    /// `Ok(None)` means no page is available right now; check `is_finished` to tell the end.
    fn next_page(&mut self) -> Result<Option<Page>>;

    fn is_finished(&self) -> bool;

    fn completed_bytes(&self) -> u64 {
        0
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub trait PageSourceProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_page_source(
        &self,
        split: &Split,
        output_types: &[ColumnType],
        options: &ExecOptions,
    ) -> Result<Box<dyn PageSource>>;
}

#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    providers: HashMap<String, Arc<dyn PageSourceProvider>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `sequence` and `values` connectors.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(sequence::SequenceConnector));
        registry.register(Arc::new(values::ValuesConnector));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn PageSourceProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, catalog: &str) -> Result<Arc<dyn PageSourceProvider>> {
        self.providers.get(catalog).cloned().ok_or_else(|| {
            ExecError::new(
                ErrorCode::ConnectorError,
                format!("no connector registered for catalog {}", catalog),
            )
        })
    }

    pub fn catalogs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

fn connector_error(catalog: &str, message: impl std::fmt::Display) -> ExecError {
    ExecError::new(ErrorCode::ConnectorError, format!("{}: {}", catalog, message))
}
