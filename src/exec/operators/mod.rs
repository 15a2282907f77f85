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
//! Execution operator module exports.
//!
//! Responsibilities:
//! - Registers the operator factories the local execution planner instantiates per plan node.
//! - Provides a stable import surface for operator construction across execution modules.

mod exchange_source;
mod filter_processor;
mod hash_aggregate;
mod local_exchange_sink;
mod local_exchange_source;
pub(crate) mod local_exchanger;
mod partitioned_output_sink;
mod project_processor;
mod table_scan_source;
mod values_source;

pub use exchange_source::ExchangeSourceFactory;
pub use filter_processor::FilterProcessorFactory;
pub use hash_aggregate::HashAggregateFactory;
pub use local_exchange_sink::LocalExchangeSinkFactory;
pub use local_exchange_source::LocalExchangeSourceFactory;
pub use local_exchanger::{LocalExchangeStats, LocalExchanger};
pub use partitioned_output_sink::PartitionedOutputSinkFactory;
pub use project_processor::ProjectProcessorFactory;
pub use table_scan_source::TableScanSourceFactory;
pub use values_source::ValuesSourceFactory;
