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
//! Plan-time operator configuration.

use super::operator::Operator;

/// Built by `LocalExecutionPlanner` once per pipeline position; creates the operator of every
/// driver. Shared state between the drivers of a pipeline (local exchanges, aggregation
/// memory contexts) lives in the factory.
pub trait OperatorFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Operator of driver `driver_index` out of `dop` drivers.
    fn create(&self, dop: usize, driver_index: usize) -> Box<dyn Operator>;

    /// Sources start a driver chain and never receive pages.
    fn is_source(&self) -> bool {
        false
    }

    /// Sinks end a driver chain and never emit pages.
    fn is_sink(&self) -> bool {
        false
    }
}
