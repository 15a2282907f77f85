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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolve the config path from `$NOVAEXEC_CONFIG` or `./novaexec.toml`.
pub fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("NOVAEXEC_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("novaexec.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $NOVAEXEC_CONFIG or create ./novaexec.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct NovaExecConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "novaexec=debug,hyper=off,reqwest=off"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

impl NovaExecConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        Self::from_toml_str(&s).with_context(|| format!("parse toml: {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: NovaExecConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn log_filter_or_level(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(&self.log_level)
    }

    fn validate(&self) -> Result<()> {
        if self.runtime.driver_time_slice_ms == 0 {
            return Err(anyhow!("runtime.driver_time_slice_ms must be positive"));
        }
        if self.runtime.exchange_max_error_duration_ms < self.runtime.exchange_min_backoff_ms {
            return Err(anyhow!(
                "runtime.exchange_max_error_duration_ms must not be below exchange_min_backoff_ms"
            ));
        }
        if self.memory.max_query_memory_per_node_bytes > self.memory.max_node_memory_bytes {
            return Err(anyhow!(
                "memory.max_query_memory_per_node_bytes exceeds memory.max_node_memory_bytes"
            ));
        }
        Ok(())
    }
}

impl Default for NovaExecConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            server: ServerConfig::default(),
            runtime: RuntimeConfig::default(),
            memory: MemoryConfig::default(),
            scheduler: SchedulerConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub coordinator: bool,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_max_task_update_bytes")]
    pub max_task_update_bytes: usize,
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_node_id() -> String {
    "node-0".to_string()
}
fn default_environment() -> String {
    "default".to_string()
}
fn default_max_task_update_bytes() -> usize {
    16 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            http_port: default_http_port(),
            node_id: default_node_id(),
            coordinator: false,
            environment: default_environment(),
            max_task_update_bytes: default_max_task_update_bytes(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeConfig {
    /// 0 means one thread per available core.
    #[serde(default)]
    pub exec_threads: usize,
    #[serde(default = "default_driver_time_slice_ms")]
    pub driver_time_slice_ms: u64,
    #[serde(default = "default_blocked_poll_interval_ms")]
    pub blocked_poll_interval_ms: u64,
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,
    #[serde(default = "default_task_concurrency")]
    pub task_concurrency: usize,
    #[serde(default = "default_page_target_bytes")]
    pub page_target_bytes: usize,
    #[serde(default = "default_page_target_rows")]
    pub page_target_rows: usize,
    #[serde(default = "default_local_exchange_buffer_mem_limit_per_driver")]
    pub local_exchange_buffer_mem_limit_per_driver: usize,
    #[serde(default = "default_output_buffer_max_bytes")]
    pub output_buffer_max_bytes: usize,
    #[serde(default = "default_exchange_max_buffered_bytes")]
    pub exchange_max_buffered_bytes: usize,
    #[serde(default = "default_exchange_max_response_bytes")]
    pub exchange_max_response_bytes: usize,
    #[serde(default = "default_exchange_max_wait_ms")]
    pub exchange_max_wait_ms: u64,
    #[serde(default = "default_exchange_min_backoff_ms")]
    pub exchange_min_backoff_ms: u64,
    #[serde(default = "default_exchange_max_backoff_ms")]
    pub exchange_max_backoff_ms: u64,
    #[serde(default = "default_exchange_max_error_duration_ms")]
    pub exchange_max_error_duration_ms: u64,
    #[serde(default = "default_exchange_compression")]
    pub exchange_compression: bool,
    #[serde(default = "default_task_status_max_wait_ms")]
    pub task_status_max_wait_ms: u64,
    #[serde(default = "default_task_client_timeout_ms")]
    pub task_client_timeout_ms: u64,
    #[serde(default = "default_task_info_max_age_ms")]
    pub task_info_max_age_ms: u64,
}

fn default_driver_time_slice_ms() -> u64 {
    1000
}
fn default_blocked_poll_interval_ms() -> u64 {
    10
}
fn default_io_threads() -> usize {
    16
}
fn default_task_concurrency() -> usize {
    4
}
fn default_page_target_bytes() -> usize {
    1024 * 1024
}
fn default_page_target_rows() -> usize {
    4096
}
fn default_local_exchange_buffer_mem_limit_per_driver() -> usize {
    8 * 1024 * 1024
}
fn default_output_buffer_max_bytes() -> usize {
    32 * 1024 * 1024
}
fn default_exchange_max_buffered_bytes() -> usize {
    32 * 1024 * 1024
}
fn default_exchange_max_response_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_exchange_max_wait_ms() -> u64 {
    200
}
fn default_exchange_min_backoff_ms() -> u64 {
    10
}
fn default_exchange_max_backoff_ms() -> u64 {
    1000
}
fn default_exchange_max_error_duration_ms() -> u64 {
    60_000
}
fn default_exchange_compression() -> bool {
    true
}
fn default_task_status_max_wait_ms() -> u64 {
    1000
}
fn default_task_client_timeout_ms() -> u64 {
    120_000
}
fn default_task_info_max_age_ms() -> u64 {
    15 * 60 * 1000
}

impl RuntimeConfig {
    pub fn actual_exec_threads(&self) -> usize {
        if self.exec_threads > 0 {
            return self.exec_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn driver_time_slice(&self) -> Duration {
        Duration::from_millis(self.driver_time_slice_ms)
    }

    pub fn blocked_poll_interval(&self) -> Duration {
        Duration::from_millis(self.blocked_poll_interval_ms.max(1))
    }

    pub fn exchange_max_wait(&self) -> Duration {
        Duration::from_millis(self.exchange_max_wait_ms)
    }

    pub fn exchange_max_error_duration(&self) -> Duration {
        Duration::from_millis(self.exchange_max_error_duration_ms)
    }

    pub fn task_status_max_wait(&self) -> Duration {
        Duration::from_millis(self.task_status_max_wait_ms)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            exec_threads: 0,
            driver_time_slice_ms: default_driver_time_slice_ms(),
            blocked_poll_interval_ms: default_blocked_poll_interval_ms(),
            io_threads: default_io_threads(),
            task_concurrency: default_task_concurrency(),
            page_target_bytes: default_page_target_bytes(),
            page_target_rows: default_page_target_rows(),
            local_exchange_buffer_mem_limit_per_driver:
                default_local_exchange_buffer_mem_limit_per_driver(),
            output_buffer_max_bytes: default_output_buffer_max_bytes(),
            exchange_max_buffered_bytes: default_exchange_max_buffered_bytes(),
            exchange_max_response_bytes: default_exchange_max_response_bytes(),
            exchange_max_wait_ms: default_exchange_max_wait_ms(),
            exchange_min_backoff_ms: default_exchange_min_backoff_ms(),
            exchange_max_backoff_ms: default_exchange_max_backoff_ms(),
            exchange_max_error_duration_ms: default_exchange_max_error_duration_ms(),
            exchange_compression: default_exchange_compression(),
            task_status_max_wait_ms: default_task_status_max_wait_ms(),
            task_client_timeout_ms: default_task_client_timeout_ms(),
            task_info_max_age_ms: default_task_info_max_age_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_max_node_memory_bytes")]
    pub max_node_memory_bytes: i64,
    #[serde(default = "default_max_query_memory_per_node_bytes")]
    pub max_query_memory_per_node_bytes: i64,
}

fn default_max_node_memory_bytes() -> i64 {
    4 * 1024 * 1024 * 1024
}
fn default_max_query_memory_per_node_bytes() -> i64 {
    1024 * 1024 * 1024
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_node_memory_bytes: default_max_node_memory_bytes(),
            max_query_memory_per_node_bytes: default_max_query_memory_per_node_bytes(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_split_batch_size")]
    pub split_batch_size: usize,
    #[serde(default = "default_max_splits_per_node")]
    pub max_splits_per_node: usize,
    #[serde(default = "default_max_pending_splits_per_task")]
    pub max_pending_splits_per_task: usize,
    #[serde(default = "default_max_outstanding_split_bytes")]
    pub max_outstanding_split_bytes: u64,
    #[serde(default = "default_max_tasks_per_stage")]
    pub max_tasks_per_stage: usize,
    #[serde(default = "default_node_refresh_interval_ms")]
    pub node_refresh_interval_ms: u64,
    #[serde(default = "default_node_staleness_ms")]
    pub node_staleness_ms: u64,
    #[serde(default = "default_scheduler_wait_ms")]
    pub scheduler_wait_ms: u64,
}

fn default_split_batch_size() -> usize {
    1000
}
fn default_max_splits_per_node() -> usize {
    100
}
fn default_max_pending_splits_per_task() -> usize {
    10
}
fn default_max_outstanding_split_bytes() -> u64 {
    32 * 1024 * 1024
}
fn default_max_tasks_per_stage() -> usize {
    usize::MAX
}
fn default_node_refresh_interval_ms() -> u64 {
    5000
}
fn default_node_staleness_ms() -> u64 {
    10_000
}
fn default_scheduler_wait_ms() -> u64 {
    100
}

impl SchedulerConfig {
    pub fn node_staleness(&self) -> Duration {
        Duration::from_millis(self.node_staleness_ms)
    }

    pub fn scheduler_wait(&self) -> Duration {
        Duration::from_millis(self.scheduler_wait_ms.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            split_batch_size: default_split_batch_size(),
            max_splits_per_node: default_max_splits_per_node(),
            max_pending_splits_per_task: default_max_pending_splits_per_task(),
            max_outstanding_split_bytes: default_max_outstanding_split_bytes(),
            max_tasks_per_stage: default_max_tasks_per_stage(),
            node_refresh_interval_ms: default_node_refresh_interval_ms(),
            node_staleness_ms: default_node_staleness_ms(),
            scheduler_wait_ms: default_scheduler_wait_ms(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub nodes: Vec<StaticNodeConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StaticNodeConfig {
    pub node_id: String,
    pub uri: String,
    #[serde(default)]
    pub coordinator: bool,
    #[serde(default)]
    pub connectors: Vec<String>,
    #[serde(default = "default_node_state")]
    pub state: String,
}

fn default_node_state() -> String {
    "active".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let cfg = NovaExecConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.runtime.driver_time_slice_ms, 1000);
        assert_eq!(cfg.runtime.task_concurrency, 4);
        assert!(cfg.discovery.nodes.is_empty());
    }

    #[test]
    fn parses_sections_and_static_nodes() {
        let cfg = NovaExecConfig::from_toml_str(
            r#"
log_filter = "novaexec=debug"

[server]
node_id = "worker-1"
http_port = 9001

[runtime]
exec_threads = 2
exchange_max_error_duration_ms = 500

[discovery]
nodes = [
  { node_id = "worker-1", uri = "http://127.0.0.1:9001", connectors = ["sequence"] },
  { node_id = "coord", uri = "http://127.0.0.1:9000", coordinator = true },
]
"#,
        )
        .unwrap();
        assert_eq!(cfg.log_filter_or_level(), "novaexec=debug");
        assert_eq!(cfg.server.node_id, "worker-1");
        assert_eq!(cfg.runtime.actual_exec_threads(), 2);
        assert_eq!(cfg.discovery.nodes.len(), 2);
        assert!(cfg.discovery.nodes[1].coordinator);
        assert_eq!(cfg.discovery.nodes[0].state, "active");
    }

    #[test]
    fn rejects_zero_time_slice() {
        let err = NovaExecConfig::from_toml_str("[runtime]\ndriver_time_slice_ms = 0\n");
        assert!(err.is_err());
    }
}
