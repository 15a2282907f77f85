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
use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use novaexec::connector::ConnectorRegistry;
use novaexec::novaexec_config::{self, NovaExecConfig};
use novaexec::novaexec_logging::{self, error, info};
use novaexec::runtime::node_context::NodeContext;
use novaexec::service::http_client::HttpTransport;
use novaexec::service::http_server::start_http_server;

fn usage() {
    eprintln!("Usage: novaexec [run] [--config <path>]");
    eprintln!("  run      - Serve the task protocol in the foreground (default)");
}

/// `log_filter` wins; `debug`/`trace` only raise this crate above `info`.
fn log_filter(cfg: &NovaExecConfig) -> String {
    if let Some(filter) = &cfg.log_filter {
        return filter.clone();
    }
    match cfg.log_level.as_str() {
        "debug" => "info,novaexec=debug".to_string(),
        "trace" => "info,novaexec=trace".to_string(),
        other => other.to_string(),
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<NovaExecConfig> {
    let path = match path {
        Some(p) => PathBuf::from(p),
        None => novaexec_config::config_path_from_env_or_default()?,
    };
    NovaExecConfig::load_from_file(&path)
}

fn wait_for_interrupt() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(tokio::signal::ctrl_c())?;
    Ok(())
}

fn run(config_path: Option<&str>) -> anyhow::Result<()> {
    let cfg = load_config(config_path)?;
    novaexec_logging::init_with_level(&log_filter(&cfg));

    let transport = Arc::new(HttpTransport::new(
        cfg.runtime.exchange_compression,
        cfg.server.max_task_update_bytes,
        Duration::from_millis(cfg.runtime.task_client_timeout_ms),
    )?);
    let host = cfg.server.host.clone();
    let port = cfg.server.http_port;
    let node = NodeContext::new(cfg, ConnectorRegistry::with_builtin(), transport);
    let mut server = start_http_server(Arc::clone(&node), &host, port)?;
    info!(
        "novaexec node {} started on {}, press Ctrl-C to stop",
        node.node_id(),
        server.uri()
    );

    wait_for_interrupt()?;
    info!("interrupt received, shutting down node {}", node.node_id());
    server.begin_shutdown();
    node.shutdown();
    server.stop();
    info!("novaexec stopped");
    Ok(())
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let mut idx = 1usize;
    let mode = if args.get(idx).is_some_and(|s| !s.starts_with('-')) {
        let m = args[idx].as_str();
        idx += 1;
        m
    } else {
        "run"
    };

    let mut config_path: Option<String> = None;
    while let Some(arg) = args.get(idx) {
        match arg.as_str() {
            "--config" | "-c" => {
                idx += 1;
                config_path = args.get(idx).cloned();
                if config_path.is_none() {
                    eprintln!("missing value for --config/-c");
                    process::exit(1);
                }
                idx += 1;
            }
            "--help" | "-h" => {
                usage();
                process::exit(0);
            }
            other => {
                eprintln!("unknown arg: {other} (try --help)");
                process::exit(1);
            }
        }
    }

    match mode {
        "run" => {
            if let Err(err) = run(config_path.as_deref()) {
                error!("novaexec failed: {:#}", err);
                eprintln!("novaexec failed: {err:#}");
                process::exit(1);
            }
        }
        other => {
            eprintln!("unknown mode: {other}");
            usage();
            process::exit(1);
        }
    }
}
