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
//! axum server for the worker task protocol.
//!
//! Responsibilities:
//! - Serves task create/update, status long-poll, info and cancel endpoints over a node's
//!   `TaskManager`.
//! - Serves token-based page reads, acknowledgements and buffer deletion for consumers.
//! - Reports node state for discovery and operators.
//!
//! Key exported interfaces:
//! - Functions: `router`, `start_http_server`.
//! - Types: `HttpServerHandle`.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::common::ids::TaskId;
use crate::common::status::{ExecError, Result};
use crate::exec::page::PagesSerde;
use crate::novaexec_logging::{error, info};
use crate::runtime::node_context::NodeContext;
use crate::runtime::task_state::TaskState;
use crate::service::protocol::{self, ErrorResponse, NodeStatus};

#[derive(Clone)]
struct AppState {
    node: Arc<NodeContext>,
    serde: PagesSerde,
    shutting_down: Arc<AtomicBool>,
}

struct ApiError(ExecError);

impl From<ExecError> for ApiError {
    fn from(err: ExecError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(protocol::http_status(self.0.code()))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorResponse::from(&self.0))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn parse_task_id(raw: &str) -> Result<TaskId> {
    TaskId::from_str(raw).map_err(ExecError::invalid_plan)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_duration(headers: &HeaderMap, name: &str) -> Option<Duration> {
    header_str(headers, name).and_then(protocol::parse_duration)
}

pub fn router(node: Arc<NodeContext>, shutting_down: Arc<AtomicBool>) -> Router {
    let serde = PagesSerde::new(node.config().runtime.exchange_compression);
    let state = AppState {
        node,
        serde,
        shutting_down,
    };
    Router::new()
        .route("/v1/task/{task_id}", get(task_info).post(update_task).delete(delete_task))
        .route("/v1/task/{task_id}/status", get(task_status))
        .route("/v1/task/{task_id}/results/{buffer_id}/{token}", get(get_results))
        .route(
            "/v1/task/{task_id}/results/{buffer_id}/{token}/acknowledge",
            get(acknowledge_results),
        )
        .route(
            "/v1/task/{task_id}/results/{buffer_id}",
            axum::routing::delete(destroy_results),
        )
        .route("/v1/info/state", get(node_state))
        .with_state(state)
}

async fn update_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let task_id = parse_task_id(&task_id)?;
    let max_bytes = state.node.config().server.max_task_update_bytes;
    let request = protocol::decode_task_update(&body, max_bytes)?;
    let status = tokio::task::block_in_place(|| {
        state.node.task_manager().update_task(&task_id, &request)
    })?;
    Ok(Json(status))
}

async fn task_info(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task_id = parse_task_id(&task_id)?;
    Ok(Json(state.node.task_manager().get_task_info(&task_id)?))
}

async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let task_id = parse_task_id(&task_id)?;
    let current = header_str(&headers, protocol::CURRENT_STATE).and_then(TaskState::parse);
    let max_wait = header_duration(&headers, protocol::MAX_WAIT)
        .unwrap_or_else(|| state.node.task_manager().status_max_wait());
    let status = tokio::task::block_in_place(|| {
        state
            .node
            .task_manager()
            .get_task_status(&task_id, current, max_wait)
    })?;
    Ok(Json(status))
}

#[derive(Deserialize)]
struct DeleteTaskParams {
    abort: Option<bool>,
}

async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(params): Query<DeleteTaskParams>,
) -> ApiResult<impl IntoResponse> {
    let task_id = parse_task_id(&task_id)?;
    let abort = params.abort.unwrap_or(true);
    let status = tokio::task::block_in_place(|| {
        state.node.task_manager().cancel_task(&task_id, abort)
    });
    Ok(Json(status))
}

async fn get_results(
    State(state): State<AppState>,
    Path((task_id, buffer_id, token)): Path<(String, u32, u64)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let task_id = parse_task_id(&task_id)?;
    let runtime = &state.node.config().runtime;
    let max_bytes = header_str(&headers, protocol::MAX_SIZE)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(runtime.exchange_max_response_bytes as u64);
    let max_wait = header_duration(&headers, protocol::MAX_WAIT)
        .unwrap_or_else(|| runtime.exchange_max_wait());
    let result = tokio::task::block_in_place(|| {
        state
            .node
            .task_manager()
            .get_results(&task_id, buffer_id, token, max_bytes, max_wait)
    })?;
    let body = state.serde.serialize(&result.pages)?;
    let mut response = Response::new(Body::from(body));
    let out = response.headers_mut();
    out.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(protocol::PAGES_CONTENT_TYPE),
    );
    out.insert(protocol::PAGE_TOKEN, HeaderValue::from(result.token));
    out.insert(protocol::PAGE_NEXT_TOKEN, HeaderValue::from(result.next_token));
    out.insert(
        protocol::BUFFER_COMPLETE,
        HeaderValue::from_static(if result.buffer_complete { "true" } else { "false" }),
    );
    if let Ok(instance) = HeaderValue::from_str(&result.task_instance_id) {
        out.insert(protocol::TASK_INSTANCE_ID, instance);
    }
    Ok(response)
}

async fn acknowledge_results(
    State(state): State<AppState>,
    Path((task_id, buffer_id, token)): Path<(String, u32, u64)>,
) -> ApiResult<StatusCode> {
    let task_id = parse_task_id(&task_id)?;
    state
        .node
        .task_manager()
        .acknowledge_results(&task_id, buffer_id, token)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn destroy_results(
    State(state): State<AppState>,
    Path((task_id, buffer_id)): Path<(String, u32)>,
) -> ApiResult<StatusCode> {
    let task_id = parse_task_id(&task_id)?;
    state
        .node
        .task_manager()
        .destroy_results(&task_id, buffer_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn node_state(State(state): State<AppState>) -> Json<NodeStatus> {
    let node = &state.node;
    let server = &node.config().server;
    Json(NodeStatus {
        node_id: node.node_id().to_string(),
        environment: server.environment.clone(),
        coordinator: server.coordinator,
        state: if state.shutting_down.load(Ordering::Acquire) {
            "shutting_down".to_string()
        } else {
            "active".to_string()
        },
        catalogs: node.connectors().catalogs(),
        task_count: node.task_manager().task_ids().len(),
        memory_max_bytes: node.memory_pool().max_bytes(),
        memory_reserved_bytes: node.memory_pool().reserved_bytes(),
    })
}

/// Running server; dropping the handle stops it.
pub struct HttpServerHandle {
    addr: SocketAddr,
    shutting_down: Arc<AtomicBool>,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl HttpServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn uri(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Report `shutting_down` on `/v1/info/state` while in-flight requests finish.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn stop(&mut self) {
        self.begin_shutdown();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HttpServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind `host:port` (port 0 picks a free one) and serve on a dedicated runtime thread.
pub fn start_http_server(node: Arc<NodeContext>, host: &str, port: u16) -> Result<HttpServerHandle> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| ExecError::internal(format!("parse http bind addr {host}:{port}: {e}")))?;
    let listener = std::net::TcpListener::bind(addr)
        .map_err(|e| ExecError::internal(format!("failed to bind http listener on {addr}: {e}")))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| ExecError::internal(format!("configure http listener: {e}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| ExecError::internal(format!("read http listener address: {e}")))?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(node.config().runtime.io_threads.clamp(2, 16))
        .thread_name("http_server")
        .build()
        .map_err(|e| ExecError::internal(format!("build http server runtime: {e}")))?;

    let shutting_down = Arc::new(AtomicBool::new(false));
    let app = router(Arc::clone(&node), Arc::clone(&shutting_down));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let node_id = node.node_id().clone();
    let thread = thread::Builder::new()
        .name("http_server_main".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::from_std(listener) {
                    Ok(listener) => listener,
                    Err(e) => {
                        error!("http server on {} failed to start: {}", local_addr, e);
                        return;
                    }
                };
                info!("node {} serving task protocol on {}", node_id, local_addr);
                let served = axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = stop_rx.await;
                    })
                    .await;
                if let Err(e) = served {
                    error!("http server on {} stopped: {}", local_addr, e);
                }
            });
        })
        .map_err(|e| ExecError::internal(format!("spawn http server thread: {e}")))?;
    Ok(HttpServerHandle {
        addr: local_addr,
        shutting_down,
        stop: Some(stop_tx),
        thread: Some(thread),
    })
}
