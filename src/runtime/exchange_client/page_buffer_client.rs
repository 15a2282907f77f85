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
//! Client for one remote output buffer.
//!
//! Issues token-based reads against a single producer location, acknowledges what it
//! received, and once the producer reports the buffer complete, deletes the remote buffer.
//! Transient failures are retried with bounded exponential backoff; failures persisting
//! beyond the max error duration fail the client with `PageTransportTimeout`.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ExchangeTransport;
use super::backoff::Backoff;
use crate::common::status::{ErrorCode, ExecError};
use crate::exec::page::Page;
use crate::novaexec_logging::{debug, warn};
use crate::runtime::io::IoTaskContext;
use crate::scheduler::split::TaskLocation;

const SLEEP_STEP: Duration = Duration::from_millis(5);

/// Result of one request round.
pub(crate) enum RequestOutcome {
    Pages { pages: Vec<Page>, bytes: u64 },
    /// Pages were all received and the remote buffer is deleted.
    Finished,
    Retry,
    Failed(ExecError),
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageBufferClientStatus {
    pub location: String,
    pub state: String,
    pub token: u64,
    pub pages_received: u64,
    pub rows_received: u64,
    pub requests: u64,
    pub failures: u64,
}

struct State {
    token: u64,
    task_instance_id: Option<String>,
    /// The producer reported `buffer_complete`; only the delete remains.
    complete: bool,
    finished: bool,
    running: bool,
    closed: bool,
    backoff: Backoff,
    pages_received: u64,
    rows_received: u64,
    requests: u64,
    failures: u64,
}

pub(crate) struct PageBufferClient {
    location: TaskLocation,
    max_response_bytes: u64,
    max_wait: Duration,
    state: Mutex<State>,
}

impl PageBufferClient {
    pub(crate) fn new(
        location: TaskLocation,
        backoff: Backoff,
        max_response_bytes: u64,
        max_wait: Duration,
    ) -> Self {
        Self {
            location,
            max_response_bytes: max_response_bytes.max(1),
            max_wait,
            state: Mutex::new(State {
                token: 0,
                task_instance_id: None,
                complete: false,
                finished: false,
                running: false,
                closed: false,
                backoff,
                pages_received: 0,
                rows_received: 0,
                requests: 0,
                failures: 0,
            }),
        }
    }

    pub(crate) fn location(&self) -> &TaskLocation {
        &self.location
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.lock().expect("page buffer client lock").finished
    }

    /// Claim the right to run the next request; false when one is in flight or none is needed.
    pub(crate) fn try_start_request(&self) -> bool {
        let mut state = self.state.lock().expect("page buffer client lock");
        if state.running || state.finished || state.closed {
            return false;
        }
        state.running = true;
        true
    }

    pub(crate) fn request_done(&self) {
        self.state.lock().expect("page buffer client lock").running = false;
    }

    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.lock().expect("page buffer client lock");
        let was_open = !state.closed && !state.finished;
        state.closed = true;
        was_open
    }

    /// One request round: wait out the backoff delay, then read or delete.
    pub(crate) fn process(&self, transport: &dyn ExchangeTransport, ctx: &IoTaskContext) -> RequestOutcome {
        let (token, complete, delay) = {
            let mut state = self.state.lock().expect("page buffer client lock");
            if state.closed {
                return RequestOutcome::Closed;
            }
            state.requests += 1;
            (state.token, state.complete, state.backoff.delay())
        };
        if !self.sleep(delay, ctx) {
            return RequestOutcome::Closed;
        }
        if complete {
            return match transport.abort_results(&self.location) {
                Ok(()) => {
                    let mut state = self.state.lock().expect("page buffer client lock");
                    state.backoff.success();
                    state.finished = true;
                    debug!(
                        "exchange source {} finished: pages={} rows={}",
                        self.location, state.pages_received, state.rows_received
                    );
                    RequestOutcome::Finished
                }
                Err(err) => self.handle_failure(err),
            };
        }
        match transport.get_results(&self.location, token, self.max_response_bytes, self.max_wait) {
            Ok(result) => {
                let mut state = self.state.lock().expect("page buffer client lock");
                state.backoff.success();
                if state.closed {
                    return RequestOutcome::Closed;
                }
                match state.task_instance_id.as_ref() {
                    None => state.task_instance_id = Some(result.task_instance_id.clone()),
                    Some(known) if known != &result.task_instance_id => {
                        return RequestOutcome::Failed(
                            ExecError::new(
                                ErrorCode::RemoteTaskError,
                                format!(
                                    "task instance changed from {} to {}",
                                    known, result.task_instance_id
                                ),
                            )
                            .with_location(self.location.to_string()),
                        );
                    }
                    Some(_) => {}
                }
                if result.token != token {
                    return RequestOutcome::Failed(
                        ExecError::invariant(format!(
                            "expected token {} but producer answered {}",
                            token, result.token
                        ))
                        .with_location(self.location.to_string()),
                    );
                }
                let next_token = result.next_token;
                let received = !result.pages.is_empty();
                state.token = next_token;
                state.pages_received += result.pages.len() as u64;
                state.rows_received += result
                    .pages
                    .iter()
                    .map(|p| p.position_count() as u64)
                    .sum::<u64>();
                if result.buffer_complete {
                    state.complete = true;
                }
                drop(state);
                if received
                    && let Err(err) = transport.acknowledge_results(&self.location, next_token)
                {
                    // the next read acknowledges implicitly
                    debug!("acknowledge {} token {} failed: {}", self.location, next_token, err);
                }
                let bytes = result
                    .pages
                    .iter()
                    .map(|p| p.retained_size_in_bytes() as u64)
                    .sum();
                RequestOutcome::Pages {
                    pages: result.pages,
                    bytes,
                }
            }
            Err(err) => self.handle_failure(err),
        }
    }

    fn handle_failure(&self, err: ExecError) -> RequestOutcome {
        let mut state = self.state.lock().expect("page buffer client lock");
        state.failures += 1;
        if !err.is_retryable() {
            return RequestOutcome::Failed(err.with_location(self.location.to_string()));
        }
        if state.backoff.failure() {
            let failed_for = state.backoff.failure_duration();
            warn!(
                "exchange source {} giving up after {} failures over {:?}: {}",
                self.location,
                state.backoff.failure_count(),
                failed_for,
                err
            );
            return RequestOutcome::Failed(
                ExecError::new(
                    ErrorCode::PageTransportTimeout,
                    format!(
                        "encountered too many errors talking to a worker node over {:?} (max {:?}): {}",
                        failed_for,
                        state.backoff.max_error_duration(),
                        err.message
                    ),
                )
                .with_location(self.location.to_string()),
            );
        }
        debug!(
            "exchange source {} request failed, retrying in {:?}: {}",
            self.location,
            state.backoff.delay(),
            err
        );
        RequestOutcome::Retry
    }

    fn sleep(&self, delay: Duration, ctx: &IoTaskContext) -> bool {
        let mut remaining = delay;
        while !remaining.is_zero() {
            if ctx.is_cancelled() || self.state.lock().expect("page buffer client lock").closed {
                return false;
            }
            let step = remaining.min(SLEEP_STEP);
            std::thread::sleep(step);
            remaining -= step;
        }
        true
    }

    pub(crate) fn status(&self) -> PageBufferClientStatus {
        let state = self.state.lock().expect("page buffer client lock");
        let label = if state.finished {
            "finished"
        } else if state.closed {
            "closed"
        } else if state.running {
            "running"
        } else if state.complete {
            "deleting"
        } else {
            "queued"
        };
        PageBufferClientStatus {
            location: self.location.to_string(),
            state: label.to_string(),
            token: state.token,
            pages_received: state.pages_received,
            rows_received: state.rows_received,
            requests: state.requests,
            failures: state.failures,
        }
    }
}
