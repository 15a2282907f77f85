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
//! Bounded exponential backoff for remote calls.
//!
//! The delay doubles per consecutive failure between `min_delay` and `max_delay`. A caller
//! gives up once failures have persisted for `max_error_duration` and at least `MIN_TRIES`
//! attempts failed; any success resets the window.

use std::time::{Duration, Instant};

const MIN_TRIES: u32 = 3;

#[derive(Debug)]
pub struct Backoff {
    min_delay: Duration,
    max_delay: Duration,
    max_error_duration: Duration,
    failure_count: u32,
    first_failure: Option<Instant>,
}

impl Backoff {
    pub fn new(min_delay: Duration, max_delay: Duration, max_error_duration: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            max_error_duration,
            failure_count: 0,
            first_failure: None,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn failure_duration(&self) -> Duration {
        self.first_failure
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub fn max_error_duration(&self) -> Duration {
        self.max_error_duration
    }

    /// Record a failure; returns true when the caller should give up.
    pub fn failure(&mut self) -> bool {
        self.first_failure.get_or_insert_with(Instant::now);
        self.failure_count = self.failure_count.saturating_add(1);
        self.is_exhausted()
    }

    /// True once the recorded failures have outlasted the error window.
    pub fn is_exhausted(&self) -> bool {
        self.failure_count >= MIN_TRIES && self.failure_duration() >= self.max_error_duration
    }

    pub fn success(&mut self) {
        self.failure_count = 0;
        self.first_failure = None;
    }

    /// Wait before the next attempt; zero until the first failure.
    pub fn delay(&self) -> Duration {
        if self.failure_count == 0 {
            return Duration::ZERO;
        }
        let shift = (self.failure_count - 1).min(20);
        self.min_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn delay_grows_and_is_capped() {
        let mut backoff = Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::from_secs(60),
        );
        assert_eq!(backoff.delay(), Duration::ZERO);
        backoff.failure();
        assert_eq!(backoff.delay(), Duration::from_millis(10));
        backoff.failure();
        assert_eq!(backoff.delay(), Duration::from_millis(20));
        backoff.failure();
        backoff.failure();
        assert_eq!(backoff.delay(), Duration::from_millis(50));
        backoff.success();
        assert_eq!(backoff.delay(), Duration::ZERO);
        assert_eq!(backoff.failure_count(), 0);
    }

    #[test]
    fn gives_up_after_max_error_duration_and_min_tries() {
        let mut backoff = Backoff::new(
            Duration::from_millis(1),
            Duration::from_millis(1),
            Duration::from_millis(20),
        );
        assert!(!backoff.failure());
        thread::sleep(Duration::from_millis(30));
        // duration elapsed but not enough attempts yet
        assert!(!backoff.failure());
        assert!(!backoff.is_exhausted());
        assert!(backoff.failure());
        assert!(backoff.is_exhausted());
        backoff.success();
        assert!(!backoff.is_exhausted());
    }
}
