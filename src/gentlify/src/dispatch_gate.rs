// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Minimum spacing between dispatches, with additive jitter.
//!
//! The gate computes how long a dispatch must wait; the orchestrator samples
//! the jitter and performs the sleep, then records the dispatch. Concurrent
//! waiters each observe `last_dispatch` when they compute their delay and
//! advance it when their sleep completes; bursts within the jitter width are
//! acceptable and absorbed by the jitter itself.

use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub(crate) struct DispatchGate {
    interval: Duration,
    jitter_fraction: f64,
    last_dispatch: Option<Instant>,
}

impl DispatchGate {
    pub fn new(interval: Duration, jitter_fraction: f64) -> Self {
        Self {
            interval,
            jitter_fraction,
            last_dispatch: None,
        }
    }

    /// The current minimum spacing between dispatches.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The upper bound for the jitter added to the next dispatch, in seconds.
    pub fn jitter_ceiling(&self) -> f64 {
        self.interval.as_secs_f64() * self.jitter_fraction
    }

    /// How long a dispatch starting at `now` must sleep.
    ///
    /// `jitter` is a uniform sample from `[0, jitter_ceiling()]`, drawn by
    /// the caller from its random source.
    pub fn sleep_before_dispatch(&self, now: Instant, jitter: Duration) -> Duration {
        let spacing = match self.last_dispatch {
            None => Duration::ZERO,
            Some(last) => self.interval.saturating_sub(now.saturating_duration_since(last)),
        };
        spacing + jitter
    }

    /// Advances `last_dispatch`. Called after the sleep resolves.
    pub fn record_dispatch(&mut self, now: Instant) {
        self.last_dispatch = Some(now);
    }

    /// Doubles the interval, capped at `max_interval`.
    pub fn decelerate(&mut self, max_interval: Duration) {
        self.interval = std::cmp::min(self.interval.saturating_mul(2), max_interval);
    }

    /// Halves the interval, floored at `min_interval`.
    pub fn reaccelerate(&mut self, min_interval: Duration) {
        self.interval = std::cmp::max(self.interval / 2, min_interval);
    }
}
