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

//! Point-in-time views of the throttle state.

use serde::Serialize;
use serde_with::{DurationSecondsWithFrac, serde_as};
use std::time::Duration;

/// The observable state of a throttle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleState {
    /// Admitting normally.
    Running,
    /// Decelerated, waiting for a zero-failure cooling period.
    Cooling,
    /// The circuit breaker is open; admissions fail fast.
    CircuitOpen,
    /// Closed with no work in flight.
    Closed,
    /// Closed while operations are still draining.
    Draining,
}

/// An immutable view of the throttle assembled at a single instant.
///
/// Snapshots taken at the same instant of the same throttle compare equal.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ThrottleSnapshot {
    /// The current concurrency limit.
    pub concurrency: usize,
    /// The configured concurrency ceiling.
    pub max_concurrency: usize,
    /// The current minimum spacing between dispatches.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub dispatch_interval: Duration,
    pub completed_tasks: u64,
    pub total_tasks: u64,
    /// Failures currently inside the sliding window.
    pub failure_count: usize,
    pub state: ThrottleState,
    /// The limit recovery may not exceed until failures stay away.
    pub safe_ceiling: usize,
    /// Estimated seconds to completion; `None` without a task total or any
    /// completion history.
    pub eta_seconds: Option<f64>,
    /// Tokens used inside the budget window; zero without a budget.
    pub tokens_used: u64,
    /// Tokens left in the budget window; `None` without a budget.
    pub tokens_remaining: Option<u64>,
}

/// Receives a [ThrottleSnapshot] when a progress milestone is crossed.
///
/// Implementations of this trait must also implement
/// [Debug][std::fmt::Debug] because the application may need to log the
/// throttle state. The trait is called from async tasks, so its
/// implementations must be `Send` and `Sync`.
pub trait ProgressSink: Send + Sync + std::fmt::Debug {
    fn on_progress(&self, snapshot: &ThrottleSnapshot);
}
