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

//! State-change notifications emitted by the throttle.

use crate::snapshot::ThrottleSnapshot;
use std::time::Duration;

/// A state change in the throttle.
///
/// Events are delivered synchronously to the configured [EventSink] as the
/// transition happens; sinks should hand the event off rather than block.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ThrottleEvent {
    /// The failure window filled up: concurrency halved, dispatch interval
    /// doubled.
    Decelerated {
        old_concurrency: usize,
        new_concurrency: usize,
        old_interval: Duration,
        new_interval: Duration,
        failure_count: usize,
    },
    /// A cooling period completed: concurrency raised by one, dispatch
    /// interval halved.
    Reaccelerated {
        old_concurrency: usize,
        new_concurrency: usize,
        old_interval: Duration,
        new_interval: Duration,
    },
    /// A deceleration put the throttle into its cooling state.
    CoolingStarted { cooling_period: Duration },
    /// The circuit breaker tripped open.
    CircuitOpened {
        consecutive_failures: u32,
        retry_after: Duration,
    },
    /// The circuit breaker recovered.
    CircuitClosed,
    /// A failed attempt will be retried after the given delay.
    Retry {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// A completion crossed a progress milestone.
    Progress(ThrottleSnapshot),
}

impl ThrottleEvent {
    /// A short name for the event, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            ThrottleEvent::Decelerated { .. } => "decelerated",
            ThrottleEvent::Reaccelerated { .. } => "reaccelerated",
            ThrottleEvent::CoolingStarted { .. } => "cooling_started",
            ThrottleEvent::CircuitOpened { .. } => "circuit_opened",
            ThrottleEvent::CircuitClosed => "circuit_closed",
            ThrottleEvent::Retry { .. } => "retry",
            ThrottleEvent::Progress(_) => "progress",
        }
    }
}

/// Receives [ThrottleEvent] notifications.
///
/// Implementations of this trait must also implement
/// [Debug][std::fmt::Debug] because the application may need to log the
/// throttle state. The trait is called from async tasks, so its
/// implementations must be `Send` and `Sync`.
pub trait EventSink: Send + Sync + std::fmt::Debug {
    fn on_event(&self, event: &ThrottleEvent);
}
