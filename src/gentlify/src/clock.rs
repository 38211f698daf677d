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

//! The time source used by the throttle.
//!
//! All reads of the current time and all sleeps go through the [Clock] trait,
//! so tests can control time completely. The default implementation binds the
//! tokio timer: under `#[tokio::test(start_paused = true)]` it is fully
//! deterministic without any further mocking.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

/// A future returned by [Clock::sleep].
pub type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The source of monotonic time for a throttle.
///
/// Implementations of this trait must also implement
/// [Debug][std::fmt::Debug] because the application may need to log the
/// throttle state. The trait is shared across async tasks, so its
/// implementations must be `Send` and `Sync`.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant on the monotonic clock.
    fn now(&self) -> Instant;

    /// Suspends the caller for (at least) the given duration.
    fn sleep(&self, duration: Duration) -> SleepFuture;
}

/// A [Clock] bound to the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> SleepFuture {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_advances_with_sleep() {
        let clock = TokioClock;
        let start = clock.now();
        clock.sleep(Duration::from_secs(5)).await;
        let elapsed = clock.now() - start;
        assert!(elapsed >= Duration::from_secs(5), "{elapsed:?}");
    }
}
