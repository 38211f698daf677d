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

//! A rolling-window quota over a countable resource.
//!
//! Usage is committed after an operation succeeds, so a burst of concurrent
//! operations can briefly overshoot the budget; admission waits until enough
//! of the oldest usage has aged out of the window. The budget never
//! spin-waits: it computes the instant at which the required usage expires
//! and the orchestrator sleeps exactly that long before re-checking.

use crate::error::Error;
use crate::sliding_window::SlidingWindow;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub(crate) struct TokenBudget {
    max_tokens: u64,
    window: SlidingWindow,
}

impl TokenBudget {
    pub fn new(max_tokens: u64, window_length: Duration) -> Self {
        Self {
            max_tokens,
            window: SlidingWindow::new(window_length),
        }
    }

    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    /// The usage still inside the window at `now`.
    pub fn tokens_used(&mut self, now: Instant) -> u64 {
        self.window.total(now)
    }

    /// Records `n` tokens of usage. Called after the operation succeeds.
    pub fn commit(&mut self, n: u64, now: Instant) {
        if n > 0 {
            self.window.record(n, now);
        }
    }

    /// How long a caller needing `n` tokens must wait, or `None` when the
    /// budget admits it now.
    ///
    /// Fails when `n` exceeds the budget outright: no amount of waiting
    /// would admit it.
    pub fn time_until_admitted(
        &mut self,
        n: u64,
        now: Instant,
    ) -> std::result::Result<Option<Duration>, Error> {
        if n > self.max_tokens {
            return Err(Error::validation(format!(
                "requested tokens ({n}) must be <= the budget ({})",
                self.max_tokens
            )));
        }
        if n == 0 {
            return Ok(None);
        }
        let used = self.window.total(now);
        if used + n <= self.max_tokens {
            return Ok(None);
        }
        // Walk the oldest entries until enough usage expires to admit `n`.
        // `needed <= used` because `n <= max_tokens`, so the walk always
        // finds an answer.
        let needed = used + n - self.max_tokens;
        let window_length = self.window.length();
        let mut freed = 0;
        for (timestamp, value) in self.window.entries(now) {
            freed += value;
            if freed >= needed {
                let expires_at = timestamp + window_length;
                return Ok(Some(expires_at.saturating_duration_since(now)));
            }
        }
        unreachable!("window usage cannot be less than the amount to free");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    #[test]
    fn admits_within_budget() {
        let t0 = base();
        let mut budget = TokenBudget::new(100, Duration::from_secs(60));
        assert_eq!(budget.time_until_admitted(1, t0).unwrap(), None);
        budget.commit(40, t0);
        budget.commit(40, t0);
        assert_eq!(budget.time_until_admitted(20, t0).unwrap(), None);
        assert_eq!(budget.tokens_used(t0), 80);
    }

    #[test]
    fn zero_request_is_immediate() {
        let t0 = base();
        let mut budget = TokenBudget::new(1, Duration::from_secs(60));
        budget.commit(1, t0);
        assert_eq!(budget.time_until_admitted(0, t0).unwrap(), None);
    }

    #[test]
    fn oversized_request_fails() {
        let t0 = base();
        let mut budget = TokenBudget::new(100, Duration::from_secs(60));
        let err = budget.time_until_admitted(101, t0).unwrap_err();
        assert!(err.is_validation(), "{err:?}");
    }

    #[test]
    fn waits_for_oldest_usage_to_expire() {
        let t0 = base();
        let mut budget = TokenBudget::new(100, Duration::from_secs(60));
        budget.commit(40, t0);
        budget.commit(40, t0 + Duration::from_secs(5));
        budget.commit(30, t0 + Duration::from_secs(10));

        // Usage is 110; one more token needs 11 to expire, which the first
        // 40-token entry covers when it leaves the window at t0 + 60.
        let now = t0 + Duration::from_secs(10);
        let wait = budget.time_until_admitted(1, now).unwrap();
        assert_eq!(wait, Some(Duration::from_secs(50)));

        // After that instant the request is admitted.
        let now = t0 + Duration::from_secs(60);
        assert_eq!(budget.time_until_admitted(1, now).unwrap(), None);
        assert_eq!(budget.tokens_used(now), 70);
    }

    #[test]
    fn may_need_several_entries_to_expire() {
        let t0 = base();
        let mut budget = TokenBudget::new(100, Duration::from_secs(60));
        budget.commit(30, t0);
        budget.commit(30, t0 + Duration::from_secs(1));
        budget.commit(40, t0 + Duration::from_secs(2));

        // The full budget: both 30-token entries must expire first.
        let now = t0 + Duration::from_secs(2);
        let wait = budget.time_until_admitted(60, now).unwrap();
        assert_eq!(wait, Some(Duration::from_secs(59)));
    }

    #[test]
    fn unit_budget_serializes_callers() {
        let t0 = base();
        let mut budget = TokenBudget::new(1, Duration::from_secs(60));
        budget.commit(1, t0);
        let wait = budget.time_until_admitted(1, t0).unwrap();
        assert_eq!(wait, Some(Duration::from_secs(60)));
    }
}
