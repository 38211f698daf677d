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

//! Retry schedule evaluation.
//!
//! The retry configuration lives in [RetryConfig][crate::config::RetryConfig];
//! this module computes the delay before each retry attempt. For the
//! full-jitter schedule the orchestrator samples the actual delay from its
//! random source; this module only supplies the ceiling.

use crate::config::{BackoffKind, RetryConfig};
use crate::error::Error;
use std::time::Duration;

impl RetryConfig {
    /// The largest delay the schedule allows before attempt `attempt + 1`.
    ///
    /// For [BackoffKind::Fixed] this is the delay itself; for the exponential
    /// schedules it is the truncated exponential ceiling. `attempt` is the
    /// zero-indexed attempt that just failed.
    pub(crate) fn delay_ceiling(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Exponential | BackoffKind::ExponentialJitter => {
                if self.base_delay.is_zero() {
                    return Duration::ZERO;
                }
                let scaling = 2f64.powi(attempt.min(i32::MAX as u32) as i32);
                if scaling >= self.max_delay.div_duration_f64(self.base_delay) {
                    self.max_delay
                } else {
                    self.base_delay.mul_f64(scaling)
                }
            }
        }
    }

    /// Whether the schedule applies full jitter to the ceiling.
    pub(crate) fn jittered(&self) -> bool {
        self.backoff == BackoffKind::ExponentialJitter
    }

    /// Whether the error may be retried; defers to the configured classifier
    /// and defaults to retryable.
    pub(crate) fn is_retryable(&self, error: &Error) -> bool {
        self.retryable
            .as_ref()
            .is_none_or(|classifier| classifier.is_retryable(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryClassifier;
    use std::sync::Arc;

    fn config(backoff: BackoffKind, base: u64, max: u64) -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            backoff,
            base_delay: Duration::from_secs(base),
            max_delay: Duration::from_secs(max),
            retryable: None,
        }
    }

    #[test]
    fn fixed_ignores_the_attempt() {
        let retry = config(BackoffKind::Fixed, 1, 60);
        assert_eq!(retry.delay_ceiling(0), Duration::from_secs(1));
        assert_eq!(retry.delay_ceiling(5), Duration::from_secs(1));
        assert!(!retry.jittered());
    }

    #[test]
    fn exponential_doubles_up_to_the_cap() {
        let retry = config(BackoffKind::Exponential, 1, 4);
        assert_eq!(retry.delay_ceiling(0), Duration::from_secs(1));
        assert_eq!(retry.delay_ceiling(1), Duration::from_secs(2));
        assert_eq!(retry.delay_ceiling(2), Duration::from_secs(4));
        assert_eq!(retry.delay_ceiling(3), Duration::from_secs(4));
        assert_eq!(retry.delay_ceiling(40), Duration::from_secs(4));
    }

    #[test]
    fn jitter_applies_to_the_same_ceiling() {
        let retry = config(BackoffKind::ExponentialJitter, 1, 4);
        assert!(retry.jittered());
        assert_eq!(retry.delay_ceiling(1), Duration::from_secs(2));
    }

    #[test]
    fn zero_base_delay_is_allowed() {
        // min(0 * 2^i, max) never grows.
        let retry = config(BackoffKind::Exponential, 0, 4);
        assert_eq!(retry.delay_ceiling(0), Duration::ZERO);
        assert_eq!(retry.delay_ceiling(10), Duration::ZERO);
    }

    #[test]
    fn retryable_defaults_to_true() {
        let retry = config(BackoffKind::Fixed, 1, 60);
        assert!(retry.is_retryable(&Error::operation("boom")));
    }

    #[derive(Debug)]
    struct NeverRetry;
    impl RetryClassifier for NeverRetry {
        fn is_retryable(&self, _error: &Error) -> bool {
            false
        }
    }

    #[test]
    fn retryable_defers_to_the_classifier() {
        let mut retry = config(BackoffKind::Fixed, 1, 60);
        retry.retryable = Some(Arc::new(NeverRetry));
        assert!(!retry.is_retryable(&Error::operation("boom")));
    }
}
