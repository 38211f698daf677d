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

//! A three-state circuit breaker with exponential open duration.
//!
//! The breaker trips open after a run of consecutive failures. While open,
//! admissions fail fast with the time remaining until a probe is allowed.
//! Once the open duration elapses the breaker admits a bounded number of
//! probes (half-open); enough probe successes close it, any probe failure
//! re-opens it with a doubled open duration, capped at five times the
//! configured value. The exponential growth absorbs flapping services while
//! the cap bounds the lockout a single probe failure can cause.

use crate::config::CircuitBreakerConfig;
use crate::error::Error;
use std::time::{Duration, Instant};

const MAX_OPEN_DURATION_FACTOR: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// A state change worth reporting to the application.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum BreakerTransition {
    Opened {
        consecutive_failures: u32,
        retry_after: Duration,
    },
    Closed,
}

#[derive(Clone, Debug)]
pub(crate) struct CircuitBreaker {
    failure_limit: u32,
    open_duration: Duration,
    half_open_max_calls: u32,

    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    current_open_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_limit: config.consecutive_failures,
            open_duration: config.open_duration,
            half_open_max_calls: config.half_open_max_calls,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            half_open_in_flight: 0,
            opened_at: None,
            current_open_duration: config.open_duration,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Admission check; may transition OPEN to HALF_OPEN.
    ///
    /// In HALF_OPEN the caller becomes a probe when a slot is available;
    /// callers beyond `half_open_max_calls` are rejected with
    /// `retry_after = 0` rather than queued.
    pub fn check(&mut self, now: Instant) -> std::result::Result<(), Error> {
        match self.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                if now.saturating_duration_since(opened_at) >= self.current_open_duration {
                    self.state = BreakerState::HalfOpen;
                    self.half_open_successes = 0;
                    self.half_open_in_flight = 1;
                    return Ok(());
                }
                Err(Error::circuit_open(self.retry_after(now)))
            }
            BreakerState::HalfOpen => {
                if self.half_open_in_flight < self.half_open_max_calls {
                    self.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(Error::circuit_open(Duration::ZERO))
                }
            }
        }
    }

    /// Undoes a probe admission whose operation never ran.
    pub fn release_probe(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
        }
    }

    pub fn record_success(&mut self, _now: Instant) -> Option<BreakerTransition> {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures = 0;
                None
            }
            BreakerState::HalfOpen => {
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                self.half_open_successes += 1;
                if self.half_open_successes >= self.half_open_max_calls {
                    self.state = BreakerState::Closed;
                    self.consecutive_failures = 0;
                    self.half_open_successes = 0;
                    self.half_open_in_flight = 0;
                    self.opened_at = None;
                    self.current_open_duration = self.open_duration;
                    Some(BreakerTransition::Closed)
                } else {
                    None
                }
            }
            // An operation admitted before the trip may complete while open;
            // it does not affect the open timer.
            BreakerState::Open => None,
        }
    }

    pub fn record_failure(&mut self, now: Instant) -> Option<BreakerTransition> {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_limit {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                    self.current_open_duration = self.open_duration;
                    Some(BreakerTransition::Opened {
                        consecutive_failures: self.consecutive_failures,
                        retry_after: self.current_open_duration,
                    })
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                self.state = BreakerState::Open;
                self.opened_at = Some(now);
                self.current_open_duration = std::cmp::min(
                    self.current_open_duration.saturating_mul(2),
                    self.open_duration
                        .saturating_mul(MAX_OPEN_DURATION_FACTOR),
                );
                Some(BreakerTransition::Opened {
                    consecutive_failures: self.consecutive_failures,
                    retry_after: self.current_open_duration,
                })
            }
            BreakerState::Open => {
                self.consecutive_failures += 1;
                None
            }
        }
    }

    /// Time until the breaker would admit a probe, zero when not open.
    pub fn retry_after(&self, now: Instant) -> Duration {
        match (self.state, self.opened_at) {
            (BreakerState::Open, Some(opened_at)) => (opened_at + self.current_open_duration)
                .saturating_duration_since(now),
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(consecutive_failures: u32, open_duration: u64, half_open_max_calls: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            consecutive_failures,
            open_duration: Duration::from_secs(open_duration),
            half_open_max_calls,
        }
    }

    fn base() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    #[test]
    fn trips_open_after_consecutive_failures() {
        let t0 = base();
        let mut breaker = CircuitBreaker::new(&config(3, 10, 1));
        assert!(breaker.record_failure(t0).is_none());
        assert!(breaker.record_failure(t0).is_none());
        let transition = breaker.record_failure(t0);
        assert_eq!(
            transition,
            Some(BreakerTransition::Opened {
                consecutive_failures: 3,
                retry_after: Duration::from_secs(10),
            })
        );
        assert_eq!(breaker.state(), BreakerState::Open);

        let err = breaker.check(t0 + Duration::from_secs(4)).unwrap_err();
        assert!(err.is_circuit_open(), "{err:?}");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(6)));
    }

    #[test]
    fn success_resets_the_failure_run() {
        let t0 = base();
        let mut breaker = CircuitBreaker::new(&config(3, 10, 1));
        breaker.record_failure(t0);
        breaker.record_failure(t0);
        breaker.record_success(t0);
        breaker.record_failure(t0);
        breaker.record_failure(t0);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn open_admits_probe_after_open_duration() {
        let t0 = base();
        let mut breaker = CircuitBreaker::new(&config(1, 10, 1));
        breaker.record_failure(t0);
        assert_eq!(breaker.state(), BreakerState::Open);

        assert!(breaker.check(t0 + Duration::from_secs(9)).is_err());
        assert!(breaker.check(t0 + Duration::from_secs(10)).is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_rejects_overflow_probes() {
        let t0 = base();
        let mut breaker = CircuitBreaker::new(&config(1, 10, 2));
        breaker.record_failure(t0);
        let later = t0 + Duration::from_secs(10);
        assert!(breaker.check(later).is_ok());
        assert!(breaker.check(later).is_ok());
        let err = breaker.check(later).unwrap_err();
        assert!(err.is_circuit_open(), "{err:?}");
        assert_eq!(err.retry_after(), Some(Duration::ZERO));

        // A finished probe frees its slot.
        breaker.record_success(later);
        assert!(breaker.check(later).is_ok());
    }

    #[test]
    fn probe_successes_close_the_breaker() {
        let t0 = base();
        let mut breaker = CircuitBreaker::new(&config(1, 10, 2));
        breaker.record_failure(t0);
        let later = t0 + Duration::from_secs(10);
        breaker.check(later).unwrap();
        breaker.check(later).unwrap();
        assert!(breaker.record_success(later).is_none());
        let transition = breaker.record_success(later);
        assert_eq!(transition, Some(BreakerTransition::Closed));
        assert_eq!(breaker.state(), BreakerState::Closed);
        // The open duration resets with the breaker.
        breaker.record_failure(later);
        assert_eq!(breaker.retry_after(later), Duration::from_secs(10));
    }

    #[test]
    fn probe_failure_doubles_open_duration_up_to_cap() {
        let mut now = base();
        let mut breaker = CircuitBreaker::new(&config(1, 10, 1));
        breaker.record_failure(now);

        for expected_secs in [20u64, 40, 50, 50] {
            now += breaker.retry_after(now);
            breaker.check(now).unwrap();
            let transition = breaker.record_failure(now);
            assert_eq!(
                transition,
                Some(BreakerTransition::Opened {
                    consecutive_failures: 1,
                    retry_after: Duration::from_secs(expected_secs),
                })
            );
        }
    }

    #[test]
    fn zero_open_duration_goes_half_open_immediately() {
        let t0 = base();
        let mut breaker = CircuitBreaker::new(&config(1, 0, 1));
        breaker.record_failure(t0);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.check(t0).is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn released_probe_frees_its_slot() {
        let t0 = base();
        let mut breaker = CircuitBreaker::new(&config(1, 10, 1));
        breaker.record_failure(t0);
        let later = t0 + Duration::from_secs(10);
        breaker.check(later).unwrap();
        assert!(breaker.check(later).is_err());
        breaker.release_probe();
        assert!(breaker.check(later).is_ok());
    }

    #[test]
    fn breaker_is_deterministic_for_a_fixed_sequence() {
        let t0 = base();
        let run = || {
            let mut breaker = CircuitBreaker::new(&config(2, 10, 1));
            let mut states = vec![];
            breaker.record_failure(t0);
            states.push(breaker.state());
            breaker.record_failure(t0);
            states.push(breaker.state());
            let _ = breaker.check(t0 + Duration::from_secs(10));
            states.push(breaker.state());
            breaker.record_success(t0 + Duration::from_secs(10));
            states.push(breaker.state());
            states
        };
        assert_eq!(run(), run());
    }
}
