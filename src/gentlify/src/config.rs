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

//! Throttle configuration.
//!
//! All options have defaults; constraints are enforced when the throttle is
//! built and by [ThrottleConfig::validate]. Besides direct construction, a
//! configuration can be read from a nested JSON mapping
//! ([from_json][ThrottleConfig::from_json]) or from environment variables
//! with a configurable prefix ([from_env][ThrottleConfig::from_env]), where
//! nested blocks use composed names such as `GENTLIFY_TOKEN_BUDGET_MAX` and
//! `GENTLIFY_CIRCUIT_BREAKER_OPEN_DURATION`. Durations are expressed in
//! fractional seconds in both forms.

use crate::Result;
use crate::error::Error;
use crate::event::EventSink;
use crate::snapshot::ProgressSink;
use serde::{Deserialize, Serialize};
use serde_with::{DurationSecondsWithFrac, serde_as};
use std::sync::Arc;
use std::time::Duration;

/// The default prefix for environment-based configuration.
pub const DEFAULT_ENV_PREFIX: &str = "GENTLIFY_";

/// Decides whether an error counts toward failure accounting.
///
/// When configured, errors the classifier rejects move no counters: the
/// failure window, the circuit breaker, and the deceleration logic all
/// ignore them. The error still propagates to the caller.
///
/// Implementations of this trait must also implement
/// [Debug][std::fmt::Debug] because the application may need to log the
/// throttle state. The trait is called from async tasks, so its
/// implementations must be `Send` and `Sync`.
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    fn is_failure(&self, error: &Error) -> bool;
}

/// Decides whether a failed attempt may be retried.
///
/// Without a classifier every operation error is considered retryable.
pub trait RetryClassifier: Send + Sync + std::fmt::Debug {
    fn is_retryable(&self, error: &Error) -> bool;
}

/// The backoff schedule between retry attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// The base delay before every retry.
    Fixed,
    /// Doubling delays, truncated at the maximum.
    #[default]
    Exponential,
    /// A uniform sample from zero to the truncated exponential delay.
    ExponentialJitter,
}

impl BackoffKind {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "fixed" => Some(BackoffKind::Fixed),
            "exponential" => Some(BackoffKind::Exponential),
            "exponential_jitter" => Some(BackoffKind::ExponentialJitter),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            BackoffKind::Fixed => "fixed",
            BackoffKind::Exponential => "exponential",
            BackoffKind::ExponentialJitter => "exponential_jitter",
        }
    }
}

/// Rolling-window quota configuration.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBudgetConfig {
    /// The number of tokens admitted per window. Must be at least 1; there
    /// is no usable default.
    pub max_tokens: u64,
    /// The window length.
    #[serde(rename = "window_seconds")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub window: Duration,
}

impl std::default::Default for TokenBudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens: 0,
            window: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker configuration.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub consecutive_failures: u32,
    /// How long the breaker stays open before admitting a probe. Grows
    /// exponentially on repeated probe failures, up to five times this
    /// value.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub open_duration: Duration,
    /// Probes admitted concurrently while half-open, and probe successes
    /// required to close.
    pub half_open_max_calls: u32,
}

impl std::default::Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            consecutive_failures: 5,
            open_duration: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

/// Retry configuration.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first. One means no retries.
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub base_delay: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub max_delay: Duration,
    /// Overrides the default judgment that every operation error is
    /// retryable.
    #[serde(skip)]
    pub retryable: Option<Arc<dyn RetryClassifier>>,
}

impl std::default::Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            retryable: None,
        }
    }
}

/// The full set of throttle tunables.
///
/// # Example
/// ```
/// # use gentlify::config::*;
/// use std::time::Duration;
/// fn tuned() -> gentlify::Result<ThrottleConfig> {
///     let config = ThrottleConfig::default()
///         .set_max_concurrency(8)
///         .set_min_dispatch_interval(Duration::from_millis(100))
///         .set_retry(RetryConfig::default());
///     config.validate()?;
///     Ok(config)
/// }
/// ```
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Absolute ceiling on in-flight operations.
    pub max_concurrency: usize,
    /// Starting concurrency limit; defaults to `max_concurrency`.
    pub initial_concurrency: Option<usize>,
    /// Floor for the dispatch interval.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub min_dispatch_interval: Duration,
    /// Cap for the dispatch interval.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub max_dispatch_interval: Duration,
    /// Failures inside the window that trigger a deceleration.
    pub failure_threshold: u32,
    /// The sliding failure window length.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub failure_window: Duration,
    /// Zero-failure time before the throttle reaccelerates.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub cooling_period: Duration,
    /// Multiplier on `cooling_period` after which the safe ceiling resets
    /// to `max_concurrency`.
    pub safe_ceiling_decay_multiplier: f64,
    /// Fraction of the dispatch interval added as uniform jitter.
    pub jitter_fraction: f64,
    /// Total expected operations; enables progress and ETA when non-zero.
    pub total_tasks: u64,
    pub token_budget: Option<TokenBudgetConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub retry: Option<RetryConfig>,
    #[serde(skip)]
    pub failure_predicate: Option<Arc<dyn FailureClassifier>>,
    #[serde(skip)]
    pub on_state_change: Option<Arc<dyn EventSink>>,
    #[serde(skip)]
    pub on_progress: Option<Arc<dyn ProgressSink>>,
}

impl std::default::Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            initial_concurrency: None,
            min_dispatch_interval: Duration::from_millis(200),
            max_dispatch_interval: Duration::from_secs(30),
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            cooling_period: Duration::from_secs(60),
            safe_ceiling_decay_multiplier: 5.0,
            jitter_fraction: 0.5,
            total_tasks: 0,
            token_budget: None,
            circuit_breaker: None,
            retry: None,
            failure_predicate: None,
            on_state_change: None,
            on_progress: None,
        }
    }
}

impl ThrottleConfig {
    /// Sets the ceiling on in-flight operations.
    pub fn set_max_concurrency(mut self, v: usize) -> Self {
        self.max_concurrency = v;
        self
    }

    /// Sets the starting concurrency limit.
    pub fn set_initial_concurrency(mut self, v: usize) -> Self {
        self.initial_concurrency = Some(v);
        self
    }

    /// Sets the floor for the dispatch interval.
    pub fn set_min_dispatch_interval(mut self, v: Duration) -> Self {
        self.min_dispatch_interval = v;
        self
    }

    /// Sets the cap for the dispatch interval.
    pub fn set_max_dispatch_interval(mut self, v: Duration) -> Self {
        self.max_dispatch_interval = v;
        self
    }

    /// Sets the failure count that triggers a deceleration.
    pub fn set_failure_threshold(mut self, v: u32) -> Self {
        self.failure_threshold = v;
        self
    }

    /// Sets the sliding failure window length.
    pub fn set_failure_window(mut self, v: Duration) -> Self {
        self.failure_window = v;
        self
    }

    /// Sets the zero-failure time required before reacceleration.
    pub fn set_cooling_period(mut self, v: Duration) -> Self {
        self.cooling_period = v;
        self
    }

    /// Sets the safe-ceiling decay multiplier.
    pub fn set_safe_ceiling_decay_multiplier(mut self, v: f64) -> Self {
        self.safe_ceiling_decay_multiplier = v;
        self
    }

    /// Sets the jitter fraction.
    pub fn set_jitter_fraction(mut self, v: f64) -> Self {
        self.jitter_fraction = v;
        self
    }

    /// Sets the total expected operations.
    pub fn set_total_tasks(mut self, v: u64) -> Self {
        self.total_tasks = v;
        self
    }

    /// Enables the rolling token budget.
    pub fn set_token_budget(mut self, v: TokenBudgetConfig) -> Self {
        self.token_budget = Some(v);
        self
    }

    /// Enables the circuit breaker.
    pub fn set_circuit_breaker(mut self, v: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(v);
        self
    }

    /// Enables retries.
    pub fn set_retry(mut self, v: RetryConfig) -> Self {
        self.retry = Some(v);
        self
    }

    /// Sets the failure classifier.
    pub fn set_failure_predicate<T: FailureClassifier + 'static>(mut self, v: T) -> Self {
        self.failure_predicate = Some(Arc::new(v));
        self
    }

    /// Sets the state-change sink.
    pub fn set_on_state_change<T: EventSink + 'static>(mut self, v: T) -> Self {
        self.on_state_change = Some(Arc::new(v));
        self
    }

    /// Sets the progress sink.
    pub fn set_on_progress<T: ProgressSink + 'static>(mut self, v: T) -> Self {
        self.on_progress = Some(Arc::new(v));
        self
    }

    /// Builds a configuration from a nested JSON mapping.
    ///
    /// Nested blocks use the `token_budget`, `circuit_breaker`, and `retry`
    /// keys; durations are fractional seconds.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let config: ThrottleConfig =
            serde_json::from_value(value).map_err(Error::validation)?;
        config.validate()?;
        Ok(config)
    }

    /// The nested JSON mapping for this configuration.
    ///
    /// Classifier and sink fields are not representable and are omitted.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(Error::validation)
    }

    /// Builds a configuration from the process environment using the
    /// [DEFAULT_ENV_PREFIX].
    pub fn from_env() -> Result<Self> {
        Self::from_env_with_prefix(DEFAULT_ENV_PREFIX)
    }

    /// Builds a configuration from the process environment using a custom
    /// prefix.
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self> {
        Self::from_env_map(std::env::vars(), prefix)
    }

    /// Builds a configuration from explicit key/value pairs.
    ///
    /// Keys without the prefix are ignored; keys with the prefix but an
    /// unknown suffix are reported as validation errors so typos do not
    /// silently fall back to defaults.
    pub fn from_env_map<I, K, V>(vars: I, prefix: &str) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = ThrottleConfig::default();
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(prefix) else {
                continue;
            };
            let value = value.as_ref();
            match name {
                "MAX_CONCURRENCY" => config.max_concurrency = parse(name, value)?,
                "INITIAL_CONCURRENCY" => {
                    config.initial_concurrency = Some(parse(name, value)?)
                }
                "MIN_DISPATCH_INTERVAL" => {
                    config.min_dispatch_interval = parse_duration(name, value)?
                }
                "MAX_DISPATCH_INTERVAL" => {
                    config.max_dispatch_interval = parse_duration(name, value)?
                }
                "FAILURE_THRESHOLD" => config.failure_threshold = parse(name, value)?,
                "FAILURE_WINDOW" => config.failure_window = parse_duration(name, value)?,
                "COOLING_PERIOD" => config.cooling_period = parse_duration(name, value)?,
                "SAFE_CEILING_DECAY_MULTIPLIER" => {
                    config.safe_ceiling_decay_multiplier = parse(name, value)?
                }
                "JITTER_FRACTION" => config.jitter_fraction = parse(name, value)?,
                "TOTAL_TASKS" => config.total_tasks = parse(name, value)?,
                "TOKEN_BUDGET_MAX" => {
                    config.token_budget.get_or_insert_with(Default::default).max_tokens =
                        parse(name, value)?
                }
                "TOKEN_BUDGET_WINDOW" => {
                    config.token_budget.get_or_insert_with(Default::default).window =
                        parse_duration(name, value)?
                }
                "CIRCUIT_BREAKER_CONSECUTIVE_FAILURES" => {
                    config
                        .circuit_breaker
                        .get_or_insert_with(Default::default)
                        .consecutive_failures = parse(name, value)?
                }
                "CIRCUIT_BREAKER_OPEN_DURATION" => {
                    config
                        .circuit_breaker
                        .get_or_insert_with(Default::default)
                        .open_duration = parse_duration(name, value)?
                }
                "CIRCUIT_BREAKER_HALF_OPEN_MAX_CALLS" => {
                    config
                        .circuit_breaker
                        .get_or_insert_with(Default::default)
                        .half_open_max_calls = parse(name, value)?
                }
                "RETRY_MAX_ATTEMPTS" => {
                    config.retry.get_or_insert_with(Default::default).max_attempts =
                        parse(name, value)?
                }
                "RETRY_BACKOFF" => {
                    let backoff = BackoffKind::parse(value).ok_or_else(|| {
                        Error::validation(format!(
                            "RETRY_BACKOFF ({value}) must be one of fixed, exponential, exponential_jitter"
                        ))
                    })?;
                    config.retry.get_or_insert_with(Default::default).backoff = backoff;
                }
                "RETRY_BASE_DELAY" => {
                    config.retry.get_or_insert_with(Default::default).base_delay =
                        parse_duration(name, value)?
                }
                "RETRY_MAX_DELAY" => {
                    config.retry.get_or_insert_with(Default::default).max_delay =
                        parse_duration(name, value)?
                }
                _ => {
                    return Err(Error::validation(format!(
                        "unknown configuration variable {prefix}{name}"
                    )));
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// The environment representation of this configuration.
    ///
    /// Feeding the result back through [from_env_map][Self::from_env_map]
    /// with the same prefix reproduces the configuration (classifier and
    /// sink fields excepted).
    pub fn to_env_map(&self, prefix: &str) -> Vec<(String, String)> {
        let mut vars = vec![
            (format!("{prefix}MAX_CONCURRENCY"), self.max_concurrency.to_string()),
            (
                format!("{prefix}MIN_DISPATCH_INTERVAL"),
                self.min_dispatch_interval.as_secs_f64().to_string(),
            ),
            (
                format!("{prefix}MAX_DISPATCH_INTERVAL"),
                self.max_dispatch_interval.as_secs_f64().to_string(),
            ),
            (format!("{prefix}FAILURE_THRESHOLD"), self.failure_threshold.to_string()),
            (
                format!("{prefix}FAILURE_WINDOW"),
                self.failure_window.as_secs_f64().to_string(),
            ),
            (
                format!("{prefix}COOLING_PERIOD"),
                self.cooling_period.as_secs_f64().to_string(),
            ),
            (
                format!("{prefix}SAFE_CEILING_DECAY_MULTIPLIER"),
                self.safe_ceiling_decay_multiplier.to_string(),
            ),
            (format!("{prefix}JITTER_FRACTION"), self.jitter_fraction.to_string()),
            (format!("{prefix}TOTAL_TASKS"), self.total_tasks.to_string()),
        ];
        if let Some(v) = self.initial_concurrency {
            vars.push((format!("{prefix}INITIAL_CONCURRENCY"), v.to_string()));
        }
        if let Some(budget) = &self.token_budget {
            vars.push((format!("{prefix}TOKEN_BUDGET_MAX"), budget.max_tokens.to_string()));
            vars.push((
                format!("{prefix}TOKEN_BUDGET_WINDOW"),
                budget.window.as_secs_f64().to_string(),
            ));
        }
        if let Some(breaker) = &self.circuit_breaker {
            vars.push((
                format!("{prefix}CIRCUIT_BREAKER_CONSECUTIVE_FAILURES"),
                breaker.consecutive_failures.to_string(),
            ));
            vars.push((
                format!("{prefix}CIRCUIT_BREAKER_OPEN_DURATION"),
                breaker.open_duration.as_secs_f64().to_string(),
            ));
            vars.push((
                format!("{prefix}CIRCUIT_BREAKER_HALF_OPEN_MAX_CALLS"),
                breaker.half_open_max_calls.to_string(),
            ));
        }
        if let Some(retry) = &self.retry {
            vars.push((format!("{prefix}RETRY_MAX_ATTEMPTS"), retry.max_attempts.to_string()));
            vars.push((format!("{prefix}RETRY_BACKOFF"), retry.backoff.as_str().to_string()));
            vars.push((
                format!("{prefix}RETRY_BASE_DELAY"),
                retry.base_delay.as_secs_f64().to_string(),
            ));
            vars.push((
                format!("{prefix}RETRY_MAX_DELAY"),
                retry.max_delay.as_secs_f64().to_string(),
            ));
        }
        vars
    }

    /// Verifies every constraint, reporting the first violated field.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency < 1 {
            return Err(Error::validation(format!(
                "max_concurrency ({}) must be >= 1",
                self.max_concurrency
            )));
        }
        if let Some(initial) = self.initial_concurrency {
            if initial < 1 || initial > self.max_concurrency {
                return Err(Error::validation(format!(
                    "initial_concurrency ({initial}) must be between 1 and max_concurrency ({})",
                    self.max_concurrency
                )));
            }
        }
        if self.max_dispatch_interval < self.min_dispatch_interval {
            return Err(Error::validation(format!(
                "max_dispatch_interval ({:?}) must be >= min_dispatch_interval ({:?})",
                self.max_dispatch_interval, self.min_dispatch_interval
            )));
        }
        if self.failure_threshold < 1 {
            return Err(Error::validation(format!(
                "failure_threshold ({}) must be >= 1",
                self.failure_threshold
            )));
        }
        if self.failure_window.is_zero() {
            return Err(Error::validation(
                "failure_window must be greater than zero".to_string(),
            ));
        }
        if self.cooling_period.is_zero() {
            return Err(Error::validation(
                "cooling_period must be greater than zero".to_string(),
            ));
        }
        if self.safe_ceiling_decay_multiplier <= 0.0 {
            return Err(Error::validation(format!(
                "safe_ceiling_decay_multiplier ({}) must be > 0",
                self.safe_ceiling_decay_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(Error::validation(format!(
                "jitter_fraction ({}) must be between 0 and 1",
                self.jitter_fraction
            )));
        }
        if let Some(budget) = &self.token_budget {
            if budget.max_tokens < 1 {
                return Err(Error::validation(format!(
                    "token_budget.max_tokens ({}) must be >= 1",
                    budget.max_tokens
                )));
            }
            if budget.window.is_zero() {
                return Err(Error::validation(
                    "token_budget.window_seconds must be greater than zero".to_string(),
                ));
            }
        }
        if let Some(breaker) = &self.circuit_breaker {
            if breaker.consecutive_failures < 1 {
                return Err(Error::validation(format!(
                    "circuit_breaker.consecutive_failures ({}) must be >= 1",
                    breaker.consecutive_failures
                )));
            }
            if breaker.half_open_max_calls < 1 {
                return Err(Error::validation(format!(
                    "circuit_breaker.half_open_max_calls ({}) must be >= 1",
                    breaker.half_open_max_calls
                )));
            }
        }
        if let Some(retry) = &self.retry {
            if retry.max_attempts < 1 {
                return Err(Error::validation(format!(
                    "retry.max_attempts ({}) must be >= 1",
                    retry.max_attempts
                )));
            }
            if retry.max_delay < retry.base_delay {
                return Err(Error::validation(format!(
                    "retry.max_delay ({:?}) must be >= retry.base_delay ({:?})",
                    retry.max_delay, retry.base_delay
                )));
            }
        }
        Ok(())
    }

    /// The effective starting concurrency.
    pub(crate) fn initial_concurrency(&self) -> usize {
        self.initial_concurrency.unwrap_or(self.max_concurrency)
    }

    /// The zero-failure time after which the safe ceiling resets.
    pub(crate) fn safe_ceiling_decay(&self) -> Duration {
        self.cooling_period.mul_f64(self.safe_ceiling_decay_multiplier)
    }
}

fn parse<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| {
        Error::validation(format!("{name} has an unparsable value ({value}): {e}"))
    })
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    let seconds: f64 = parse(name, value)?;
    Duration::try_from_secs_f64(seconds).map_err(|e| {
        Error::validation(format!("{name} ({value}) is not a valid duration: {e}"))
    })
}
