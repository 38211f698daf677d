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

//! The throttle coordinator.
//!
//! A [Throttle] gates outbound operations through a fixed admission
//! sequence: lifecycle check, circuit breaker, concurrency permit, dispatch
//! spacing, token budget. Operations then run inside the retry loop, and
//! their outcomes feed back into the limits: a filled failure window halves
//! concurrency and doubles the dispatch interval, while a sustained
//! zero-failure cooling period undoes one step of that.
//!
//! The orchestrator's mutable state sits behind one mutex that is never held
//! across a suspension point; sleeps are computed under the lock and
//! performed outside it. Event sinks run outside the lock as well, so a sink
//! may call [snapshot][Throttle::snapshot] re-entrantly.

use crate::Result;
use crate::circuit_breaker::{BreakerState, BreakerTransition, CircuitBreaker};
use crate::clock::{Clock, TokioClock};
use crate::concurrency::ConcurrencyLimiter;
use crate::config::{RetryConfig, ThrottleConfig};
use crate::dispatch_gate::DispatchGate;
use crate::error::Error;
use crate::event::ThrottleEvent;
use crate::progress::ProgressTracker;
use crate::random::{RandomSource, ThreadRngSource};
use crate::sliding_window::SlidingWindow;
use crate::slot::Slot;
use crate::snapshot::{ThrottleSnapshot, ThrottleState};
use crate::token_budget::TokenBudget;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// An adaptive throttle for outbound operations.
///
/// Cloning is cheap and clones share all state, so a throttle can be handed
/// to as many tasks as needed.
///
/// # Example
/// ```
/// # use gentlify::Result;
/// # use gentlify::config::ThrottleConfig;
/// # use gentlify::throttle::Throttle;
/// async fn run() -> Result<()> {
///     let throttle = Throttle::new(ThrottleConfig::default().set_max_concurrency(2))?;
///     let value = throttle
///         .execute(async |_slot| Ok("response".to_string()))
///         .await?;
///     assert_eq!(value, "response");
///     Ok(())
/// }
/// ```
#[derive(Clone, Debug)]
pub struct Throttle {
    inner: Arc<Inner>,
}

/// Configures the capabilities of a [Throttle] before building it.
#[derive(Debug)]
pub struct ThrottleBuilder {
    config: ThrottleConfig,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
}

impl ThrottleBuilder {
    /// Overrides the time source.
    pub fn with_clock<T: Clock + 'static>(mut self, clock: T) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Overrides the randomness source.
    pub fn with_random<T: RandomSource + 'static>(mut self, random: T) -> Self {
        self.random = Arc::new(random);
        self
    }

    /// Validates the configuration and builds the throttle.
    pub fn build(self) -> Result<Throttle> {
        self.config.validate()?;
        let limiter = ConcurrencyLimiter::new(
            self.config.max_concurrency,
            self.config.initial_concurrency(),
        );
        let shared = Shared {
            gate: DispatchGate::new(
                self.config.min_dispatch_interval,
                self.config.jitter_fraction,
            ),
            failures: SlidingWindow::new(self.config.failure_window),
            budget: self
                .config
                .token_budget
                .as_ref()
                .map(|b| TokenBudget::new(b.max_tokens, b.window)),
            breaker: self.config.circuit_breaker.as_ref().map(CircuitBreaker::new),
            progress: ProgressTracker::new(self.config.total_tasks),
            phase: Phase::Running,
            last_failure_at: None,
        };
        Ok(Throttle {
            inner: Arc::new(Inner {
                config: self.config,
                clock: self.clock,
                random: self.random,
                limiter,
                shared: Mutex::new(shared),
            }),
        })
    }
}

#[derive(Debug)]
struct Inner {
    config: ThrottleConfig,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    limiter: ConcurrencyLimiter,
    shared: Mutex<Shared>,
}

#[derive(Debug)]
struct Shared {
    gate: DispatchGate,
    failures: SlidingWindow,
    budget: Option<TokenBudget>,
    breaker: Option<CircuitBreaker>,
    progress: ProgressTracker,
    phase: Phase,
    last_failure_at: Option<Instant>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Running,
    Cooling { since: Instant },
    Closed,
}

/// Releases the concurrency slot on every exit path, including
/// cancellation.
#[derive(Debug)]
struct SlotGuard {
    inner: Arc<Inner>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.limiter.release();
    }
}

/// A scope-guarded admission returned by [Throttle::acquire].
///
/// The permit holds the concurrency slot until it is dropped. The outcome
/// is recorded at most once through the consuming
/// [record_success][Permit::record_success] and
/// [record_failure][Permit::record_failure]; dropping the permit without
/// recording an outcome releases the slot and moves no counters, which is
/// the cancellation behavior.
#[derive(Debug)]
pub struct Permit {
    throttle: Throttle,
    slot: Slot,
    started: Instant,
    _guard: SlotGuard,
}

impl Permit {
    /// The slot for the admitted operation.
    pub fn slot(&self) -> &Slot {
        &self.slot
    }

    /// Records a successful outcome and releases the permit.
    pub fn record_success(self) {
        let duration = self
            .throttle
            .inner
            .clock
            .now()
            .saturating_duration_since(self.started);
        self.throttle
            .handle_success(duration, self.slot.tokens_recorded());
    }

    /// Records a failed outcome and releases the permit.
    pub fn record_failure(self, error: &Error) {
        self.throttle.handle_failure(error);
    }
}

impl Throttle {
    /// Creates a throttle with the default clock and randomness source.
    pub fn new(config: ThrottleConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Starts building a throttle with custom capabilities.
    pub fn builder(config: ThrottleConfig) -> ThrottleBuilder {
        ThrottleBuilder {
            config,
            clock: Arc::new(TokioClock),
            random: Arc::new(ThreadRngSource),
        }
    }

    /// Runs `operation` under the throttle.
    ///
    /// The operation is admitted through the circuit breaker, the
    /// concurrency limit, the dispatch gate, and the token budget, then run
    /// under the configured retry schedule. Its error, if any, is observed
    /// for bookkeeping and propagated unchanged.
    pub async fn execute<F, T>(&self, operation: F) -> Result<T>
    where
        F: AsyncFn(&Slot) -> Result<T>,
    {
        let inner = &self.inner;
        let guard = self.admit().await?;
        let slot = Slot::new();
        let max_attempts = inner.config.retry.as_ref().map_or(1, |r| r.max_attempts);
        let mut attempt = 0;
        loop {
            slot.set_attempt(attempt);
            let attempt_start = inner.clock.now();
            match operation(&slot).await {
                Ok(value) => {
                    let duration = inner.clock.now().saturating_duration_since(attempt_start);
                    self.handle_success(duration, slot.tokens_recorded());
                    drop(guard);
                    return Ok(value);
                }
                Err(error) => {
                    let exhausted = attempt + 1 >= max_attempts;
                    let retryable = inner
                        .config
                        .retry
                        .as_ref()
                        .is_some_and(|r| r.is_retryable(&error));
                    if exhausted || !retryable {
                        self.handle_failure(&error);
                        drop(guard);
                        return Err(error);
                    }
                    // The intermediate failure feeds the breaker's
                    // consecutive-failure run but not the adaptive window;
                    // only the final outcome does that.
                    if let Some(retry_after) = self.record_intermediate_failure() {
                        drop(guard);
                        return Err(Error::circuit_open(retry_after).with_source(error));
                    }
                    let retry = inner
                        .config
                        .retry
                        .as_ref()
                        .expect("retryable error without a retry configuration");
                    let delay = self.backoff_delay(retry, attempt);
                    self.emit(ThrottleEvent::Retry {
                        attempt,
                        delay,
                        error: error.to_string(),
                    });
                    inner.clock.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Admits one operation and yields its [Permit].
    ///
    /// This is the low-level admission path: the caller runs its own work
    /// while holding the permit and records the outcome on it. Retries do
    /// not apply.
    pub async fn acquire(&self) -> Result<Permit> {
        let guard = self.admit().await?;
        Ok(Permit {
            throttle: self.clone(),
            slot: Slot::new(),
            started: self.inner.clock.now(),
            _guard: guard,
        })
    }

    /// Adapts an operation into a self-throttling callable.
    pub fn wrap<F, T>(&self, operation: F) -> impl AsyncFn() -> Result<T>
    where
        F: AsyncFn(&Slot) -> Result<T>,
    {
        let throttle = self.clone();
        async move || throttle.execute(&operation).await
    }

    /// Records a successful operation driven outside the admission path.
    pub fn record_success(&self, duration: Duration, tokens_used: u64) {
        self.handle_success(duration, tokens_used);
    }

    /// Records a failed operation driven outside the admission path.
    pub fn record_failure(&self, error: &Error) {
        self.handle_failure(error);
    }

    /// Commits token usage to the budget directly.
    pub fn record_tokens(&self, n: u64) {
        let now = self.inner.clock.now();
        if let Some(budget) = self.lock().budget.as_mut() {
            budget.commit(n, now);
        }
    }

    /// Assembles a consistent point-in-time view of the throttle.
    pub fn snapshot(&self) -> ThrottleSnapshot {
        let now = self.inner.clock.now();
        let mut shared = self.lock();
        self.assemble_snapshot(&mut shared, now)
    }

    /// Forbids new admissions. Idempotent and non-blocking.
    ///
    /// Operations already admitted keep running; await [drain][Self::drain]
    /// for them.
    pub fn close(&self) {
        let mut shared = self.lock();
        let newly_closed = shared.phase != Phase::Closed;
        shared.phase = Phase::Closed;
        drop(shared);
        self.inner.limiter.close();
        if newly_closed {
            tracing::info!("throttle closed");
        }
    }

    /// Resolves once nothing is in flight.
    ///
    /// New admissions attempted after [close][Self::close] fail fast, so a
    /// closed throttle drains monotonically.
    pub async fn drain(&self) {
        let mut in_flight = self.inner.limiter.in_flight_watch();
        loop {
            if *in_flight.borrow_and_update() == 0 {
                return;
            }
            if in_flight.changed().await.is_err() {
                return;
            }
        }
    }

    /// The admission sequence shared by `execute` and `acquire`.
    async fn admit(&self) -> Result<SlotGuard> {
        let inner = &self.inner;
        {
            let mut shared = self.lock();
            if shared.phase == Phase::Closed {
                return Err(Error::throttle_closed());
            }
            if let Some(breaker) = shared.breaker.as_mut() {
                breaker.check(inner.clock.now())?;
            }
        }

        if let Err(error) = inner.limiter.acquire().await {
            self.abandon_probe();
            return Err(error);
        }
        let guard = SlotGuard {
            inner: inner.clone(),
        };
        // `close` may have won the race against the permit.
        if self.lock().phase == Phase::Closed {
            self.abandon_probe();
            return Err(Error::throttle_closed());
        }

        let pause = {
            let shared = self.lock();
            let jitter = inner.random.uniform(0.0, shared.gate.jitter_ceiling());
            let jitter = Duration::from_secs_f64(jitter.max(0.0));
            shared.gate.sleep_before_dispatch(inner.clock.now(), jitter)
        };
        if !pause.is_zero() {
            inner.clock.sleep(pause).await;
        }
        self.lock().gate.record_dispatch(inner.clock.now());

        // The budget is asked for a single token at admission; actual usage
        // is only known once the operation reports it and is committed
        // post-hoc.
        loop {
            let wait = {
                let mut shared = self.lock();
                match shared.budget.as_mut() {
                    None => None,
                    Some(budget) => budget.time_until_admitted(1, inner.clock.now())?,
                }
            };
            match wait {
                None => break,
                Some(delay) => inner.clock.sleep(delay).await,
            }
        }
        Ok(guard)
    }

    fn handle_success(&self, duration: Duration, tokens: u64) {
        let inner = &self.inner;
        let now = inner.clock.now();
        let mut events = Vec::new();
        let mut milestone = None;
        {
            let mut shared = self.lock();
            if let Some(breaker) = shared.breaker.as_mut() {
                if let Some(BreakerTransition::Closed) = breaker.record_success(now) {
                    events.push(ThrottleEvent::CircuitClosed);
                }
            }
            let failures_zero = shared.failures.count(now) == 0;
            match shared.phase {
                Phase::Cooling { since }
                    if now.saturating_duration_since(since) >= inner.config.cooling_period
                        && failures_zero =>
                {
                    let ceiling = inner.limiter.safe_ceiling();
                    let (old_concurrency, new_concurrency) = inner.limiter.reaccelerate(ceiling);
                    let old_interval = shared.gate.interval();
                    shared.gate.reaccelerate(inner.config.min_dispatch_interval);
                    let new_interval = shared.gate.interval();
                    let quiet_for_decay = shared.last_failure_at.is_none_or(|last| {
                        now.saturating_duration_since(last) >= inner.config.safe_ceiling_decay()
                    });
                    if new_concurrency == ceiling && quiet_for_decay {
                        inner.limiter.set_safe_ceiling(inner.limiter.max_cap());
                    }
                    shared.phase = Phase::Running;
                    events.push(ThrottleEvent::Reaccelerated {
                        old_concurrency,
                        new_concurrency,
                        old_interval,
                        new_interval,
                    });
                }
                _ => {
                    if let Some(last) = shared.last_failure_at {
                        if now.saturating_duration_since(last) >= inner.config.safe_ceiling_decay()
                        {
                            inner.limiter.set_safe_ceiling(inner.limiter.max_cap());
                        }
                    }
                }
            }
            if tokens > 0 {
                if let Some(budget) = shared.budget.as_mut() {
                    budget.commit(tokens, now);
                }
            }
            if shared.progress.record_completion(duration) {
                tracing::info!(
                    completed = shared.progress.completed(),
                    percentage = shared.progress.percentage(),
                    "progress milestone"
                );
                milestone = Some(self.assemble_snapshot(&mut shared, now));
            }
        }
        for event in events {
            self.emit(event);
        }
        if let Some(snapshot) = milestone {
            if let Some(sink) = &inner.config.on_progress {
                sink.on_progress(&snapshot);
            }
            self.emit(ThrottleEvent::Progress(snapshot));
        }
    }

    fn handle_failure(&self, error: &Error) {
        let inner = &self.inner;
        if let Some(classifier) = &inner.config.failure_predicate {
            if !classifier.is_failure(error) {
                return;
            }
        }
        let now = inner.clock.now();
        let mut events = Vec::new();
        {
            let mut shared = self.lock();
            shared.last_failure_at = Some(now);
            shared.failures.record(1, now);
            if let Some(breaker) = shared.breaker.as_mut() {
                if let Some(BreakerTransition::Opened {
                    consecutive_failures,
                    retry_after,
                }) = breaker.record_failure(now)
                {
                    events.push(ThrottleEvent::CircuitOpened {
                        consecutive_failures,
                        retry_after,
                    });
                }
            }
            let failure_count = shared.failures.count(now);
            if failure_count >= inner.config.failure_threshold as usize {
                inner.limiter.set_safe_ceiling(inner.limiter.current_limit());
                let (old_concurrency, new_concurrency) = inner.limiter.decelerate();
                let old_interval = shared.gate.interval();
                shared.gate.decelerate(inner.config.max_dispatch_interval);
                let new_interval = shared.gate.interval();
                // Counted failures must not decelerate again; the window
                // restarts empty.
                shared.failures.clear();
                if shared.phase != Phase::Closed {
                    shared.phase = Phase::Cooling { since: now };
                }
                events.push(ThrottleEvent::Decelerated {
                    old_concurrency,
                    new_concurrency,
                    old_interval,
                    new_interval,
                    failure_count,
                });
                events.push(ThrottleEvent::CoolingStarted {
                    cooling_period: inner.config.cooling_period,
                });
            }
        }
        for event in events {
            self.emit(event);
        }
    }

    /// Feeds a retried failure to the breaker; returns the retry-after
    /// delay when the breaker tripped open.
    fn record_intermediate_failure(&self) -> Option<Duration> {
        let now = self.inner.clock.now();
        let transition = {
            let mut shared = self.lock();
            shared
                .breaker
                .as_mut()
                .and_then(|breaker| breaker.record_failure(now))
        };
        match transition {
            Some(BreakerTransition::Opened {
                consecutive_failures,
                retry_after,
            }) => {
                self.emit(ThrottleEvent::CircuitOpened {
                    consecutive_failures,
                    retry_after,
                });
                Some(retry_after)
            }
            _ => None,
        }
    }

    fn backoff_delay(&self, retry: &RetryConfig, attempt: u32) -> Duration {
        let ceiling = retry.delay_ceiling(attempt);
        if retry.jittered() {
            let seconds = self.inner.random.uniform(0.0, ceiling.as_secs_f64());
            Duration::from_secs_f64(seconds.max(0.0))
        } else {
            ceiling
        }
    }

    /// Undoes a probe admission whose operation never ran.
    fn abandon_probe(&self) {
        if let Some(breaker) = self.lock().breaker.as_mut() {
            breaker.release_probe();
        }
    }

    fn assemble_snapshot(&self, shared: &mut Shared, now: Instant) -> ThrottleSnapshot {
        let inner = &self.inner;
        let limiter = inner.limiter.view();
        let state = if shared.phase == Phase::Closed {
            if limiter.in_flight > 0 {
                ThrottleState::Draining
            } else {
                ThrottleState::Closed
            }
        } else if shared
            .breaker
            .as_ref()
            .is_some_and(|b| b.state() == BreakerState::Open)
        {
            ThrottleState::CircuitOpen
        } else if matches!(shared.phase, Phase::Cooling { .. }) {
            ThrottleState::Cooling
        } else {
            ThrottleState::Running
        };
        let (tokens_used, tokens_remaining) = match shared.budget.as_mut() {
            None => (0, None),
            Some(budget) => {
                let used = budget.tokens_used(now);
                (used, Some(budget.max_tokens().saturating_sub(used)))
            }
        };
        ThrottleSnapshot {
            concurrency: limiter.current_limit,
            max_concurrency: inner.limiter.max_cap(),
            dispatch_interval: shared.gate.interval(),
            completed_tasks: shared.progress.completed(),
            total_tasks: shared.progress.total(),
            failure_count: shared.failures.count(now),
            state,
            safe_ceiling: limiter.safe_ceiling,
            eta_seconds: shared.progress.eta_seconds(limiter.current_limit),
            tokens_used,
            tokens_remaining,
        }
    }

    fn emit(&self, event: ThrottleEvent) {
        match &event {
            ThrottleEvent::CircuitOpened {
                consecutive_failures,
                retry_after,
            } => {
                tracing::warn!(
                    consecutive_failures = *consecutive_failures,
                    retry_after_secs = retry_after.as_secs_f64(),
                    "circuit breaker opened"
                );
            }
            ThrottleEvent::Progress(_) => {}
            _ => {
                tracing::info!(kind = event.kind(), ?event, "throttle state change");
            }
        }
        if let Some(sink) = &self.inner.config.on_state_change {
            sink.on_event(&event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .expect("throttle state lock is poisoned")
    }
}
