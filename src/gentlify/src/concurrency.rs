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

//! The dynamic ceiling on in-flight operations.
//!
//! Permits come from a semaphore whose effective size changes while holders
//! are in flight. Shrinking never revokes a held permit: free permits are
//! removed immediately and the remainder is recorded as a deficit that
//! releases pay down before returning permits to the semaphore. The
//! semaphore is closed when the throttle closes, failing queued waiters
//! fast.

use crate::error::Error;
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, watch};

#[derive(Debug)]
struct LimiterState {
    current_limit: usize,
    in_flight: usize,
    /// Permits owed to the semaphore by future releases after a shrink
    /// outpaced the free permit count.
    deficit: usize,
    safe_ceiling: usize,
}

#[derive(Debug)]
pub(crate) struct ConcurrencyLimiter {
    max_cap: usize,
    semaphore: Arc<Semaphore>,
    state: Mutex<LimiterState>,
    in_flight_tx: watch::Sender<usize>,
}

/// A read-only view used for snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LimiterView {
    pub current_limit: usize,
    pub in_flight: usize,
    pub safe_ceiling: usize,
}

impl ConcurrencyLimiter {
    pub fn new(max_cap: usize, initial_limit: usize) -> Self {
        let (in_flight_tx, _) = watch::channel(0);
        Self {
            max_cap,
            semaphore: Arc::new(Semaphore::new(initial_limit)),
            state: Mutex::new(LimiterState {
                current_limit: initial_limit,
                in_flight: 0,
                deficit: 0,
                safe_ceiling: max_cap,
            }),
            in_flight_tx,
        }
    }

    pub fn max_cap(&self) -> usize {
        self.max_cap
    }

    /// Waits for an in-flight slot.
    ///
    /// Fails with [ThrottleClosed][crate::error::ErrorKind::ThrottleClosed]
    /// when the limiter was closed, including while waiting.
    pub async fn acquire(&self) -> std::result::Result<(), Error> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::throttle_closed())?;
        // The permit is tracked by `in_flight` and returned by `release`.
        permit.forget();
        let mut state = self.lock();
        state.in_flight += 1;
        let in_flight = state.in_flight;
        drop(state);
        self.in_flight_tx.send_replace(in_flight);
        Ok(())
    }

    /// Returns an in-flight slot.
    pub fn release(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        let in_flight = state.in_flight;
        if state.deficit > 0 {
            state.deficit -= 1;
        } else {
            self.semaphore.add_permits(1);
        }
        drop(state);
        self.in_flight_tx.send_replace(in_flight);
    }

    /// Halves the limit (floor 1); returns `(old, new)`.
    ///
    /// Held permits are untouched; new admissions above the new limit are
    /// refused until releases reconcile.
    pub fn decelerate(&self) -> (usize, usize) {
        let mut state = self.lock();
        let new = std::cmp::max(1, state.current_limit / 2);
        self.apply_limit(&mut state, new)
    }

    /// Raises the limit by one, bounded by `ceiling` and the cap; returns
    /// `(old, new)`.
    pub fn reaccelerate(&self, ceiling: usize) -> (usize, usize) {
        let mut state = self.lock();
        let new = std::cmp::min(std::cmp::min(state.current_limit + 1, ceiling), self.max_cap);
        self.apply_limit(&mut state, new)
    }

    pub fn safe_ceiling(&self) -> usize {
        self.lock().safe_ceiling
    }

    pub fn set_safe_ceiling(&self, ceiling: usize) {
        self.lock().safe_ceiling = ceiling.clamp(1, self.max_cap);
    }

    pub fn current_limit(&self) -> usize {
        self.lock().current_limit
    }

    pub fn view(&self) -> LimiterView {
        let state = self.lock();
        LimiterView {
            current_limit: state.current_limit,
            in_flight: state.in_flight,
            safe_ceiling: state.safe_ceiling,
        }
    }

    /// Fails current and future `acquire` calls.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// A watch on the in-flight count, for drain.
    pub fn in_flight_watch(&self) -> watch::Receiver<usize> {
        self.in_flight_tx.subscribe()
    }

    fn apply_limit(&self, state: &mut LimiterState, new: usize) -> (usize, usize) {
        let old = state.current_limit;
        if new >= old {
            // Raising the limit forgives deficit before minting permits.
            let mut to_add = new - old;
            while to_add > 0 && state.deficit > 0 {
                state.deficit -= 1;
                to_add -= 1;
            }
            if to_add > 0 {
                self.semaphore.add_permits(to_add);
            }
        } else {
            let mut to_remove = old - new;
            while to_remove > 0 {
                match self.semaphore.try_acquire() {
                    Ok(permit) => permit.forget(),
                    Err(_) => break,
                }
                to_remove -= 1;
            }
            state.deficit += to_remove;
        }
        state.current_limit = new;
        (old, new)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state.lock().expect("concurrency limiter lock is poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release_track_in_flight() {
        let limiter = ConcurrencyLimiter::new(4, 2);
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        assert_eq!(limiter.view().in_flight, 2);
        limiter.release();
        assert_eq!(limiter.view().in_flight, 1);
        limiter.release();
        assert_eq!(limiter.view().in_flight, 0);
    }

    #[tokio::test]
    async fn acquire_blocks_at_the_limit() {
        let limiter = Arc::new(ConcurrencyLimiter::new(4, 1));
        limiter.acquire().await.unwrap();
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        limiter.release();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn decelerate_halves_with_floor_one() {
        let limiter = ConcurrencyLimiter::new(8, 8);
        assert_eq!(limiter.decelerate(), (8, 4));
        assert_eq!(limiter.decelerate(), (4, 2));
        assert_eq!(limiter.decelerate(), (2, 1));
        assert_eq!(limiter.decelerate(), (1, 1));
        assert_eq!(limiter.current_limit(), 1);
    }

    #[tokio::test]
    async fn decelerate_never_revokes_held_permits() {
        let limiter = Arc::new(ConcurrencyLimiter::new(4, 4));
        for _ in 0..4 {
            limiter.acquire().await.unwrap();
        }
        assert_eq!(limiter.decelerate(), (4, 2));
        assert_eq!(limiter.view().in_flight, 4);

        // Releases pay down the deficit before new admissions are possible.
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        limiter.release();
        limiter.release();
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished(), "admitted above the new limit");
        limiter.release();
        waiter.await.unwrap().unwrap();
        assert_eq!(limiter.view().in_flight, 2);
    }

    #[tokio::test]
    async fn reaccelerate_is_bounded_by_ceiling_and_cap() {
        let limiter = ConcurrencyLimiter::new(8, 8);
        limiter.decelerate();
        assert_eq!(limiter.reaccelerate(8), (4, 5));
        assert_eq!(limiter.reaccelerate(5), (5, 5));
        let limiter = ConcurrencyLimiter::new(3, 3);
        assert_eq!(limiter.reaccelerate(8), (3, 3));
    }

    #[tokio::test]
    async fn reaccelerate_forgives_deficit_first() {
        let limiter = Arc::new(ConcurrencyLimiter::new(4, 2));
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        limiter.decelerate();
        // Limit is 1 with two holders: deficit 1.
        limiter.reaccelerate(4);
        // Growing to 2 cancels the deficit; no permit was minted, so a new
        // acquire still waits for a release.
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        limiter.release();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn safe_ceiling_resize_clamps() {
        let limiter = ConcurrencyLimiter::new(8, 4);
        limiter.set_safe_ceiling(100);
        assert_eq!(limiter.safe_ceiling(), 8);
        limiter.set_safe_ceiling(0);
        assert_eq!(limiter.safe_ceiling(), 1);
        limiter.set_safe_ceiling(6);
        assert_eq!(limiter.safe_ceiling(), 6);
    }

    #[tokio::test]
    async fn close_fails_waiters_fast() {
        let limiter = Arc::new(ConcurrencyLimiter::new(4, 1));
        limiter.acquire().await.unwrap();
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::task::yield_now().await;
        limiter.close();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_throttle_closed(), "{err:?}");
        let err = limiter.acquire().await.unwrap_err();
        assert!(err.is_throttle_closed(), "{err:?}");
    }

    #[tokio::test]
    async fn watch_reports_in_flight() {
        let limiter = ConcurrencyLimiter::new(2, 2);
        let mut watch = limiter.in_flight_watch();
        assert_eq!(*watch.borrow_and_update(), 0);
        limiter.acquire().await.unwrap();
        watch.changed().await.unwrap();
        assert_eq!(*watch.borrow_and_update(), 1);
        limiter.release();
        watch.changed().await.unwrap();
        assert_eq!(*watch.borrow_and_update(), 0);
    }
}
