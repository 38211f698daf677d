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

//! The randomness source used for jitter.
//!
//! Dispatch jitter and full-jitter retry backoff both draw from a
//! [RandomSource]. The default binds the thread-local generator from the
//! `rand` crate; tests supply deterministic sources.

/// The source of uniform random values for a throttle.
///
/// Implementations of this trait must also implement
/// [Debug][std::fmt::Debug] because the application may need to log the
/// throttle state. The trait is shared across async tasks, so its
/// implementations must be `Send` and `Sync`.
pub trait RandomSource: Send + Sync + std::fmt::Debug {
    /// Returns a value uniformly distributed in `[lo, hi]`.
    ///
    /// Callers guarantee `lo <= hi`. When `lo == hi` the value is returned
    /// as-is.
    fn uniform(&self, lo: f64, hi: f64) -> f64;
}

/// A [RandomSource] bound to the `rand` thread-local generator.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRngSource;

impl RandomSource for ThreadRngSource {
    fn uniform(&self, lo: f64, hi: f64) -> f64 {
        if lo >= hi {
            return lo;
        }
        use rand::Rng;
        rand::rng().random_range(lo..=hi)
    }
}
