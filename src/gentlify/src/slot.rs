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

//! The per-operation handle passed to the user callable.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// The handle an admitted operation runs with.
///
/// A slot lives for a single [execute][crate::throttle::Throttle::execute]
/// or [acquire][crate::throttle::Throttle::acquire] scope. The operation
/// reads its attempt index from it and reports the tokens it consumed;
/// reported tokens are committed to the budget when the operation succeeds.
#[derive(Debug, Default)]
pub struct Slot {
    attempt: AtomicU32,
    tokens: AtomicU64,
}

impl Slot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The zero-indexed attempt currently running.
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::Relaxed)
    }

    /// Adds `n` to the tokens consumed by this operation.
    pub fn record_tokens(&self, n: u64) {
        self.tokens.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn set_attempt(&self, attempt: u32) {
        self.attempt.store(attempt, Ordering::Relaxed);
    }

    pub(crate) fn tokens_recorded(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_accumulate() {
        let slot = Slot::new();
        assert_eq!(slot.tokens_recorded(), 0);
        slot.record_tokens(40);
        slot.record_tokens(2);
        assert_eq!(slot.tokens_recorded(), 42);
    }

    #[test]
    fn attempt_starts_at_zero() {
        let slot = Slot::new();
        assert_eq!(slot.attempt(), 0);
        slot.set_attempt(2);
        assert_eq!(slot.attempt(), 2);
    }
}
