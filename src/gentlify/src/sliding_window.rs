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

//! A bounded log of timestamped values with lazy pruning.
//!
//! This is the shared primitive under failure counting and token accounting.
//! Entries older than the window length are dropped on read, never on write,
//! keeping `record` O(1). Callers pass the current instant explicitly, so the
//! structure itself holds no clock.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub(crate) struct SlidingWindow {
    length: Duration,
    entries: VecDeque<(Instant, u64)>,
}

impl SlidingWindow {
    /// Creates an empty window covering the trailing `length`.
    pub fn new(length: Duration) -> Self {
        Self {
            length,
            entries: VecDeque::new(),
        }
    }

    pub fn length(&self) -> Duration {
        self.length
    }

    /// Appends `(now, value)`.
    ///
    /// Timestamps are monotone non-decreasing because all callers read the
    /// same monotonic clock. Multiple entries at the same instant are kept.
    pub fn record(&mut self, value: u64, now: Instant) {
        self.entries.push_back((now, value));
    }

    /// The sum of the values still inside the window at `now`.
    pub fn total(&mut self, now: Instant) -> u64 {
        self.prune(now);
        self.entries.iter().map(|(_, v)| *v).sum()
    }

    /// The number of entries still inside the window at `now`.
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.entries.len()
    }

    /// Empties the log.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// The entries still inside the window at `now`, oldest first.
    pub fn entries(&mut self, now: Instant) -> impl Iterator<Item = (Instant, u64)> + '_ {
        self.prune(now);
        self.entries.iter().copied()
    }

    fn prune(&mut self, now: Instant) {
        // `checked_sub` fails only when `now` is too close to the clock
        // origin for anything to have expired.
        let Some(cutoff) = now.checked_sub(self.length) else {
            return;
        };
        while let Some((timestamp, _)) = self.entries.front() {
            if *timestamp > cutoff {
                break;
            }
            self.entries.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Instant {
        // Well past the clock origin so `checked_sub` always succeeds.
        Instant::now() + Duration::from_secs(3600)
    }

    #[test]
    fn record_and_total() {
        let t0 = base();
        let mut window = SlidingWindow::new(Duration::from_secs(60));
        window.record(40, t0);
        window.record(40, t0 + Duration::from_secs(1));
        window.record(30, t0 + Duration::from_secs(2));
        assert_eq!(window.total(t0 + Duration::from_secs(2)), 110);
        assert_eq!(window.count(t0 + Duration::from_secs(2)), 3);
    }

    #[test]
    fn read_prunes_expired_entries() {
        let t0 = base();
        let mut window = SlidingWindow::new(Duration::from_secs(60));
        window.record(40, t0);
        window.record(30, t0 + Duration::from_secs(30));

        // An entry recorded at `t` is excluded from any read at `t + W`.
        assert_eq!(window.total(t0 + Duration::from_secs(60)), 30);
        assert_eq!(window.count(t0 + Duration::from_secs(60)), 1);

        // Once pruned an entry never comes back.
        assert_eq!(window.total(t0 + Duration::from_secs(61)), 30);
        assert_eq!(window.count(t0 + Duration::from_secs(90)), 0);
    }

    #[test]
    fn survives_clock_equality() {
        let t0 = base();
        let mut window = SlidingWindow::new(Duration::from_secs(10));
        window.record(1, t0);
        window.record(1, t0);
        window.record(1, t0);
        assert_eq!(window.count(t0), 3);
        assert_eq!(window.total(t0), 3);
        assert_eq!(window.count(t0 + Duration::from_secs(10)), 0);
    }

    #[test]
    fn clear_empties_the_log() {
        let t0 = base();
        let mut window = SlidingWindow::new(Duration::from_secs(60));
        window.record(5, t0);
        window.record(5, t0);
        window.clear();
        assert_eq!(window.total(t0), 0);
        assert_eq!(window.count(t0), 0);
    }

    #[test]
    fn entries_iterates_oldest_first() {
        let t0 = base();
        let mut window = SlidingWindow::new(Duration::from_secs(60));
        window.record(1, t0);
        window.record(2, t0 + Duration::from_secs(1));
        let got: Vec<u64> = window
            .entries(t0 + Duration::from_secs(1))
            .map(|(_, v)| v)
            .collect();
        assert_eq!(got, vec![1, 2]);
    }
}
