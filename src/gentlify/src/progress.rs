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

//! Completion counting, milestone detection, and ETA estimation.

use std::collections::VecDeque;
use std::time::Duration;

/// Completions kept for the rolling average.
const RECENT_DURATIONS: usize = 50;

/// Milestones are reported every 10% of the total.
const MILESTONE_STEP: u64 = 10;

#[derive(Clone, Debug)]
pub(crate) struct ProgressTracker {
    completed: u64,
    total: u64,
    recent: VecDeque<Duration>,
    last_milestone: u64,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        Self {
            completed: 0,
            total,
            recent: VecDeque::with_capacity(RECENT_DURATIONS),
            last_milestone: 0,
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Records a completion; returns true when this completion crosses a
    /// 10%-of-total boundary that has not been reported yet.
    pub fn record_completion(&mut self, duration: Duration) -> bool {
        self.completed += 1;
        if self.recent.len() == RECENT_DURATIONS {
            self.recent.pop_front();
        }
        self.recent.push_back(duration);

        if self.total == 0 {
            return false;
        }
        let percentage = self.completed * 100 / self.total;
        let milestone = percentage / MILESTONE_STEP * MILESTONE_STEP;
        if milestone > self.last_milestone {
            self.last_milestone = milestone;
            return true;
        }
        false
    }

    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 * 100.0 / self.total as f64
    }

    /// Estimated seconds to finish the remaining work at the given effective
    /// concurrency, or `None` without a total or completion history.
    pub fn eta_seconds(&self, effective_concurrency: usize) -> Option<f64> {
        if self.total == 0 || self.recent.is_empty() {
            return None;
        }
        let sum: Duration = self.recent.iter().sum();
        let average = sum.as_secs_f64() / self.recent.len() as f64;
        let remaining = self.total.saturating_sub(self.completed);
        Some(average * remaining as f64 / effective_concurrency.max(1) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_total_means_no_percentage_or_eta() {
        let mut tracker = ProgressTracker::new(0);
        assert!(!tracker.record_completion(Duration::from_secs(1)));
        assert_eq!(tracker.percentage(), 0.0);
        assert_eq!(tracker.eta_seconds(4), None);
    }

    #[test]
    fn milestones_report_once_per_decile() {
        let mut tracker = ProgressTracker::new(10);
        // Each completion is 10% of the total, so each one is a milestone.
        for _ in 0..10 {
            assert!(tracker.record_completion(Duration::from_secs(1)));
        }
    }

    #[test]
    fn fractional_progress_reports_when_crossing() {
        let mut tracker = ProgressTracker::new(25);
        // 1/25 = 4%, 2/25 = 8%: below the first decile.
        assert!(!tracker.record_completion(Duration::from_secs(1)));
        assert!(!tracker.record_completion(Duration::from_secs(1)));
        // 3/25 = 12% crosses 10%.
        assert!(tracker.record_completion(Duration::from_secs(1)));
        // 4/25 = 16% stays inside the same decile.
        assert!(!tracker.record_completion(Duration::from_secs(1)));
    }

    #[test]
    fn eta_uses_rolling_average_and_concurrency() {
        let mut tracker = ProgressTracker::new(100);
        assert_eq!(tracker.eta_seconds(4), None);
        for _ in 0..10 {
            tracker.record_completion(Duration::from_secs(2));
        }
        // 90 remaining at 2s each over 4 workers.
        assert_eq!(tracker.eta_seconds(4), Some(45.0));
        // Zero concurrency is clamped rather than dividing by zero.
        assert_eq!(tracker.eta_seconds(0), Some(180.0));
    }

    #[test]
    fn rolling_buffer_is_bounded() {
        let mut tracker = ProgressTracker::new(1000);
        for _ in 0..RECENT_DURATIONS {
            tracker.record_completion(Duration::from_secs(100));
        }
        for _ in 0..RECENT_DURATIONS {
            tracker.record_completion(Duration::from_secs(2));
        }
        // The old 100-second samples have aged out of the buffer.
        let remaining = 1000 - 2 * RECENT_DURATIONS as u64;
        assert_eq!(tracker.eta_seconds(1), Some(2.0 * remaining as f64));
    }
}
