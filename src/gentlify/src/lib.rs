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

//! Adaptive rate throttling for cooperative async clients.
//!
//! This crate gates outbound operations behind a single coordinator, the
//! [Throttle][throttle::Throttle]. The throttle bounds in-flight
//! concurrency, spaces dispatches with jitter, optionally rations a
//! per-window token budget, optionally fails fast behind a circuit breaker,
//! optionally retries transient failures, and re-tunes its own limits from
//! the successes and failures it observes: repeated failures halve the
//! concurrency and double the dispatch spacing, and a sustained quiet
//! period walks them back.
//!
//! # Example
//! ```
//! # use gentlify::Result;
//! use gentlify::config::ThrottleConfig;
//! use gentlify::throttle::Throttle;
//!
//! async fn fetch_all(urls: Vec<String>) -> Result<()> {
//!     let throttle = Throttle::new(
//!         ThrottleConfig::default()
//!             .set_max_concurrency(8)
//!             .set_total_tasks(urls.len() as u64),
//!     )?;
//!     for url in urls {
//!         let body = throttle
//!             .execute(async |_slot| {
//!                 // Call the service here.
//!                 Ok(format!("fetched {url}"))
//!             })
//!             .await?;
//!         tracing::debug!(%body, "one down");
//!     }
//!     throttle.close();
//!     throttle.drain().await;
//!     Ok(())
//! }
//! ```
//!
//! Time and randomness are injected through the [clock::Clock] and
//! [random::RandomSource] traits; nothing in the crate reads global state,
//! so behavior under test is fully deterministic.

/// An alias of [std::result::Result] where the error is always
/// [Error][crate::error::Error].
pub type Result<T> = std::result::Result<T, crate::error::Error>;

/// The error types produced and propagated by the throttle.
pub mod error;

pub mod clock;
pub mod config;
pub mod event;
pub mod random;
pub mod slot;
pub mod snapshot;
pub mod throttle;

mod circuit_breaker;
mod concurrency;
mod dispatch_gate;
mod progress;
mod retry;
mod sliding_window;
mod token_budget;
