//! Bounded condition polling.
//!
//! [`wait_for`] re-evaluates a predicate on a fixed interval until it produces the
//! expected value or the attempt budget runs out. Running out is not an error: both
//! outcomes complete the wait, and callers usually proceed the same way after either.
//!
//! Each retry sleeps on the Tokio timer, so the task yields between evaluations.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use drill_sorter::poller::{wait_for, PollOutcome, PollSettings};
//!
//! # tokio_test::block_on(async {
//! let settings = PollSettings::new(Duration::from_millis(1), 0, 5);
//! let mut calls = 0;
//! let outcome = wait_for(|| { calls += 1; calls >= 3 }, true, settings).await;
//! assert_eq!(outcome, PollOutcome::Satisfied { evaluations: 3 });
//! # })
//! ```

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

/// How a wait finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate produced the expected value
    Satisfied { evaluations: u32 },
    /// The attempt budget ran out first
    Exhausted { evaluations: u32 },
}

impl PollOutcome {
    /// Number of predicate evaluations performed.
    pub fn evaluations(&self) -> u32 {
        match self {
            PollOutcome::Satisfied { evaluations } | PollOutcome::Exhausted { evaluations } => {
                *evaluations
            }
        }
    }

    /// Whether the predicate was satisfied.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, PollOutcome::Satisfied { .. })
    }
}

/// Retry schedule for [`wait_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Delay between evaluations
    pub interval: Duration,
    /// Attempt count to start from
    pub start_count: u32,
    /// Give up once the attempt count exceeds this
    pub max_count: u32,
}

impl PollSettings {
    /// Create a schedule.
    pub fn new(interval: Duration, start_count: u32, max_count: u32) -> Self {
        Self {
            interval,
            start_count,
            max_count,
        }
    }
}

impl Default for PollSettings {
    /// 100 ms interval, starting at 0, at most 20 retries.
    fn default() -> Self {
        Self::new(Duration::from_millis(100), 0, 20)
    }
}

/// Poll `predicate` until it returns `expected` or the budget is spent.
///
/// The predicate is evaluated immediately. Every mismatch increments the attempt count;
/// once the count exceeds `settings.max_count` the wait ends as
/// [`PollOutcome::Exhausted`], otherwise it sleeps for `settings.interval` and tries
/// again. With a start count of 0 and a maximum of `n`, a predicate that never matches
/// is evaluated `n + 1` times.
pub async fn wait_for<T, F>(mut predicate: F, expected: T, settings: PollSettings) -> PollOutcome
where
    T: PartialEq,
    F: FnMut() -> T,
{
    let mut count = settings.start_count;
    let mut evaluations = 0;

    loop {
        evaluations += 1;
        if predicate() == expected {
            trace!(evaluations, "Poll satisfied");
            return PollOutcome::Satisfied { evaluations };
        }

        // Same as incrementing and comparing with `>`, without overflowing at u32::MAX
        if count >= settings.max_count {
            trace!(evaluations, "Poll budget exhausted");
            return PollOutcome::Exhausted { evaluations };
        }
        count += 1;

        tokio::time::sleep(settings.interval).await;
    }
}

/// Run [`wait_for`] on a new task and hand the outcome to `on_done`.
///
/// `on_done` runs exactly once, whichever way the wait ends. Aborting the returned
/// handle before completion skips it.
pub fn spawn_wait_for<T, F, C>(
    predicate: F,
    expected: T,
    settings: PollSettings,
    on_done: C,
) -> JoinHandle<()>
where
    T: PartialEq + Send + 'static,
    F: FnMut() -> T + Send + 'static,
    C: FnOnce(PollOutcome) + Send + 'static,
{
    tokio::spawn(async move {
        let outcome = wait_for(predicate, expected, settings).await;
        on_done(outcome);
    })
}
