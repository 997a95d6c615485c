//! Bounded exponential backoff for broadcast requests.
//!
//! A broadcast has no reply to wait on; success is observed indirectly (enough
//! STORED acknowledgments, a collected chunk). `BackoffSchedule::run` sends,
//! sleeps, then checks a condition, doubling the delay each attempt.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Attempt budget and initial delay of a retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSchedule {
    /// Maximum number of sends (default: 5).
    pub max_attempts: u32,
    /// Delay after the first send (default: 1 second).
    pub initial: Duration,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial: Duration::from_secs(1),
        }
    }
}

/// How a retry loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The condition held after `attempts` sends.
    Satisfied {
        /// Sends made, including failed ones.
        attempts: u32,
    },
    /// The budget ran out without the condition holding.
    Exhausted {
        /// Sends made, including failed ones.
        attempts: u32,
    },
}

impl RetryOutcome {
    /// True if the loop ended because the condition held.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, RetryOutcome::Satisfied { .. })
    }

    /// Number of attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Satisfied { attempts } | RetryOutcome::Exhausted { attempts } => *attempts,
        }
    }
}

impl BackoffSchedule {
    /// Create a schedule.
    pub fn new(max_attempts: u32, initial: Duration) -> Self {
        Self {
            max_attempts,
            initial,
        }
    }

    /// Delay following the 1-based `attempt`: `initial * 2^(attempt - 1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(1 << shift)
    }

    /// Run the loop.
    ///
    /// Each attempt calls `send(attempt)`. On a successful send the loop
    /// sleeps for the attempt's delay and then evaluates `satisfied`. A
    /// failed send counts as an attempt and moves on to the next, doubled,
    /// delay without sleeping.
    pub async fn run<S, SF, C>(&self, mut send: S, mut satisfied: C) -> RetryOutcome
    where
        S: FnMut(u32) -> SF,
        SF: Future<Output = bool>,
        C: FnMut() -> bool,
    {
        for attempt in 1..=self.max_attempts {
            if !send(attempt).await {
                debug!(attempt, "send failed, backing off");
                continue;
            }
            tokio::time::sleep(self.delay_for(attempt)).await;
            if satisfied() {
                return RetryOutcome::Satisfied { attempts: attempt };
            }
        }
        RetryOutcome::Exhausted {
            attempts: self.max_attempts,
        }
    }
}
