//! Convergence loop primitives.
//!
//! Helpers for loops that wait for a remote system to reach a desired state
//! while it is still settling. Key concepts:
//!
//! - **Step**: one observation of the remote system, classified by the caller
//!   as ready, not ready yet, or permanently wrong.
//! - **Interval**: the pause between two observations.
//! - **Budget**: the outer wall-clock limit, independent of the interval.
//!
//! # Invariants
//!
//! - Every loop terminates: either a step is ready, a step aborts, or the
//!   budget is spent.
//! - Sleeping goes through `tokio::time`, so a paused test clock drives the
//!   loop deterministically.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default pause between observations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Polling errors.
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// The budget elapsed before any step was ready.
    #[error("{operation} did not converge within {budget:?} ({attempts} attempts)")]
    Timeout {
        operation: String,
        budget: Duration,
        attempts: u32,
    },

    /// A step reported a condition that retrying cannot change.
    #[error("{0}")]
    Aborted(E),
}

impl<E> PollError<E> {
    /// Returns true if the budget elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Classification of one observation.
#[derive(Debug)]
pub enum PollStep<T, E> {
    /// The condition holds; stop polling with this value.
    Ready(T),

    /// Not ready yet; the reason is logged and the loop continues.
    Retry(String),

    /// Permanently wrong; stop polling with this error.
    Abort(E),
}

/// When the first observation happens relative to the first pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstAttempt {
    /// Observe immediately, pause between later observations.
    Immediate,

    /// Pause one interval before every observation, including the first.
    AfterInterval,
}

/// A poll loop with a fixed interval inside an outer budget.
#[derive(Debug, Clone)]
pub struct BoundedPoll {
    /// Pause between observations.
    pub interval: Duration,

    /// Outer wall-clock budget.
    pub budget: Duration,

    /// Placement of the first observation.
    pub first_attempt: FirstAttempt,
}

impl BoundedPoll {
    /// A poll that pauses before every observation.
    pub fn after_interval(interval: Duration, budget: Duration) -> Self {
        Self {
            interval,
            budget,
            first_attempt: FirstAttempt::AfterInterval,
        }
    }

    /// A poll that observes immediately and pauses between failures.
    pub fn immediate(interval: Duration, budget: Duration) -> Self {
        Self {
            interval,
            budget,
            first_attempt: FirstAttempt::Immediate,
        }
    }

    /// Run the loop until `step` is ready, aborts, or the budget is spent.
    ///
    /// `step` receives the 1-based attempt number. Each observation is
    /// bounded by the remaining budget; one still pending when the budget
    /// runs out ends the loop with a timeout.
    pub async fn run<F, Fut, T, E>(&self, operation: &str, mut step: F) -> Result<T, PollError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = PollStep<T, E>>,
    {
        let start = Instant::now();
        let mut attempt = 0u32;

        loop {
            if attempt > 0 || self.first_attempt == FirstAttempt::AfterInterval {
                tokio::time::sleep(self.interval).await;
            }
            attempt += 1;

            let remaining = self.budget.saturating_sub(start.elapsed());
            let observed = match tokio::time::timeout(remaining, step(attempt)).await {
                Ok(observed) => observed,
                Err(_) => {
                    warn!(operation, attempt, "Observation still pending when the budget ran out");
                    return Err(self.timeout(operation, attempt));
                }
            };

            match observed {
                PollStep::Ready(value) => {
                    debug!(
                        operation,
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Condition reached"
                    );
                    return Ok(value);
                }
                PollStep::Abort(e) => return Err(PollError::Aborted(e)),
                PollStep::Retry(reason) => {
                    warn!(operation, attempt, reason = %reason, "Not ready, will retry");
                }
            }

            if start.elapsed() >= self.budget {
                return Err(self.timeout(operation, attempt));
            }
        }
    }

    fn timeout<E>(&self, operation: &str, attempts: u32) -> PollError<E> {
        PollError::Timeout {
            operation: operation.to_string(),
            budget: self.budget,
            attempts,
        }
    }
}

/// Retry a whole operation a fixed number of times with a pause in between.
#[derive(Debug, Clone)]
pub struct FixedRetry {
    /// Total attempts, including the first; at least one.
    attempts: u32,

    /// Pause after each failed attempt.
    pause: Duration,
}

impl FixedRetry {
    /// Create a new fixed retry policy.
    pub fn new(attempts: u32, pause: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            pause,
        }
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// Returns the last error when every attempt fails.
    pub async fn run<F, Fut, T, E>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let attempts_left = self.attempts.saturating_sub(attempt);
                    if attempts_left == 0 {
                        return Err(e);
                    }
                    warn!(
                        operation,
                        attempt,
                        attempts_left,
                        pause_secs = self.pause.as_secs(),
                        error = %e,
                        "Attempt failed"
                    );
                    tokio::time::sleep(self.pause).await;
                }
            }
        }
    }
}
