//! Error taxonomy for the retry core.
//!
//! [`RetryError`] covers every kind of failure the scheduler and driver can
//! surface to a caller. It does not wrap transport errors in a new type —
//! those are passed through as the delegate produced them, by design, since
//! the rule evaluator (not this module) decides whether they are retryable.

use std::time::Duration;

/// Errors surfaced by the retry core itself (as opposed to the transport).
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// A backoff, spec, or rule was constructed with invalid parameters.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The per-attempt or overall response clock expired.
    #[error("response timeout after {0:?}")]
    ResponseTimeout(Duration),

    /// A sibling attempt won the hedging race, or the caller aborted.
    #[error("response cancelled: {0}")]
    Cancelled(&'static str),

    /// A [`crate::limiter::RetryLimiter`] denied further retries.
    #[error("retry limited: no permit available")]
    RetryLimited,

    /// The scheduler could not admit a task.
    #[error(transparent)]
    Scheduler(#[from] crate::scheduler::SchedulerError),

    /// The request was never sent (connection refused, pool exhausted, factory closed).
    #[error("unprocessed request: {0}")]
    Unprocessed(String),
}

impl RetryError {
    /// `true` for errors that a rule may legitimately choose to retry on.
    ///
    /// This is a coarse default used only as a fallback classification; the
    /// rule evaluator is the actual authority on retryability (see
    /// [`crate::rule`]).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RetryError::Unprocessed(_) | RetryError::ResponseTimeout(_)
        )
    }
}
