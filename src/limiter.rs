//! Process-wide retry throttles: concurrency-limiting and token-bucket.
//!
//! Limiters are the only state shared across logical request sequences
//! (besides the retry-config cache, see [`crate::config_cache`]) and so must
//! be safe to call from concurrently running sequences. Both built-ins use
//! atomics rather than a mutex, since contention is expected only on a
//! single counter.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::FutureExt;

use crate::attempt::AttemptContext;
use crate::decision::{Permit, RetryDecision};

/// A pluggable throttle consulted by the driver once a rule has already
/// decided to retry (see the scheduler/driver ordering note in the design
/// notes: the limiter is consulted AFTER the rule, never before).
#[async_trait]
pub trait RetryLimiter: Send + Sync {
    /// `true` iff a retry permit is currently available for this attempt.
    async fn should_retry(&self, ctx: &AttemptContext) -> bool;

    /// Applies a decision's permit value (consume on positive, refund on
    /// negative, ignore zero). A no-op for limiters that only gate on
    /// concurrency.
    fn handle_decision(&self, ctx: &AttemptContext, decision: &RetryDecision);

    /// Called once the logical sequence reaches a terminal state, so a
    /// concurrency-limiting implementation can release its permit.
    fn on_sequence_completed(&self, ctx: &AttemptContext) {
        let _ = ctx;
    }
}

/// Calls `limiter.should_retry`, swallowing panics and failing open (`true`)
/// per the fail-open contract for limiter callbacks.
pub async fn should_retry_fail_open(limiter: &dyn RetryLimiter, ctx: &AttemptContext) -> bool {
    match AssertUnwindSafe(limiter.should_retry(ctx)).catch_unwind().await {
        Ok(allowed) => allowed,
        Err(_) => true,
    }
}

/// Calls `limiter.handle_decision`, swallowing panics (treated as "no
/// decision applied").
pub fn handle_decision_fail_open(limiter: &dyn RetryLimiter, ctx: &AttemptContext, decision: &RetryDecision) {
    let _ = std::panic::catch_unwind(AssertUnwindSafe(|| limiter.handle_decision(ctx, decision)));
}

/// Holds at most `n` concurrent logical retry sequences.
///
/// `should_retry` returns `true` iff a permit is available; a returned
/// permit is released via [`ConcurrencyLimiter::release`], which callers
/// must invoke exactly once per successful `should_retry` call (the driver
/// does this from [`RetryLimiter::on_sequence_completed`]).
pub struct ConcurrencyLimiter {
    max: usize,
    in_flight: AtomicUsize,
}

impl ConcurrencyLimiter {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            max,
            in_flight: AtomicUsize::new(0),
        })
    }

    fn release(&self) {
        // Saturating: a release without a matching acquire must not wrap
        // around to usize::MAX and silently disable the limiter.
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }
}

#[async_trait]
impl RetryLimiter for ConcurrencyLimiter {
    async fn should_retry(&self, _ctx: &AttemptContext) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok()
    }

    fn handle_decision(&self, _ctx: &AttemptContext, _decision: &RetryDecision) {}

    fn on_sequence_completed(&self, _ctx: &AttemptContext) {
        self.release();
    }
}

/// Starts with `max_tokens` tokens; each retry consumes
/// `ceil(permit * tokens_per_retry)` tokens (or refunds, for negative
/// permits), clamped to `[0, max_tokens]`.
///
/// Tokens are tracked in fixed-point (milli-tokens) so the bucket can use a
/// plain atomic integer instead of a mutex around a float.
pub struct TokenBucketLimiter {
    max_tokens_milli: i64,
    tokens_per_retry: f64,
    tokens_milli: AtomicI64,
}

const MILLI: f64 = 1000.0;

impl TokenBucketLimiter {
    pub fn new(max_tokens: f64, tokens_per_retry: f64) -> Arc<Self> {
        let max_tokens_milli = (max_tokens * MILLI).round() as i64;
        Arc::new(Self {
            max_tokens_milli,
            tokens_per_retry,
            tokens_milli: AtomicI64::new(max_tokens_milli),
        })
    }

    /// Current token count, for tests and diagnostics.
    pub fn tokens(&self) -> f64 {
        self.tokens_milli.load(Ordering::Acquire) as f64 / MILLI
    }
}

#[async_trait]
impl RetryLimiter for TokenBucketLimiter {
    async fn should_retry(&self, _ctx: &AttemptContext) -> bool {
        let needed_milli = (self.tokens_per_retry * MILLI).round() as i64;
        self.tokens_milli.load(Ordering::Acquire) >= needed_milli
    }

    fn handle_decision(&self, _ctx: &AttemptContext, decision: &RetryDecision) {
        let permit: Permit = match decision {
            RetryDecision::Retry { permit, .. } => *permit,
            RetryDecision::NoRetry { permit } => *permit,
            RetryDecision::Next => return,
        };
        if permit == 0.0 {
            return;
        }
        // Positive permit consumes ceil(permit * tokens_per_retry); negative
        // refunds the same magnitude. `ceil` on the milli-token scale keeps
        // partial consumption from rounding down to zero.
        let raw = permit * self.tokens_per_retry * MILLI;
        let delta_milli = if raw >= 0.0 { raw.ceil() as i64 } else { raw.floor() as i64 };
        self.tokens_milli
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                Some((tokens - delta_milli).clamp(0, self.max_tokens_milli))
            })
            .expect("fetch_update with a total closure never fails");
    }
}
