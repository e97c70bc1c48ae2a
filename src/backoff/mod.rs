//! Backoff policies: pure functions from attempt number to delay.
//!
//! A [`Backoff`] maps a 1-based attempt number to a delay in milliseconds, or
//! signals "stop retrying" by returning `-1`. Implementations are immutable;
//! the only state they may carry is a thread-safe random generator, kept
//! entirely internal to [`Random`] and [`Jittered`].
//!
//! Wrapper variants ([`Backoff::with_jitter`], [`Backoff::with_max_attempts`])
//! form a singly linked chain rather than a class hierarchy — see
//! [`Backoff::unwrap`].

pub mod spec;

use std::fmt;
use std::sync::{Arc, Mutex};

use rand::Rng;
use rand::rngs::StdRng;

use crate::error::RetryError;

/// Sentinel returned by [`Backoff::next_delay_millis`] meaning "stop retrying".
pub const STOP: i64 = -1;

/// A delay policy: attempt number (>= 1) to delay in milliseconds, or [`STOP`].
///
/// All arithmetic is signed 64-bit milliseconds. Implementations must either
/// be pure functions of `attempt`, or draw only from their own internal rng —
/// never from process-global state, so that tests can inject a seeded
/// generator and get a reproducible sequence.
pub trait Backoff: fmt::Debug + Send + Sync {
    /// Delay for this attempt, or [`STOP`] if no more retries should happen.
    ///
    /// `attempt` is 1-based: the value passed for the first *retry* (i.e.
    /// after the original, failed attempt 1) is `1`.
    fn next_delay_millis(&self, attempt: u32) -> i64;

    /// Returns the inner backoff of a wrapper (jitter, max-attempts), or
    /// `self` if this is not a wrapper.
    fn unwrap(self: Arc<Self>) -> Arc<dyn Backoff>
    where
        Self: Sized + 'static,
    {
        self
    }
}

pub(crate) fn require(cond: bool, msg: impl Into<String>) -> Result<(), RetryError> {
    if cond {
        Ok(())
    } else {
        Err(RetryError::InvalidArgument(msg.into()))
    }
}

/// Always `0` — retry immediately, no delay.
#[derive(Debug, Clone, Copy)]
pub struct WithoutDelay;

impl Backoff for WithoutDelay {
    fn next_delay_millis(&self, _attempt: u32) -> i64 {
        0
    }
}

/// Always the same delay.
#[derive(Debug, Clone, Copy)]
pub struct Fixed {
    delay_millis: i64,
}

impl Fixed {
    pub fn new(delay_millis: i64) -> Result<Self, RetryError> {
        require(delay_millis >= 0, "fixed delay must be >= 0")?;
        Ok(Self { delay_millis })
    }
}

impl Backoff for Fixed {
    fn next_delay_millis(&self, _attempt: u32) -> i64 {
        self.delay_millis
    }
}

/// `min(max, initial * multiplier^(n-1))`, saturating on overflow.
#[derive(Debug, Clone, Copy)]
pub struct Exponential {
    initial_millis: i64,
    max_millis: i64,
    multiplier: f64,
}

impl Exponential {
    pub fn new(initial_millis: i64, max_millis: i64, multiplier: f64) -> Result<Self, RetryError> {
        require(initial_millis >= 0, "initial delay must be >= 0")?;
        require(max_millis > 0, "max delay must be > 0")?;
        require(initial_millis <= max_millis, "initial delay must be <= max")?;
        require(multiplier >= 1.0, "multiplier must be >= 1.0")?;
        Ok(Self {
            initial_millis,
            max_millis,
            multiplier,
        })
    }
}

impl Backoff for Exponential {
    fn next_delay_millis(&self, attempt: u32) -> i64 {
        // f64 saturates to infinity rather than panicking on overflow, and
        // `as i64` saturates f64::INFINITY to i64::MAX, so the cast below
        // never oscillates back down once it has reached `max_millis`.
        let power = self.multiplier.powi((attempt.saturating_sub(1)) as i32);
        let scaled = self.initial_millis as f64 * power;
        if !scaled.is_finite() || scaled > self.max_millis as f64 {
            self.max_millis
        } else {
            scaled as i64
        }
    }
}

/// `min(max, initial * fib(n))` where `fib(1) = fib(2) = 1`.
#[derive(Debug, Clone, Copy)]
pub struct Fibonacci {
    initial_millis: i64,
    max_millis: i64,
}

impl Fibonacci {
    pub fn new(initial_millis: i64, max_millis: i64) -> Result<Self, RetryError> {
        require(initial_millis >= 0, "initial delay must be >= 0")?;
        require(max_millis > 0, "max delay must be > 0")?;
        require(initial_millis <= max_millis, "initial delay must be <= max")?;
        Ok(Self {
            initial_millis,
            max_millis,
        })
    }

    fn fib(n: u32) -> u64 {
        let (mut a, mut b) = (1u64, 1u64);
        for _ in 1..n {
            let next = a.saturating_add(b);
            a = b;
            b = next;
        }
        a
    }
}

impl Backoff for Fibonacci {
    fn next_delay_millis(&self, attempt: u32) -> i64 {
        let fib = Self::fib(attempt.max(1));
        let scaled = (self.initial_millis as u128).saturating_mul(fib as u128);
        scaled.min(self.max_millis as u128) as i64
    }
}

/// Uniform in `[min, max]`, independent of the attempt number.
pub struct Random {
    min_millis: i64,
    max_millis: i64,
    rng: Mutex<StdRng>,
}

impl fmt::Debug for Random {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Random")
            .field("min_millis", &self.min_millis)
            .field("max_millis", &self.max_millis)
            .finish()
    }
}

impl Random {
    pub fn new(min_millis: i64, max_millis: i64, rng: StdRng) -> Result<Self, RetryError> {
        require(min_millis >= 0, "min delay must be >= 0")?;
        require(max_millis >= min_millis, "max delay must be >= min")?;
        Ok(Self {
            min_millis,
            max_millis,
            rng: Mutex::new(rng),
        })
    }
}

impl Backoff for Random {
    fn next_delay_millis(&self, _attempt: u32) -> i64 {
        if self.max_millis == self.min_millis {
            return self.min_millis;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        rng.random_range(self.min_millis..=self.max_millis)
    }
}

/// Wraps an inner backoff, multiplying its output by `1 + u` for `u` uniform
/// in `[min_rate, max_rate]`.
pub struct Jittered {
    inner: Arc<dyn Backoff>,
    min_rate: f64,
    max_rate: f64,
    rng: Mutex<StdRng>,
}

impl fmt::Debug for Jittered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Jittered")
            .field("inner", &self.inner)
            .field("min_rate", &self.min_rate)
            .field("max_rate", &self.max_rate)
            .finish()
    }
}

impl Jittered {
    pub fn new(
        inner: Arc<dyn Backoff>,
        min_rate: f64,
        max_rate: f64,
        rng: StdRng,
    ) -> Result<Self, RetryError> {
        require(min_rate >= -1.0, "jitter min_rate must be >= -1")?;
        require(max_rate <= 1.0, "jitter max_rate must be <= 1")?;
        require(min_rate <= max_rate, "jitter min_rate must be <= max_rate")?;
        Ok(Self {
            inner,
            min_rate,
            max_rate,
            rng: Mutex::new(rng),
        })
    }
}

impl Backoff for Jittered {
    fn next_delay_millis(&self, attempt: u32) -> i64 {
        let base = self.inner.next_delay_millis(attempt);
        if base == STOP {
            return STOP;
        }
        let u = if self.max_rate == self.min_rate {
            self.min_rate
        } else {
            let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
            rng.random_range(self.min_rate..=self.max_rate)
        };
        let jittered = base as f64 * (1.0 + u);
        jittered.max(0.0).min(i64::MAX as f64) as i64
    }

    fn unwrap(self: Arc<Self>) -> Arc<dyn Backoff>
    where
        Self: Sized + 'static,
    {
        self.inner.clone()
    }
}

/// Wraps an inner backoff, returning [`STOP`] once `attempt >= cap`.
#[derive(Debug)]
pub struct MaxAttempts {
    inner: Arc<dyn Backoff>,
    cap: u32,
}

impl MaxAttempts {
    pub fn new(inner: Arc<dyn Backoff>, cap: u32) -> Result<Self, RetryError> {
        require(cap >= 1, "max attempts must be >= 1")?;
        Ok(Self { inner, cap })
    }
}

impl Backoff for MaxAttempts {
    fn next_delay_millis(&self, attempt: u32) -> i64 {
        if attempt >= self.cap {
            STOP
        } else {
            self.inner.next_delay_millis(attempt)
        }
    }

    fn unwrap(self: Arc<Self>) -> Arc<dyn Backoff>
    where
        Self: Sized + 'static,
    {
        self.inner.clone()
    }
}

/// Default options used when a builder terminator or spec grammar omits them.
pub mod defaults {
    /// `exponential=200:10000:2.0`
    pub const EXPONENTIAL_INITIAL_MILLIS: i64 = 200;
    pub const EXPONENTIAL_MAX_MILLIS: i64 = 10_000;
    pub const EXPONENTIAL_MULTIPLIER: f64 = 2.0;

    /// `jitter=-0.2:0.2`
    pub const JITTER_MIN_RATE: f64 = -0.2;
    pub const JITTER_MAX_RATE: f64 = 0.2;
}

/// Builds the default backoff (`exponential=200:10000:2.0`).
pub fn default_backoff() -> Arc<dyn Backoff> {
    Arc::new(
        Exponential::new(
            defaults::EXPONENTIAL_INITIAL_MILLIS,
            defaults::EXPONENTIAL_MAX_MILLIS,
            defaults::EXPONENTIAL_MULTIPLIER,
        )
        .expect("default exponential backoff parameters are always valid"),
    )
}

/// Extension methods for composing backoffs, mirroring the wrapper
/// constructors named in the spec (`with_jitter`, `with_max_attempts`).
pub trait BackoffExt: Backoff {
    fn with_jitter(
        self: Arc<Self>,
        min_rate: f64,
        max_rate: f64,
        rng: StdRng,
    ) -> Result<Arc<dyn Backoff>, RetryError>
    where
        Self: Sized + 'static,
    {
        Ok(Arc::new(Jittered::new(self, min_rate, max_rate, rng)?))
    }

    fn with_max_attempts(self: Arc<Self>, cap: u32) -> Result<Arc<dyn Backoff>, RetryError>
    where
        Self: Sized + 'static,
    {
        Ok(Arc::new(MaxAttempts::new(self, cap)?))
    }
}

impl<T: Backoff + ?Sized> BackoffExt for T {}
