//! `RetryConfig`: the immutable bag of settings governing one logical
//! request sequence.

use std::sync::Arc;

use crate::backoff::Backoff;
use crate::error::RetryError;
use crate::limiter::RetryLimiter;
use crate::rule::RetryRule;

/// When a per-attempt response clock starts ticking.
///
/// The mode affects only when the clock starts, not its duration — see
/// §4.8 of the design for the rationale behind each variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutMode {
    /// The clock began when the outer request was submitted and spans all
    /// retries (so later attempts see a shrinking budget).
    FromStart,
    /// The clock starts once a connection to the endpoint is acquired.
    ConnectionAcquired,
    /// The clock starts once the request headers are fully written.
    RequestSent,
    /// The clock starts at attempt submission. The default.
    #[default]
    AtSubmission,
}

/// Immutable, value-shaped configuration for one logical request's retry
/// behavior. Built via [`RetryConfig::builder`].
#[derive(Clone)]
pub struct RetryConfig {
    pub rule: Arc<dyn RetryRule>,
    pub max_total_attempts: u32,
    pub response_timeout_millis_per_attempt: Option<u64>,
    pub hedging_backoff: Option<Arc<dyn Backoff>>,
    pub retry_limiter: Option<Arc<dyn RetryLimiter>>,
    pub max_content_length: Option<usize>,
    pub use_retry_after: bool,
    pub timeout_mode: TimeoutMode,
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_total_attempts", &self.max_total_attempts)
            .field(
                "response_timeout_millis_per_attempt",
                &self.response_timeout_millis_per_attempt,
            )
            .field("hedging", &self.hedging_backoff.is_some())
            .field("retry_limiter", &self.retry_limiter.is_some())
            .field("max_content_length", &self.max_content_length)
            .field("use_retry_after", &self.use_retry_after)
            .field("timeout_mode", &self.timeout_mode)
            .finish()
    }
}

impl RetryConfig {
    pub fn builder(rule: Arc<dyn RetryRule>) -> RetryConfigBuilder {
        RetryConfigBuilder::new(rule)
    }

    /// `true` when hedging (speculative concurrent attempts) is configured.
    pub fn is_hedging(&self) -> bool {
        self.hedging_backoff.is_some()
    }
}

/// Fluent builder for [`RetryConfig`], mirroring the connection/client
/// builder pattern used elsewhere in this crate.
pub struct RetryConfigBuilder {
    rule: Arc<dyn RetryRule>,
    max_total_attempts: u32,
    response_timeout_millis_per_attempt: Option<u64>,
    hedging_backoff: Option<Arc<dyn Backoff>>,
    retry_limiter: Option<Arc<dyn RetryLimiter>>,
    max_content_length: Option<usize>,
    use_retry_after: bool,
    timeout_mode: TimeoutMode,
}

impl RetryConfigBuilder {
    fn new(rule: Arc<dyn RetryRule>) -> Self {
        Self {
            rule,
            max_total_attempts: 1,
            response_timeout_millis_per_attempt: None,
            hedging_backoff: None,
            retry_limiter: None,
            max_content_length: None,
            use_retry_after: true,
            timeout_mode: TimeoutMode::default(),
        }
    }

    pub fn max_total_attempts(mut self, n: u32) -> Self {
        self.max_total_attempts = n;
        self
    }

    pub fn response_timeout_millis_per_attempt(mut self, ms: u64) -> Self {
        self.response_timeout_millis_per_attempt = Some(ms);
        self
    }

    pub fn hedging_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.hedging_backoff = Some(backoff);
        self
    }

    pub fn retry_limiter(mut self, limiter: Arc<dyn RetryLimiter>) -> Self {
        self.retry_limiter = Some(limiter);
        self
    }

    pub fn max_content_length(mut self, bytes: usize) -> Self {
        self.max_content_length = Some(bytes);
        self
    }

    pub fn use_retry_after(mut self, enabled: bool) -> Self {
        self.use_retry_after = enabled;
        self
    }

    pub fn timeout_mode(mut self, mode: TimeoutMode) -> Self {
        self.timeout_mode = mode;
        self
    }

    pub fn build(self) -> Result<RetryConfig, RetryError> {
        if self.max_total_attempts < 1 {
            return Err(RetryError::InvalidArgument(
                "max_total_attempts must be >= 1".into(),
            ));
        }
        Ok(RetryConfig {
            rule: self.rule,
            max_total_attempts: self.max_total_attempts,
            response_timeout_millis_per_attempt: self.response_timeout_millis_per_attempt,
            hedging_backoff: self.hedging_backoff,
            retry_limiter: self.retry_limiter,
            max_content_length: self.max_content_length,
            use_retry_after: self.use_retry_after,
            timeout_mode: self.timeout_mode,
        })
    }
}
