//! Shared types describing one physical dispatch of a logical request.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

/// A type-erased transport/application error, as produced by a delegate.
///
/// The rule evaluator unwraps one layer of "completion"/"execution" wrapper
/// around a cause before matching `instance_of` predicates against it; see
/// [`crate::rule::predicate::unwrap_cause`].
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// Per-attempt context visible to rules, limiters, and the scheduler.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// 1-based attempt number; 1 is the original, never-retried dispatch.
    pub attempt_no: u32,
    /// The request method, fixed for the whole logical request.
    pub method: Method,
    /// Endpoint this attempt was dispatched to (opaque to the retry core).
    pub endpoint: String,
    /// When this attempt was started, used for per-attempt timeout clocks.
    pub started_at: Instant,
}

impl AttemptContext {
    pub fn new(attempt_no: u32, method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            attempt_no,
            method,
            endpoint: endpoint.into(),
            started_at: Instant::now(),
        }
    }

    /// The value of the `x-retry-count` header for this attempt, if any.
    ///
    /// Absent (`None`) for attempt 1; `attempt_no - 1` otherwise.
    pub fn retry_count_header(&self) -> Option<u32> {
        (self.attempt_no > 1).then_some(self.attempt_no - 1)
    }
}

/// The observed outcome of one attempt, as handed to the rule evaluator.
///
/// Exactly one of `cause` or a successful response (`status` + headers) is
/// meaningful at a time; `unprocessed` marks the case where the request was
/// never sent at all, so headers/trailers/content/status are all absent.
#[derive(Clone, Default)]
pub struct AttemptOutcome {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub trailers: HeaderMap,
    /// Aggregated response body, populated only when a content-aware rule
    /// requested it; absent otherwise to avoid needlessly buffering bodies.
    pub content: Option<Bytes>,
    pub cause: Option<Cause>,
    /// `true` iff the request was never sent (connection refused, pool
    /// exhausted, client factory closed).
    pub unprocessed: bool,
}

impl fmt::Debug for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptOutcome")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("trailers", &self.trailers)
            .field("content_len", &self.content.as_ref().map(|c| c.len()))
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .field("unprocessed", &self.unprocessed)
            .finish()
    }
}

impl AttemptOutcome {
    pub fn success(status: StatusCode, headers: HeaderMap, trailers: HeaderMap) -> Self {
        Self {
            status: Some(status),
            headers,
            trailers,
            content: None,
            cause: None,
            unprocessed: false,
        }
    }

    pub fn failure(cause: Cause) -> Self {
        Self {
            cause: Some(cause),
            ..Default::default()
        }
    }

    pub fn unprocessed(cause: Cause) -> Self {
        Self {
            cause: Some(cause),
            unprocessed: true,
            ..Default::default()
        }
    }

    pub fn with_content(mut self, content: Bytes) -> Self {
        self.content = Some(content);
        self
    }
}

/// One line of the per-attempt observable log required by the external
/// interfaces: attempt number, endpoint, timings, headers/trailers, and
/// the terminal cause if any.
#[derive(Debug, Clone)]
pub struct AttemptLog {
    pub attempt_no: u32,
    pub endpoint: String,
    pub started_at: Instant,
    pub completed_at: Option<Instant>,
    pub status: Option<StatusCode>,
    pub response_headers: Option<HeaderMap>,
    pub response_trailers: Option<HeaderMap>,
    pub cause: Option<String>,
}

impl AttemptLog {
    pub fn start(ctx: &AttemptContext) -> Self {
        Self {
            attempt_no: ctx.attempt_no,
            endpoint: ctx.endpoint.clone(),
            started_at: ctx.started_at,
            completed_at: None,
            status: None,
            response_headers: None,
            response_trailers: None,
            cause: None,
        }
    }

    pub fn complete(&mut self, outcome: &AttemptOutcome) {
        self.completed_at = Some(Instant::now());
        self.status = outcome.status;
        self.response_headers = Some(outcome.headers.clone());
        self.response_trailers = Some(outcome.trailers.clone());
        self.cause = outcome.cause.as_ref().map(|c| c.to_string());
    }
}
