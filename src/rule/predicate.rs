//! Individual predicates combined by [`super::RetryRuleBuilder`].

use std::collections::HashSet;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use http::{HeaderMap, Method, StatusCode};

use crate::attempt::{AttemptOutcome, Cause};

/// A wrapper error produced by async execution machinery (e.g. a join error
/// or a completion-stage failure) that hides the real cause one layer deep.
///
/// Rules that match on exception type should look through one layer of
/// this via [`unwrap_cause`], mirroring wrapper exceptions in the source
/// material (`CompletionException`, `ExecutionException`, and similar).
#[derive(Debug)]
pub struct WrappedCause {
    source: Cause,
}

impl WrappedCause {
    pub fn new(source: Cause) -> Self {
        Self { source }
    }
}

impl fmt::Display for WrappedCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wrapped: {}", self.source)
    }
}

impl StdError for WrappedCause {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.source)
    }
}

/// Strips exactly one layer of [`WrappedCause`] wrapping, if present.
pub fn unwrap_cause(cause: &Cause) -> &Cause {
    match cause.downcast_ref::<WrappedCause>() {
        Some(wrapped) => &wrapped.source,
        None => cause,
    }
}

/// HTTP methods traditionally considered safe to retry without
/// double-execution risk.
pub fn idempotent_methods() -> HashSet<Method> {
    [
        Method::GET,
        Method::HEAD,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
        Method::TRACE,
    ]
    .into_iter()
    .collect()
}

#[derive(Clone)]
pub enum StatusPredicate {
    Exact(StatusCode),
    /// Matches any status whose hundreds digit equals this value (e.g. `5`
    /// matches every 5xx).
    Class(u16),
    Custom(Arc<dyn Fn(StatusCode) -> bool + Send + Sync>),
}

impl StatusPredicate {
    pub fn matches(&self, status: StatusCode) -> bool {
        match self {
            StatusPredicate::Exact(expected) => status == *expected,
            StatusPredicate::Class(hundreds) => status.as_u16() / 100 == *hundreds,
            StatusPredicate::Custom(f) => f(status),
        }
    }
}

#[derive(Clone)]
pub enum ExceptionPredicate {
    /// Matches by concrete type, after unwrapping one layer of [`WrappedCause`].
    InstanceOf(fn(&(dyn StdError + Send + Sync)) -> bool),
    Custom(Arc<dyn Fn(&Cause) -> bool + Send + Sync>),
}

impl ExceptionPredicate {
    pub fn matches(&self, cause: &Cause) -> bool {
        let unwrapped = unwrap_cause(cause);
        match self {
            ExceptionPredicate::InstanceOf(f) => f(&**unwrapped),
            ExceptionPredicate::Custom(f) => f(unwrapped),
        }
    }
}

#[derive(Clone)]
pub enum TrailerPredicate {
    HasKey(http::HeaderName),
    Equals(http::HeaderName, http::HeaderValue),
    Custom(Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>),
}

impl TrailerPredicate {
    pub fn matches(&self, trailers: &HeaderMap) -> bool {
        match self {
            TrailerPredicate::HasKey(name) => trailers.contains_key(name),
            TrailerPredicate::Equals(name, value) => trailers.get(name) == Some(value),
            TrailerPredicate::Custom(f) => f(trailers),
        }
    }
}

#[derive(Clone)]
pub enum HeaderPredicate {
    HasKey(http::HeaderName),
    Equals(http::HeaderName, http::HeaderValue),
    Custom(Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>),
}

impl HeaderPredicate {
    pub fn matches(&self, headers: &HeaderMap) -> bool {
        match self {
            HeaderPredicate::HasKey(name) => headers.contains_key(name),
            HeaderPredicate::Equals(name, value) => headers.get(name) == Some(value),
            HeaderPredicate::Custom(f) => f(headers),
        }
    }
}

#[derive(Clone)]
pub struct ContentPredicate {
    pub f: Arc<dyn Fn(&[u8]) -> bool + Send + Sync>,
}

impl ContentPredicate {
    pub fn matches(&self, outcome: &AttemptOutcome) -> bool {
        match &outcome.content {
            Some(content) => (self.f)(content),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_class_matches_any_5xx() {
        let p = StatusPredicate::Class(5);
        assert!(p.matches(StatusCode::BAD_GATEWAY));
        assert!(p.matches(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!p.matches(StatusCode::NOT_FOUND));
    }

    #[test]
    fn unwrap_cause_strips_one_layer() {
        #[derive(Debug)]
        struct Inner;
        impl fmt::Display for Inner {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "inner")
            }
        }
        impl StdError for Inner {}

        let inner: Cause = Arc::new(Inner);
        let wrapped: Cause = Arc::new(WrappedCause::new(inner.clone()));
        let unwrapped = unwrap_cause(&wrapped);
        assert!(unwrapped.downcast_ref::<Inner>().is_some());

        // A bare cause (not wrapped) passes through unchanged.
        let bare = unwrap_cause(&inner);
        assert!(bare.downcast_ref::<Inner>().is_some());
    }

    #[test]
    fn idempotent_methods_excludes_post() {
        let set = idempotent_methods();
        assert!(set.contains(&Method::GET));
        assert!(!set.contains(&Method::POST));
    }
}
