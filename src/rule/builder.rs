//! Builds atomic rules as conjunctions of optional predicates.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderName, HeaderValue, Method, StatusCode};

use crate::attempt::{AttemptContext, AttemptOutcome};
use crate::backoff::{self, Backoff};
use crate::decision::{Permit, RetryDecision};
use crate::error::RetryError;

use super::RetryRule;
use super::predicate::{ContentPredicate, ExceptionPredicate, HeaderPredicate, StatusPredicate, TrailerPredicate, idempotent_methods};

enum Terminator {
    Backoff(Arc<dyn Backoff>, Permit),
    NoRetry(Permit),
    Custom(Arc<dyn Fn(&AttemptContext, &AttemptOutcome) -> RetryDecision + Send + Sync>),
}

/// Builds one atomic rule: a conjunction of optional predicates plus a
/// terminator decision emitted when every configured predicate matches.
///
/// If no predicate is configured at all, [`RetryRuleBuilder::build`] fails
/// with `InvalidArgument("should set at least one rule")` — an
/// unconditional rule is almost always a configuration mistake.
#[derive(Default)]
pub struct RetryRuleBuilder {
    methods: Option<HashSet<Method>>,
    status: Option<StatusPredicate>,
    trailer: Option<TrailerPredicate>,
    exception: Option<ExceptionPredicate>,
    unprocessed: Option<bool>,
    content: Option<ContentPredicate>,
    headers: Option<HeaderPredicate>,
    terminator: Option<Terminator>,
}

impl RetryRuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = Some(methods.into_iter().collect());
        self
    }

    /// Shortcut for the traditionally "safe to retry" method set.
    pub fn on_idempotent_methods(self) -> Self {
        self.on_methods(idempotent_methods())
    }

    pub fn on_status(mut self, status: StatusCode) -> Self {
        self.status = Some(StatusPredicate::Exact(status));
        self
    }

    /// `hundreds` in `1..=5`, e.g. `5` matches every 5xx status.
    pub fn on_status_class(mut self, hundreds: u16) -> Self {
        self.status = Some(StatusPredicate::Class(hundreds));
        self
    }

    pub fn on_status_matching(mut self, f: impl Fn(StatusCode) -> bool + Send + Sync + 'static) -> Self {
        self.status = Some(StatusPredicate::Custom(Arc::new(f)));
        self
    }

    pub fn on_trailer_present(mut self, name: HeaderName) -> Self {
        self.trailer = Some(TrailerPredicate::HasKey(name));
        self
    }

    pub fn on_trailer_equals(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.trailer = Some(TrailerPredicate::Equals(name, value));
        self
    }

    pub fn on_trailer_matching(mut self, f: impl Fn(&http::HeaderMap) -> bool + Send + Sync + 'static) -> Self {
        self.trailer = Some(TrailerPredicate::Custom(Arc::new(f)));
        self
    }

    pub fn on_exception(mut self, f: fn(&(dyn std::error::Error + Send + Sync)) -> bool) -> Self {
        self.exception = Some(ExceptionPredicate::InstanceOf(f));
        self
    }

    pub fn on_exception_matching(
        mut self,
        f: impl Fn(&crate::attempt::Cause) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.exception = Some(ExceptionPredicate::Custom(Arc::new(f)));
        self
    }

    /// Shortcut covering the common "retry on any transport-level failure
    /// that is not an application response" case.
    pub fn on_transport_error(self) -> Self {
        self.on_exception_matching(|_cause| true)
    }

    pub fn on_unprocessed_request(mut self) -> Self {
        self.unprocessed = Some(true);
        self
    }

    pub fn on_content(mut self, f: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        self.content = Some(ContentPredicate { f: Arc::new(f) });
        self
    }

    pub fn on_header_present(mut self, name: HeaderName) -> Self {
        self.headers = Some(HeaderPredicate::HasKey(name));
        self
    }

    pub fn on_header_equals(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers = Some(HeaderPredicate::Equals(name, value));
        self
    }

    pub fn then_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.terminator = Some(Terminator::Backoff(backoff, 0.0));
        self
    }

    /// Retry with [`backoff::default_backoff`] if no terminator is chosen.
    pub fn then_default_backoff(mut self) -> Self {
        self.terminator = Some(Terminator::Backoff(backoff::default_backoff(), 0.0));
        self
    }

    pub fn then_backoff_with_permit(mut self, backoff: Arc<dyn Backoff>, permit: Permit) -> Self {
        self.terminator = Some(Terminator::Backoff(backoff, permit));
        self
    }

    pub fn then_no_retry(mut self) -> Self {
        self.terminator = Some(Terminator::NoRetry(0.0));
        self
    }

    pub fn then_no_retry_with_permit(mut self, permit: Permit) -> Self {
        self.terminator = Some(Terminator::NoRetry(permit));
        self
    }

    pub fn then_custom(
        mut self,
        f: impl Fn(&AttemptContext, &AttemptOutcome) -> RetryDecision + Send + Sync + 'static,
    ) -> Self {
        self.terminator = Some(Terminator::Custom(Arc::new(f)));
        self
    }

    pub fn build(self) -> Result<Arc<dyn RetryRule>, RetryError> {
        if self.methods.is_none()
            && self.status.is_none()
            && self.trailer.is_none()
            && self.exception.is_none()
            && self.unprocessed.is_none()
            && self.content.is_none()
            && self.headers.is_none()
        {
            return Err(RetryError::InvalidArgument(
                "should set at least one rule".into(),
            ));
        }
        let terminator = self
            .terminator
            .unwrap_or_else(|| Terminator::Backoff(backoff::default_backoff(), 0.0));
        Ok(Arc::new(AtomicRule {
            methods: self.methods,
            status: self.status,
            trailer: self.trailer,
            exception: self.exception,
            unprocessed: self.unprocessed,
            content: self.content,
            headers: self.headers,
            terminator,
        }))
    }
}

struct AtomicRule {
    methods: Option<HashSet<Method>>,
    status: Option<StatusPredicate>,
    trailer: Option<TrailerPredicate>,
    exception: Option<ExceptionPredicate>,
    unprocessed: Option<bool>,
    content: Option<ContentPredicate>,
    headers: Option<HeaderPredicate>,
    terminator: Terminator,
}

impl AtomicRule {
    fn matches(&self, ctx: &AttemptContext, outcome: &AttemptOutcome) -> bool {
        if let Some(methods) = &self.methods {
            if !methods.contains(&ctx.method) {
                return false;
            }
        }
        if let Some(status_pred) = &self.status {
            match outcome.status {
                Some(status) if status_pred.matches(status) => {}
                _ => return false,
            }
        }
        if let Some(trailer_pred) = &self.trailer {
            if !trailer_pred.matches(&outcome.trailers) {
                return false;
            }
        }
        if let Some(exception_pred) = &self.exception {
            match &outcome.cause {
                Some(cause) if exception_pred.matches(cause) => {}
                _ => return false,
            }
        }
        if let Some(expected_unprocessed) = self.unprocessed {
            if outcome.unprocessed != expected_unprocessed {
                return false;
            }
        }
        if let Some(content_pred) = &self.content {
            if !content_pred.matches(outcome) {
                return false;
            }
        }
        if let Some(header_pred) = &self.headers {
            if !header_pred.matches(&outcome.headers) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl RetryRule for AtomicRule {
    async fn should_retry(&self, ctx: &AttemptContext, outcome: &AttemptOutcome) -> RetryDecision {
        if !self.matches(ctx, outcome) {
            return RetryDecision::Next;
        }
        match &self.terminator {
            Terminator::Backoff(backoff, permit) => RetryDecision::retry(backoff.clone(), *permit),
            Terminator::NoRetry(permit) => RetryDecision::no_retry(*permit),
            Terminator::Custom(f) => f(ctx, outcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::AttemptOutcome;
    use http::{HeaderMap, Method, StatusCode};

    fn ctx_with_method(method: Method) -> AttemptContext {
        AttemptContext::new(1, method, "svc")
    }

    #[tokio::test]
    async fn empty_builder_fails_construction() {
        let err = RetryRuleBuilder::new().build().unwrap_err();
        assert!(matches!(err, RetryError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn matches_only_configured_predicates() {
        let rule = RetryRuleBuilder::new()
            .on_status_class(5)
            .on_idempotent_methods()
            .then_default_backoff()
            .build()
            .unwrap();

        let ctx = ctx_with_method(Method::GET);
        let outcome = AttemptOutcome::success(StatusCode::BAD_GATEWAY, HeaderMap::new(), HeaderMap::new());
        let decision = rule.should_retry(&ctx, &outcome).await;
        assert!(decision.is_retry());

        let post_ctx = ctx_with_method(Method::POST);
        let decision = rule.should_retry(&post_ctx, &outcome).await;
        assert!(matches!(decision, RetryDecision::Next));
    }

    #[tokio::test]
    async fn unmatched_predicate_falls_through_to_next() {
        let rule = RetryRuleBuilder::new()
            .on_status(StatusCode::TOO_MANY_REQUESTS)
            .then_no_retry()
            .build()
            .unwrap();
        let ctx = ctx_with_method(Method::GET);
        let outcome = AttemptOutcome::success(StatusCode::OK, HeaderMap::new(), HeaderMap::new());
        let decision = rule.should_retry(&ctx, &outcome).await;
        assert!(matches!(decision, RetryDecision::Next));
    }

    #[tokio::test]
    async fn default_terminator_is_default_backoff() {
        let rule = RetryRuleBuilder::new()
            .on_status(StatusCode::SERVICE_UNAVAILABLE)
            .build()
            .unwrap();
        let ctx = ctx_with_method(Method::GET);
        let outcome =
            AttemptOutcome::success(StatusCode::SERVICE_UNAVAILABLE, HeaderMap::new(), HeaderMap::new());
        let decision = rule.should_retry(&ctx, &outcome).await;
        assert!(decision.is_retry());
    }
}
