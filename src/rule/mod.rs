//! Retry rule evaluation: a DSL over per-attempt outcomes producing a
//! [`RetryDecision`].
//!
//! A rule is either atomic (built by [`RetryRuleBuilder`]) or a composition
//! `a.or_else(b)`: evaluate `a`; if it yields [`RetryDecision::Next`],
//! evaluate `b`; otherwise `a`'s decision wins. Rules are async because
//! content-aware rules must wait for body aggregation.

pub mod builder;
pub mod predicate;

use std::sync::Arc;

use async_trait::async_trait;

use crate::attempt::{AttemptContext, AttemptOutcome};
use crate::decision::RetryDecision;

pub use builder::RetryRuleBuilder;

/// `(ctx, outcome) -> async Decision`, composed with [`RetryRuleExt::or_else`].
#[async_trait]
pub trait RetryRule: Send + Sync {
    async fn should_retry(&self, ctx: &AttemptContext, outcome: &AttemptOutcome) -> RetryDecision;
}

#[async_trait]
impl RetryRule for Arc<dyn RetryRule> {
    async fn should_retry(&self, ctx: &AttemptContext, outcome: &AttemptOutcome) -> RetryDecision {
        (**self).should_retry(ctx, outcome).await
    }
}

/// `a.or_else(b)`: evaluate `a`, falling through to `b` on `Next`.
///
/// Declaration order is preserved — `a` is always evaluated first.
pub struct OrElse {
    first: Arc<dyn RetryRule>,
    second: Arc<dyn RetryRule>,
}

#[async_trait]
impl RetryRule for OrElse {
    async fn should_retry(&self, ctx: &AttemptContext, outcome: &AttemptOutcome) -> RetryDecision {
        match self.first.should_retry(ctx, outcome).await {
            RetryDecision::Next => self.second.should_retry(ctx, outcome).await,
            decision => decision,
        }
    }
}

/// Extension trait providing the `or_else` combinator on any `Arc<dyn RetryRule>`.
pub trait RetryRuleExt {
    fn or_else(self, next: Arc<dyn RetryRule>) -> Arc<dyn RetryRule>;
}

impl RetryRuleExt for Arc<dyn RetryRule> {
    fn or_else(self, next: Arc<dyn RetryRule>) -> Arc<dyn RetryRule> {
        Arc::new(OrElse {
            first: self,
            second: next,
        })
    }
}

/// A rule that never retries; useful as the terminal link of a chain so the
/// whole composition always reaches `NoRetry` rather than `Next`.
pub struct NeverRetry;

#[async_trait]
impl RetryRule for NeverRetry {
    async fn should_retry(&self, _ctx: &AttemptContext, _outcome: &AttemptOutcome) -> RetryDecision {
        RetryDecision::no_retry(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Fixed;
    use http::Method;

    struct Always(RetryDecision);

    #[async_trait]
    impl RetryRule for Always {
        async fn should_retry(&self, _ctx: &AttemptContext, _outcome: &AttemptOutcome) -> RetryDecision {
            self.0.clone()
        }
    }

    fn ctx() -> AttemptContext {
        AttemptContext::new(1, Method::GET, "svc")
    }

    #[tokio::test]
    async fn or_else_short_circuits_on_non_next() {
        let a: Arc<dyn RetryRule> = Arc::new(Always(RetryDecision::no_retry(0.0)));
        let b: Arc<dyn RetryRule> = Arc::new(Always(RetryDecision::retry(Arc::new(Fixed::new(10).unwrap()), 0.0)));
        let composed = a.or_else(b);
        let decision = composed.should_retry(&ctx(), &AttemptOutcome::default()).await;
        assert!(!decision.is_retry());
    }

    #[tokio::test]
    async fn or_else_falls_through_on_next() {
        let a: Arc<dyn RetryRule> = Arc::new(Always(RetryDecision::Next));
        let b: Arc<dyn RetryRule> = Arc::new(Always(RetryDecision::retry(Arc::new(Fixed::new(10).unwrap()), 0.0)));
        let composed = a.or_else(b);
        let decision = composed.should_retry(&ctx(), &AttemptOutcome::default()).await;
        assert!(decision.is_retry());
    }

    #[tokio::test]
    async fn or_else_preserves_declaration_order() {
        // `a` decides NoRetry even though `b` would retry; `a` must win.
        let a: Arc<dyn RetryRule> = Arc::new(Always(RetryDecision::no_retry(0.0)));
        let b: Arc<dyn RetryRule> = Arc::new(Always(RetryDecision::Next));
        let composed = a.or_else(b);
        let decision = composed.should_retry(&ctx(), &AttemptOutcome::default()).await;
        assert!(matches!(decision, RetryDecision::NoRetry { .. }));
    }
}
