//! The verdict a [`crate::rule::RetryRule`] reaches for one attempt.

use std::sync::Arc;

use crate::backoff::Backoff;

/// A retry permit: how much of a limiter's budget this decision consumes
/// (positive) or refunds (negative), in `[-1.0, 1.0]`. `0.0` means "don't
/// touch the limiter's budget at all" (used by rules that have no opinion
/// on throttling, as opposed to rules that explicitly refund a token on
/// success).
pub type Permit = f64;

/// Clamp a caller-supplied permit into the valid range, per
/// [`crate::limiter::RetryLimiter`]'s contract.
pub fn clamp_permit(permit: Permit) -> Permit {
    permit.clamp(-1.0, 1.0)
}

/// The outcome of evaluating a [`crate::rule::RetryRule`] against one
/// attempt's outcome.
#[derive(Clone)]
pub enum RetryDecision {
    /// Retry, after the given backoff's delay for this attempt number,
    /// consuming (or refunding) `permit` from the retry limiter.
    Retry { backoff: Arc<dyn Backoff>, permit: Permit },

    /// Stop retrying and surface this outcome to the caller, adjusting the
    /// limiter by `permit` (e.g. a successful response refunds a token).
    NoRetry { permit: Permit },

    /// This rule has no opinion; fall through to the next rule in an
    /// `or_else` chain. Evaluating `Next` at the end of a chain is
    /// equivalent to `NoRetry { permit: 0.0 }`.
    Next,
}

impl RetryDecision {
    pub fn retry(backoff: Arc<dyn Backoff>, permit: Permit) -> Self {
        RetryDecision::Retry {
            backoff,
            permit: clamp_permit(permit),
        }
    }

    pub fn no_retry(permit: Permit) -> Self {
        RetryDecision::NoRetry {
            permit: clamp_permit(permit),
        }
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }

    /// Resolves a chain's terminal `Next` into a concrete `NoRetry { permit: 0.0 }`.
    pub fn resolve_next(self) -> Self {
        match self {
            RetryDecision::Next => RetryDecision::no_retry(0.0),
            other => other,
        }
    }
}

impl std::fmt::Debug for RetryDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryDecision::Retry { permit, .. } => {
                f.debug_struct("Retry").field("permit", permit).finish()
            }
            RetryDecision::NoRetry { permit } => {
                f.debug_struct("NoRetry").field("permit", permit).finish()
            }
            RetryDecision::Next => write!(f, "Next"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permit_clamps_to_contract_range() {
        assert_eq!(clamp_permit(5.0), 1.0);
        assert_eq!(clamp_permit(-5.0), -1.0);
        assert_eq!(clamp_permit(0.3), 0.3);
    }

    #[test]
    fn resolve_next_becomes_neutral_no_retry() {
        let resolved = RetryDecision::Next.resolve_next();
        assert!(matches!(
            resolved,
            RetryDecision::NoRetry { permit } if permit == 0.0
        ));
    }
}
