//! Client-side retry core for an HTTP/RPC client library.
//!
//! This crate is the machinery that turns a single logical request into a
//! bounded sequence (or concurrent fan-out) of physical attempts: deciding
//! when to retry, how long to wait, and when to give up, while preserving
//! precise ordering, cancellation, and resource guarantees. It does not
//! include an HTTP transport, endpoint selection, or wire codec — those are
//! external collaborators, invoked through the [`driver::Delegate`] trait.
//!
//! ## Components
//!
//! - [`backoff`] — delay policies: fixed, exponential, fibonacci, random,
//!   jittered, attempt-capped, and a textual [`backoff::spec::BackoffSpec`]
//!   grammar for configuration.
//! - [`decision`] — [`decision::RetryDecision`], the typed outcome a rule
//!   produces for one attempt.
//! - [`rule`] — the retry policy DSL: [`rule::RetryRule`], composed with
//!   [`rule::RetryRuleExt::or_else`], built from conjunctions of predicates
//!   via [`rule::RetryRuleBuilder`].
//! - [`limiter`] — process-wide throttles: [`limiter::ConcurrencyLimiter`]
//!   and [`limiter::TokenBucketLimiter`].
//! - [`scheduler`] — [`scheduler::RetryScheduler`], the single-threaded
//!   cooperative engine holding at most one pending retry timer.
//! - [`driver`] — [`driver::RetryDriver`], which orchestrates sequential
//!   retries and hedging on top of the components above.
//! - [`config_cache`] — [`config_cache::RetryConfigMapping`], a cache from
//!   request key to [`driver::RetryConfig`].
//!
//! ## Example: a simple retry rule
//!
//! ```ignore
//! use retry_core::rule::RetryRuleBuilder;
//! use retry_core::driver::RetryConfig;
//! use http::StatusCode;
//!
//! let rule = RetryRuleBuilder::new()
//!     .on_status_class(5)
//!     .on_idempotent_methods()
//!     .then_default_backoff()
//!     .build()?;
//!
//! let config = RetryConfig::builder(rule)
//!     .max_total_attempts(4)
//!     .build()?;
//! ```
//!
//! ## Example: backoff from a textual spec
//!
//! ```
//! use retry_core::backoff::spec::BackoffSpec;
//!
//! let spec: BackoffSpec = "exponential=1000:60000:1.2,jitter=-0.4:0.3,maxAttempts=100"
//!     .parse()
//!     .unwrap();
//! let backoff = spec.build().unwrap();
//! assert!(backoff.next_delay_millis(1) >= 0);
//! ```
//!
//! ## Concurrency model
//!
//! Each logical retry sequence is pinned to one [`scheduler::EventLoop`];
//! scheduler state mutation and decision handling happen there, which is
//! why [`scheduler::RetryScheduler`] needs no internal locking for its core
//! invariants (see its docs for the one pragmatic exception). The only
//! state shared *across* sequences is a [`limiter::RetryLimiter`] and,
//! optionally, a [`config_cache::RetryConfigMapping`] — both are built on
//! atomics/`RwLock` rather than per-sequence locks.
//!
//! ## Feature Flags
//!
//! | Feature | Description | Dependencies |
//! |---------|-------------|--------------|
//! | `tracing` | Emits spans/events for attempts, decisions, and overtakes | `tracing` |
//!
//! With `tracing` enabled, [`driver::RetryDriver`] opens a `retry_sequence`
//! span per logical request (fields: `method`, `max_attempts`) and a child
//! `attempt` span per physical dispatch (fields: `attempt_no`, `endpoint`).
//! It emits `debug`/`warn` events for: attempt timeouts, a rule evaluator
//! panicking (fail-open), a retry limiter denying further attempts, a
//! hedge timer being pulled earlier by a sibling's retry decision (the
//! hedging analogue of the scheduler's overtake), and each terminal
//! resolution of a sequential retry loop.

pub mod attempt;
pub mod backoff;
pub mod config_cache;
pub mod decision;
pub mod driver;
pub mod error;
pub mod limiter;
pub mod rule;
pub mod scheduler;

pub use attempt::{AttemptContext, AttemptLog, AttemptOutcome, Cause};
pub use backoff::{Backoff, BackoffExt};
pub use backoff::spec::BackoffSpec;
pub use config_cache::RetryConfigMapping;
pub use decision::{Permit, RetryDecision};
pub use driver::{Delegate, EndpointSelector, FixedEndpoint, Request, RetryConfig, RetryDriver, RetryOutcome, TimeoutMode};
pub use error::RetryError;
pub use limiter::{ConcurrencyLimiter, RetryLimiter, TokenBucketLimiter};
pub use rule::{RetryRule, RetryRuleBuilder, RetryRuleExt};
pub use scheduler::{EventLoop, RetryScheduler, TokioEventLoop};
