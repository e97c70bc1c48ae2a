//! The retry driver: sequential retries, hedging, timeouts, `Retry-After`,
//! and limiter consultation.

pub mod config;
pub mod retry_after;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::FutureExt;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tokio::sync::Notify;
#[cfg(feature = "tracing")]
use tracing::{debug, info_span, warn};

pub use config::{RetryConfig, TimeoutMode};

use crate::attempt::{AttemptContext, AttemptLog, AttemptOutcome, Cause};
use crate::decision::RetryDecision;
use crate::error::RetryError;
use crate::limiter::{handle_decision_fail_open, should_retry_fail_open};
use crate::scheduler::{EventLoop, RetryScheduler, TokioEventLoop};

/// `x-retry-count`: sent on attempts >= 2, value is the 1-based retry count.
pub fn retry_count_header_name() -> HeaderName {
    HeaderName::from_static("x-retry-count")
}

/// A logical request, independent of wire encoding. Cheap to clone across
/// attempts since the body is reference-counted bytes.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new(method: Method, headers: HeaderMap, body: Option<Bytes>) -> Self {
        Self { method, headers, body }
    }

    /// Returns a clone of this request with `x-retry-count` set (or
    /// removed, for attempt 1), preserving every other header — in
    /// particular the original `host`/`authority`.
    fn for_attempt(&self, ctx: &AttemptContext) -> Self {
        let mut headers = self.headers.clone();
        match ctx.retry_count_header() {
            Some(count) => {
                headers.insert(retry_count_header_name(), HeaderValue::from(count));
            }
            None => {
                headers.remove(&retry_count_header_name());
            }
        }
        Self {
            method: self.method.clone(),
            headers,
            body: self.body.clone(),
        }
    }
}

/// The transport collaborator the driver invokes for each physical attempt.
///
/// The driver treats this as opaque: connection pooling, TLS, and protocol
/// negotiation are the transport's concern, not the retry core's.
#[async_trait]
pub trait Delegate: Send + Sync {
    async fn call(&self, ctx: AttemptContext, req: Request) -> AttemptOutcome;
}

/// Chooses the endpoint for a given attempt number. A stable mapping
/// (rather than re-balancing every attempt) preserves cache locality, per
/// the sequential-mode invariants.
pub trait EndpointSelector: Send + Sync {
    fn endpoint_for_attempt(&self, attempt_no: u32) -> String;
}

impl<F: Fn(u32) -> String + Send + Sync> EndpointSelector for F {
    fn endpoint_for_attempt(&self, attempt_no: u32) -> String {
        self(attempt_no)
    }
}

/// A single fixed endpoint for every attempt.
pub struct FixedEndpoint(pub String);

impl EndpointSelector for FixedEndpoint {
    fn endpoint_for_attempt(&self, _attempt_no: u32) -> String {
        self.0.clone()
    }
}

/// The result of running a whole logical request sequence to completion.
#[derive(Debug)]
pub struct RetryOutcome {
    pub outcome: AttemptOutcome,
    pub logs: Vec<AttemptLog>,
}

/// Orchestrates one logical request's attempts per a [`RetryConfig`].
///
/// A driver is constructed per request (its scheduler is single-use) and
/// dropped once the sequence resolves.
pub struct RetryDriver {
    config: RetryConfig,
    delegate: Arc<dyn Delegate>,
    endpoints: Arc<dyn EndpointSelector>,
    event_loop: Arc<dyn EventLoop>,
}

impl RetryDriver {
    pub fn new(config: RetryConfig, delegate: Arc<dyn Delegate>, endpoints: Arc<dyn EndpointSelector>) -> Self {
        Self {
            config,
            delegate,
            endpoints,
            event_loop: Arc::new(TokioEventLoop),
        }
    }

    #[cfg(test)]
    pub fn with_event_loop(mut self, event_loop: Arc<dyn EventLoop>) -> Self {
        self.event_loop = event_loop;
        self
    }

    pub async fn execute(&self, req: Request) -> Result<RetryOutcome, RetryError> {
        #[cfg(feature = "tracing")]
        let _span = info_span!(
            "retry_sequence",
            method = %req.method,
            max_attempts = self.config.max_total_attempts,
        )
        .entered();

        if self.config.is_hedging() {
            self.run_hedging(req).await
        } else {
            self.run_sequential(req).await
        }
    }

    /// The budget for one attempt's own response clock, per §4.8: for
    /// `FromStart` the clock is shared across the whole sequence (what
    /// remains of `overall_deadline`); every other mode gets a fresh
    /// `response_timeout_millis_per_attempt` budget each attempt.
    ///
    /// `ConnectionAcquired` and `RequestSent` are treated the same as the
    /// default `AtSubmission` here: this driver's [`Delegate`] boundary has
    /// no hook for "connection acquired" or "request sent" sub-events to
    /// start a clock from, so all three start the clock at dispatch.
    fn attempt_timeout_budget(&self, now: Instant, overall_deadline: Option<Instant>) -> Option<Duration> {
        let per_attempt_ms = self.config.response_timeout_millis_per_attempt?;
        match self.config.timeout_mode {
            TimeoutMode::FromStart => Some(overall_deadline?.saturating_duration_since(now)),
            TimeoutMode::ConnectionAcquired | TimeoutMode::RequestSent | TimeoutMode::AtSubmission => {
                Some(Duration::from_millis(per_attempt_ms))
            }
        }
    }

    async fn dispatch(
        &self,
        attempt_no: u32,
        req: &Request,
        now: Instant,
        overall_deadline: Option<Instant>,
    ) -> (AttemptContext, AttemptOutcome, AttemptLog) {
        let endpoint = self.endpoints.endpoint_for_attempt(attempt_no);
        #[cfg(feature = "tracing")]
        let _span = info_span!("attempt", attempt_no, endpoint = %endpoint).entered();

        let ctx = AttemptContext::new(attempt_no, req.method.clone(), endpoint);
        let mut log = AttemptLog::start(&ctx);
        let attempt_req = req.for_attempt(&ctx);
        let budget = self.attempt_timeout_budget(now, overall_deadline);
        let call = self.delegate.call(ctx.clone(), attempt_req);
        let outcome = match budget {
            Some(budget) => match tokio::time::timeout(budget, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    warn!(attempt_no, budget_ms = budget.as_millis() as u64, "attempt timed out");
                    AttemptOutcome::failure(Arc::new(RetryError::ResponseTimeout(budget)) as Cause)
                }
            },
            None => call.await,
        };
        log.complete(&outcome);
        (ctx, outcome, log)
    }

    async fn decide(&self, ctx: &AttemptContext, outcome: &AttemptOutcome) -> RetryDecision {
        // Errors inside the rule evaluator fail open: "rule said retry with
        // default backoff", per the error-handling design.
        match std::panic::AssertUnwindSafe(self.config.rule.should_retry(ctx, outcome))
            .catch_unwind()
            .await
        {
            Ok(decision) => decision.resolve_next(),
            Err(_) => {
                #[cfg(feature = "tracing")]
                warn!("rule evaluator panicked; failing open with default backoff");
                RetryDecision::retry(crate::backoff::default_backoff(), 0.0)
            }
        }
    }

    /// §4.6: sequential retry algorithm.
    async fn run_sequential(&self, req: Request) -> Result<RetryOutcome, RetryError> {
        let start = self.event_loop.now();
        let overall_deadline = self
            .config
            .response_timeout_millis_per_attempt
            .map(|ms| start + Duration::from_millis(ms));

        let scheduler = RetryScheduler::new(self.event_loop.clone(), overall_deadline);
        let mut logs = Vec::new();
        let mut attempt_no: u32 = 1;

        loop {
            let now = self.event_loop.now();
            let (ctx, outcome, log) = self.dispatch(attempt_no, &req, now, overall_deadline).await;
            logs.push(log);

            if attempt_no == 1 {
                if let Some(limiter) = &self.config.retry_limiter {
                    limiter.on_sequence_completed(&ctx);
                }
            }

            let decision = self.decide(&ctx, &outcome).await;

            let (backoff, permit) = match decision {
                RetryDecision::NoRetry { permit } => {
                    if let Some(limiter) = &self.config.retry_limiter {
                        handle_decision_fail_open(limiter.as_ref(), &ctx, &RetryDecision::no_retry(permit));
                    }
                    #[cfg(feature = "tracing")]
                    debug!(attempt_no, "sequence resolved: no further retry");
                    scheduler.close();
                    return Ok(RetryOutcome { outcome, logs });
                }
                RetryDecision::Retry { backoff, permit } => (backoff, permit),
                RetryDecision::Next => unreachable!("resolve_next() never returns Next"),
            };

            if attempt_no >= self.config.max_total_attempts {
                #[cfg(feature = "tracing")]
                debug!(attempt_no, "sequence resolved: max attempts reached");
                scheduler.close();
                return Ok(RetryOutcome { outcome, logs });
            }

            let backoff_delay = backoff.next_delay_millis(attempt_no);
            if backoff_delay < 0 {
                #[cfg(feature = "tracing")]
                debug!(attempt_no, "sequence resolved: backoff policy said stop");
                scheduler.close();
                return Ok(RetryOutcome { outcome, logs });
            }

            let retry_after_delay = if self.config.use_retry_after {
                retry_after::parse_retry_after(&outcome.trailers)
                    .or_else(|| retry_after::parse_retry_after(&outcome.headers))
            } else {
                None
            };
            let effective_delay = match retry_after_delay {
                Some(ra) => ra.max(Duration::from_millis(backoff_delay as u64)),
                None => Duration::from_millis(backoff_delay as u64),
            };

            if let Some(deadline) = overall_deadline {
                if self.event_loop.now() + effective_delay > deadline {
                    #[cfg(feature = "tracing")]
                    debug!(attempt_no, "sequence resolved: next attempt would exceed the deadline");
                    scheduler.close();
                    return Ok(RetryOutcome { outcome, logs });
                }
            }

            if let Some(limiter) = &self.config.retry_limiter {
                if !should_retry_fail_open(limiter.as_ref(), &ctx).await {
                    #[cfg(feature = "tracing")]
                    warn!(attempt_no, "retry limiter denied further attempts");
                    scheduler.close();
                    return Err(RetryError::RetryLimited);
                }
                handle_decision_fail_open(limiter.as_ref(), &ctx, &RetryDecision::retry(backoff.clone(), permit));
            }

            let notify = Arc::new(Notify::new());
            let notify_clone = notify.clone();
            let scheduled = scheduler
                .try_schedule(
                    Box::new(move || notify_clone.notify_one()),
                    Box::new(|_err| {}),
                    effective_delay.as_millis() as i64,
                )
                .map_err(RetryError::Scheduler)?;

            if !scheduled {
                scheduler.close();
                return Ok(RetryOutcome { outcome, logs });
            }
            notify.notified().await;

            attempt_no += 1;
        }
    }

    /// §4.7: hedging — speculative concurrent attempts, winner cancels siblings.
    ///
    /// Rather than reconstructing a full-length sleep every loop iteration
    /// (which would let every sibling completion reset the hedge interval),
    /// an absolute `next_hedge_fire_at` instant is tracked: each iteration's
    /// timer is just "sleep until that instant", and a sibling's `Retry`
    /// decision may only pull it *earlier* — mirroring the scheduler's
    /// overtake semantics ("the next attempt runs sooner") without routing
    /// hedging through `RetryScheduler` itself (see DESIGN.md).
    async fn run_hedging(&self, req: Request) -> Result<RetryOutcome, RetryError> {
        let hedging_backoff = self
            .config
            .hedging_backoff
            .clone()
            .expect("run_hedging only called when hedging_backoff is configured");

        let start = self.event_loop.now();
        let overall_deadline = self
            .config
            .response_timeout_millis_per_attempt
            .map(|ms| start + Duration::from_millis(ms));

        let mut in_flight = FuturesUnordered::new();
        let mut logs = Vec::new();
        let mut attempts_started: u32 = 0;
        let cancel_flags: Arc<std::sync::Mutex<Vec<Arc<std::sync::atomic::AtomicBool>>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));

        attempts_started += 1;
        in_flight.push(self.spawn_hedged_attempt(1, &req, &cancel_flags, overall_deadline));
        let mut next_hedge_fire_at = fire_at_from_delay(self.event_loop.now(), hedging_backoff.next_delay_millis(1));
        let mut last_outcome: Option<AttemptOutcome> = None;

        loop {
            let can_hedge_more = next_hedge_fire_at.is_some() && attempts_started < self.config.max_total_attempts;
            let hedge_timer = match (can_hedge_more, next_hedge_fire_at) {
                (true, Some(fire_at)) => {
                    let now = self.event_loop.now();
                    tokio::time::sleep(fire_at.saturating_duration_since(now)).boxed()
                }
                _ => futures::future::pending::<()>().boxed(),
            };

            if in_flight.is_empty() && !can_hedge_more {
                return match last_outcome {
                    Some(outcome) => Ok(RetryOutcome { outcome, logs }),
                    None => Err(RetryError::Cancelled("all hedged attempts exhausted")),
                };
            }

            tokio::select! {
                biased;

                next = in_flight.next(), if !in_flight.is_empty() => {
                    let (ctx, outcome, log) = next.expect("guarded by !in_flight.is_empty()");
                    logs.push(log);
                    let decision = self.decide(&ctx, &outcome).await;
                    match decision {
                        RetryDecision::NoRetry { permit } => {
                            if let Some(limiter) = &self.config.retry_limiter {
                                handle_decision_fail_open(limiter.as_ref(), &ctx, &RetryDecision::no_retry(permit));
                            }
                            #[cfg(feature = "tracing")]
                            debug!(attempt_no = ctx.attempt_no, "hedging resolved: winner found");
                            for flag in cancel_flags.lock().unwrap().iter() {
                                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                            }
                            return Ok(RetryOutcome { outcome, logs });
                        }
                        RetryDecision::Retry { backoff, .. } => {
                            // A sibling's own retryable failure does not
                            // cancel the others; the driver keeps waiting
                            // on whichever attempt finishes next. But its
                            // backoff may want the next hedge sooner than
                            // what's already scheduled — never later.
                            if attempts_started < self.config.max_total_attempts {
                                let candidate = fire_at_from_delay(
                                    self.event_loop.now(),
                                    backoff.next_delay_millis(attempts_started),
                                );
                                if let Some(candidate) = candidate {
                                    let pulled_earlier = next_hedge_fire_at.is_none_or(|existing| candidate < existing);
                                    if pulled_earlier {
                                        #[cfg(feature = "tracing")]
                                        debug!(attempt_no = ctx.attempt_no, "hedge timer pulled earlier by sibling retry decision");
                                    }
                                    next_hedge_fire_at = Some(match next_hedge_fire_at {
                                        Some(existing) => existing.min(candidate),
                                        None => candidate,
                                    });
                                }
                            }
                            last_outcome = Some(outcome);
                        }
                        RetryDecision::Next => unreachable!("resolve_next() never returns Next"),
                    }
                }

                _ = hedge_timer, if can_hedge_more => {
                    attempts_started += 1;
                    in_flight.push(self.spawn_hedged_attempt(attempts_started, &req, &cancel_flags, overall_deadline));
                    next_hedge_fire_at = fire_at_from_delay(
                        self.event_loop.now(),
                        hedging_backoff.next_delay_millis(attempts_started),
                    );
                }
            }
        }
    }

    fn spawn_hedged_attempt(
        &self,
        attempt_no: u32,
        req: &Request,
        cancel_flags: &Arc<std::sync::Mutex<Vec<Arc<std::sync::atomic::AtomicBool>>>>,
        overall_deadline: Option<Instant>,
    ) -> futures::future::BoxFuture<'static, (AttemptContext, AttemptOutcome, AttemptLog)> {
        let endpoint = self.endpoints.endpoint_for_attempt(attempt_no);
        #[cfg(feature = "tracing")]
        let _span = info_span!("attempt", attempt_no, endpoint = %endpoint).entered();

        let ctx = AttemptContext::new(attempt_no, req.method.clone(), endpoint);
        let attempt_req = req.for_attempt(&ctx);
        let delegate = self.delegate.clone();
        let budget = self.attempt_timeout_budget(self.event_loop.now(), overall_deadline);

        let cancel_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        cancel_flags.lock().unwrap().push(cancel_flag.clone());

        Box::pin(async move {
            let mut log = AttemptLog::start(&ctx);
            let call = delegate.call(ctx.clone(), attempt_req);
            let outcome = match budget {
                Some(budget) => match tokio::time::timeout(budget, call).await {
                    Ok(outcome) => outcome,
                    Err(_) => AttemptOutcome::failure(Arc::new(RetryError::ResponseTimeout(budget)) as Cause),
                },
                None => call.await,
            };
            let outcome = if cancel_flag.load(std::sync::atomic::Ordering::SeqCst) {
                AttemptOutcome::failure(Arc::new(CancelledCause) as Cause)
            } else {
                outcome
            };
            log.complete(&outcome);
            (ctx, outcome, log)
        })
    }
}

/// `None` for [`crate::backoff::STOP`] (negative), else `now + delay`.
fn fire_at_from_delay(now: Instant, delay_millis: i64) -> Option<Instant> {
    if delay_millis < 0 {
        None
    } else {
        Some(now + Duration::from_millis(delay_millis as u64))
    }
}

#[derive(Debug)]
struct CancelledCause;

impl std::fmt::Display for CancelledCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "response cancelled")
    }
}

impl std::error::Error for CancelledCause {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RetryRuleBuilder;
    use http::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedDelegate {
        responses: Vec<StatusCode>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Delegate for ScriptedDelegate {
        async fn call(&self, _ctx: AttemptContext, _req: Request) -> AttemptOutcome {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let status = self.responses.get(idx).copied().unwrap_or(StatusCode::OK);
            AttemptOutcome::success(status, HeaderMap::new(), HeaderMap::new())
        }
    }

    fn request() -> Request {
        Request::new(Method::GET, HeaderMap::new(), None)
    }

    #[tokio::test]
    async fn retry_count_header_present_from_second_attempt() {
        let req = request();
        let ctx1 = AttemptContext::new(1, Method::GET, "svc");
        let ctx2 = AttemptContext::new(2, Method::GET, "svc");
        assert!(!req.for_attempt(&ctx1).headers.contains_key(&retry_count_header_name()));
        assert_eq!(req.for_attempt(&ctx2).headers.get(&retry_count_header_name()).unwrap(), "1");
    }

    #[tokio::test]
    async fn sequential_retries_then_succeeds() {
        let rule = RetryRuleBuilder::new()
            .on_status_class(5)
            .then_backoff(Arc::new(crate::backoff::Fixed::new(1).unwrap()))
            .build()
            .unwrap();
        let config = RetryConfig::builder(rule).max_total_attempts(3).build().unwrap();
        let delegate = Arc::new(ScriptedDelegate {
            responses: vec![StatusCode::SERVICE_UNAVAILABLE, StatusCode::SERVICE_UNAVAILABLE, StatusCode::OK],
            calls: AtomicU32::new(0),
        });
        let driver = RetryDriver::new(config, delegate, Arc::new(FixedEndpoint("svc".into())));
        let result = driver.execute(request()).await.unwrap();
        assert_eq!(result.outcome.status, Some(StatusCode::OK));
        assert_eq!(result.logs.len(), 3);
    }

    #[tokio::test]
    async fn stops_at_max_total_attempts() {
        let rule = RetryRuleBuilder::new()
            .on_status_class(5)
            .then_backoff(Arc::new(crate::backoff::Fixed::new(1).unwrap()))
            .build()
            .unwrap();
        let config = RetryConfig::builder(rule).max_total_attempts(2).build().unwrap();
        let delegate = Arc::new(ScriptedDelegate {
            responses: vec![
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::SERVICE_UNAVAILABLE,
            ],
            calls: AtomicU32::new(0),
        });
        let driver = RetryDriver::new(config, delegate, Arc::new(FixedEndpoint("svc".into())));
        let result = driver.execute(request()).await.unwrap();
        assert_eq!(result.logs.len(), 2);
        assert_eq!(result.outcome.status, Some(StatusCode::SERVICE_UNAVAILABLE));
    }

    struct SlowDelegate {
        delay: Duration,
    }

    #[async_trait]
    impl Delegate for SlowDelegate {
        async fn call(&self, _ctx: AttemptContext, _req: Request) -> AttemptOutcome {
            tokio::time::sleep(self.delay).await;
            AttemptOutcome::success(StatusCode::OK, HeaderMap::new(), HeaderMap::new())
        }
    }

    #[tokio::test]
    async fn dispatch_enforces_per_attempt_timeout() {
        let rule = RetryRuleBuilder::new()
            .on_transport_error()
            .then_backoff(Arc::new(crate::backoff::Fixed::new(1).unwrap()))
            .build()
            .unwrap();
        let config = RetryConfig::builder(rule)
            .response_timeout_millis_per_attempt(20)
            .build()
            .unwrap();
        let delegate = Arc::new(SlowDelegate { delay: Duration::from_millis(200) });
        let driver = RetryDriver::new(config, delegate, Arc::new(FixedEndpoint("svc".into())));

        let start = Instant::now();
        let (_ctx, outcome, log) = driver.dispatch(1, &request(), start, None).await;
        let elapsed = start.elapsed();

        assert!(elapsed < Duration::from_millis(150), "timeout did not cut the attempt short: {elapsed:?}");
        let message = outcome.cause.as_ref().expect("timed-out attempt must carry a cause").to_string();
        assert!(message.contains("response timeout"), "unexpected cause: {message}");
        assert_eq!(log.cause.as_deref(), Some(message.as_str()));
    }

    struct KeyedHedgeDelegate;

    #[async_trait]
    impl Delegate for KeyedHedgeDelegate {
        async fn call(&self, ctx: AttemptContext, _req: Request) -> AttemptOutcome {
            match ctx.attempt_no {
                1 => AttemptOutcome::success(StatusCode::SERVICE_UNAVAILABLE, HeaderMap::new(), HeaderMap::new()),
                _ => {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    AttemptOutcome::success(StatusCode::OK, HeaderMap::new(), HeaderMap::new())
                }
            }
        }
    }

    #[tokio::test]
    async fn hedge_timer_pulled_earlier_by_sibling_retry_decision() {
        let rule = RetryRuleBuilder::new()
            .on_status_class(5)
            .then_backoff(Arc::new(crate::backoff::Fixed::new(5).unwrap()))
            .build()
            .unwrap();
        let config = RetryConfig::builder(rule)
            .max_total_attempts(3)
            .hedging_backoff(Arc::new(crate::backoff::Fixed::new(300).unwrap()))
            .build()
            .unwrap();
        let delegate = Arc::new(KeyedHedgeDelegate);
        let driver = RetryDriver::new(config, delegate, Arc::new(FixedEndpoint("svc".into())));

        let start = Instant::now();
        let result = driver.execute(request()).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(result.outcome.status, Some(StatusCode::OK));
        assert_eq!(result.logs.len(), 2);
        // The first sibling's `Retry` decision carries a 5ms backoff; it
        // should pull the 300ms hedge timer forward rather than reset it, so
        // the second attempt starts well before the original interval would.
        assert!(elapsed < Duration::from_millis(250), "hedge timer was not pulled earlier: {elapsed:?}");
    }
}
