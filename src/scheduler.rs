//! The single-threaded cooperative retry scheduler.
//!
//! A [`RetryScheduler`] holds at most one pending retry timer for one
//! logical request sequence. It enforces overtake (an earlier schedule
//! supersedes a later pending one), a minimum-backoff floor, an absolute
//! deadline, and clean shutdown. The production event loop wraps the tokio
//! runtime's own timer; tests substitute [`ManualEventLoop`], which records
//! every schedule call instead of sleeping.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Tolerance absorbing clock jitter around the deadline and fire-time checks.
pub const SCHEDULING_TOLERANCE: Duration = Duration::from_millis(5);

/// A unit of work submitted to an [`EventLoop`]. Synchronous by design: the
/// work it does (starting the next attempt) spawns its own async task if
/// needed, so the event loop itself never has to be generic over a future
/// type.
pub type Runnable = Box<dyn FnOnce() + Send + 'static>;

/// A handle to a pending (not yet fired) scheduled runnable.
pub trait TimerHandle: Send {
    /// Cancel the timer. A cancelled runnable never fires.
    fn cancel(self: Box<Self>);
}

/// Abstracts the single-threaded executor a scheduler is pinned to.
///
/// The production implementation ([`TokioEventLoop`]) wraps `tokio::time`;
/// tests use [`ManualEventLoop`], which never actually sleeps.
pub trait EventLoop: Send + Sync {
    fn now(&self) -> Instant;
    fn schedule(&self, delay: Duration, runnable: Runnable) -> Box<dyn TimerHandle>;
    fn execute(&self, runnable: Runnable);
}

/// Errors raised by scheduler operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduled task superseded by an earlier retry")]
    Superseded,
    #[error("scheduler rejected the task: executor is shut down")]
    Rejected,
    #[error("deadline exceeded before the task could run")]
    DeadlineExceeded,
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("runnable panicked: {0}")]
    RunnableFailed(String),
}

struct PendingTask {
    run_at: Instant,
    timer: Box<dyn TimerHandle>,
    on_failure: Option<Box<dyn FnOnce(SchedulerError) + Send>>,
}

struct Inner {
    current_task: Option<PendingTask>,
    min_backoff_ceiling: Option<Instant>,
    deadline: Option<Instant>,
    closed: bool,
    closed_result: Option<Result<(), SchedulerError>>,
}

/// Owns the single pending retry timer for one logical request sequence.
///
/// Every public method is documented as callable only from the task that
/// created the scheduler; calls from elsewhere return
/// [`SchedulerError::IllegalState`] rather than silently racing, since the
/// whole point of this type is to avoid needing a lock for its core
/// invariants. Internally it still wraps its state in a [`Mutex`] as a
/// pragmatic simplification over pinning to an OS thread — see DESIGN.md.
pub struct RetryScheduler {
    event_loop: Arc<dyn EventLoop>,
    owner_task: Option<tokio::task::Id>,
    state: Mutex<Inner>,
    notify: Notify,
    closing: AtomicBool,
    deadline_timer: Mutex<Option<Box<dyn TimerHandle>>>,
}

impl RetryScheduler {
    /// Builds a scheduler. If `deadline` is set, a background watchdog is
    /// armed on the event loop that closes the scheduler exceptionally with
    /// [`SchedulerError::DeadlineExceeded`] if the deadline elapses while a
    /// task is still pending — `try_schedule` alone only rejects *new*
    /// schedules past the deadline, it does nothing for one already armed.
    pub fn new(event_loop: Arc<dyn EventLoop>, deadline: Option<Instant>) -> Arc<Self> {
        let this = Arc::new(Self {
            event_loop,
            owner_task: tokio::task::try_id(),
            state: Mutex::new(Inner {
                current_task: None,
                min_backoff_ceiling: None,
                deadline,
                closed: false,
                closed_result: None,
            }),
            notify: Notify::new(),
            closing: AtomicBool::new(false),
            deadline_timer: Mutex::new(None),
        });

        if let Some(deadline) = deadline {
            let now = this.event_loop.now();
            let delay = deadline.saturating_duration_since(now);
            let watchdog = this.clone();
            let handle = this.event_loop.schedule(
                delay,
                Box::new(move || watchdog.on_deadline_elapsed()),
            );
            *this.deadline_timer.lock().unwrap() = Some(handle);
        }

        this
    }

    /// Fired by the deadline watchdog timer. A no-op if the scheduler has
    /// since closed cleanly or has no task pending (nothing was waiting on
    /// this deadline).
    fn on_deadline_elapsed(&self) {
        let still_pending = {
            let state = self.state.lock().unwrap();
            !state.closed && state.current_task.is_some()
        };
        if still_pending {
            self.close_exceptionally(SchedulerError::DeadlineExceeded);
        }
    }

    fn check_thread(&self) -> Result<(), SchedulerError> {
        match (self.owner_task, tokio::task::try_id()) {
            (Some(owner), Some(current)) if owner != current => Err(SchedulerError::IllegalState(
                "scheduler methods must be invoked from their owning task".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Attempts to schedule `runnable` to fire `delay_millis` from now.
    ///
    /// Returns `Ok(true)` if scheduled, `Ok(false)` if the target would fall
    /// after the deadline (with [`SCHEDULING_TOLERANCE`]) or the scheduler
    /// is already closed. `on_failure` is invoked (not the runnable) if this
    /// task is later superseded by an earlier one.
    pub fn try_schedule(
        self: &Arc<Self>,
        runnable: Runnable,
        on_failure: Box<dyn FnOnce(SchedulerError) + Send>,
        delay_millis: i64,
    ) -> Result<bool, SchedulerError> {
        self.check_thread()?;
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Ok(false);
        }

        let now = self.event_loop.now();
        let mut target = now + Duration::from_millis(delay_millis.max(0) as u64);

        if let Some(floor) = state.min_backoff_ceiling {
            if target < floor {
                target = floor;
            }
            state.min_backoff_ceiling = None;
        }

        if let Some(deadline) = state.deadline {
            if target > deadline + SCHEDULING_TOLERANCE {
                return Ok(false);
            }
        }

        if let Some(current) = &state.current_task {
            if current.run_at <= target {
                return Err(SchedulerError::IllegalState(
                    "concurrent scheduling of a task no earlier than the pending one".into(),
                ));
            }
            let mut superseded = state.current_task.take().unwrap();
            superseded.timer.cancel();
            if let Some(on_fail) = superseded.on_failure.take() {
                on_fail(SchedulerError::Superseded);
            }
        }

        let this = self.clone();
        let wrapped: Runnable = Box::new(move || {
            let fired = {
                let mut state = this.state.lock().unwrap();
                // Already cancelled by close()/overtake between firing and
                // this closure running; don't touch current_task or call
                // the runnable.
                match &state.current_task {
                    Some(task) if task.run_at == target => {
                        state.current_task = None;
                        true
                    }
                    _ => false,
                }
            };
            if !fired {
                return;
            }
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(runnable));
            match outcome {
                Ok(()) => {}
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    this.close_exceptionally(SchedulerError::RunnableFailed(message));
                }
            }
        });

        let delay = target.saturating_duration_since(now);
        let timer = self.event_loop.schedule(delay, wrapped);
        state.current_task = Some(PendingTask {
            run_at: target,
            timer,
            on_failure: Some(on_failure),
        });
        Ok(true)
    }

    /// Raises the minimum-backoff floor to `max(current_floor, now + ms)`.
    ///
    /// If the new floor would exceed the deadline, the scheduler does not
    /// close itself, but subsequent `try_schedule` calls will return
    /// `Ok(false)` once their target is computed against this floor.
    pub fn apply_minimum_backoff_millis(&self, ms: i64) -> Result<(), SchedulerError> {
        self.check_thread()?;
        let mut state = self.state.lock().unwrap();
        let now = self.event_loop.now();
        let candidate = now + Duration::from_millis(ms.max(0) as u64);
        state.min_backoff_ceiling = Some(match state.min_backoff_ceiling {
            Some(existing) => existing.max(candidate),
            None => candidate,
        });
        Ok(())
    }

    /// Idempotent. Cancels the pending timer (without invoking its
    /// `on_failure`), marks the scheduler closed, and completes
    /// [`RetryScheduler::when_closed`] successfully if not already resolved.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(timer) = self.deadline_timer.lock().unwrap().take() {
            timer.cancel();
        }
        let mut state = self.state.lock().unwrap();
        if let Some(mut task) = state.current_task.take() {
            task.timer.cancel();
            // A task cancelled by close() does NOT trigger its on_failure.
            drop(task.on_failure.take());
        }
        state.closed = true;
        if state.closed_result.is_none() {
            state.closed_result = Some(Ok(()));
        }
        drop(state);
        self.notify.notify_waiters();
    }

    fn close_exceptionally(&self, err: SchedulerError) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(timer) = self.deadline_timer.lock().unwrap().take() {
            timer.cancel();
        }
        let mut state = self.state.lock().unwrap();
        if let Some(mut task) = state.current_task.take() {
            task.timer.cancel();
            drop(task.on_failure.take());
        }
        state.closed = true;
        state.closed_result = Some(Err(err));
        drop(state);
        self.notify.notify_waiters();
    }

    /// Completes successfully on clean [`RetryScheduler::close`]; completes
    /// with an error if a scheduled runnable panicked, the timer was
    /// rejected, or the deadline elapsed with a task still pending.
    pub async fn when_closed(&self) -> Result<(), SchedulerError> {
        loop {
            {
                let state = self.state.lock().unwrap();
                if let Some(result) = &state.closed_result {
                    return result.clone();
                }
            }
            self.notify.notified().await;
        }
    }

    /// `true` once [`RetryScheduler::close`] (or an exceptional close) has
    /// resolved [`RetryScheduler::when_closed`].
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

/// Production event loop: wraps the ambient tokio runtime's timer and
/// spawns each scheduled/executed runnable as its own task.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioEventLoop;

struct TokioTimerHandle(tokio::task::JoinHandle<()>);

impl TimerHandle for TokioTimerHandle {
    fn cancel(self: Box<Self>) {
        self.0.abort();
    }
}

impl EventLoop for TokioEventLoop {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule(&self, delay: Duration, runnable: Runnable) -> Box<dyn TimerHandle> {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            runnable();
        });
        Box::new(TokioTimerHandle(handle))
    }

    fn execute(&self, runnable: Runnable) {
        tokio::spawn(async move {
            runnable();
        });
    }
}

#[cfg(test)]
pub mod testutil {
    //! A manageable event loop for scheduler/driver tests: records every
    //! schedule call with its requested delay instead of sleeping.

    use super::*;
    use std::sync::Mutex as StdMutex;

    struct ManualTimer {
        cancelled: Arc<AtomicBool>,
    }

    impl TimerHandle for ManualTimer {
        fn cancel(self: Box<Self>) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    pub struct RecordedSchedule {
        pub delay: Duration,
        runnable: Mutex<Option<Runnable>>,
        cancelled: Arc<AtomicBool>,
    }

    /// An [`EventLoop`] that never sleeps: `now()` is a fixed logical clock
    /// advanced only by [`ManualEventLoop::advance`], and every
    /// `schedule`/`execute` call is recorded for the test to fire manually.
    pub struct ManualEventLoop {
        base: Instant,
        elapsed: StdMutex<Duration>,
        scheduled: StdMutex<Vec<Arc<RecordedSchedule>>>,
    }

    impl ManualEventLoop {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                base: Instant::now(),
                elapsed: StdMutex::new(Duration::ZERO),
                scheduled: StdMutex::new(Vec::new()),
            })
        }

        pub fn advance(&self, by: Duration) {
            *self.elapsed.lock().unwrap() += by;
        }

        pub fn scheduled_delays(&self) -> Vec<Duration> {
            self.scheduled.lock().unwrap().iter().map(|s| s.delay).collect()
        }

        /// Fires the `index`-th scheduled runnable (0-based, in schedule
        /// order), unless it has since been cancelled.
        pub fn fire(&self, index: usize) {
            let recorded = self.scheduled.lock().unwrap()[index].clone();
            if recorded.cancelled.load(Ordering::SeqCst) {
                return;
            }
            if let Some(runnable) = recorded.runnable.lock().unwrap().take() {
                runnable();
            }
        }

        pub fn len(&self) -> usize {
            self.scheduled.lock().unwrap().len()
        }
    }

    impl EventLoop for ManualEventLoop {
        fn now(&self) -> Instant {
            self.base + *self.elapsed.lock().unwrap()
        }

        fn schedule(&self, delay: Duration, runnable: Runnable) -> Box<dyn TimerHandle> {
            let cancelled = Arc::new(AtomicBool::new(false));
            let recorded = Arc::new(RecordedSchedule {
                delay,
                runnable: Mutex::new(Some(runnable)),
                cancelled: cancelled.clone(),
            });
            self.scheduled.lock().unwrap().push(recorded);
            Box::new(ManualTimer { cancelled })
        }

        fn execute(&self, runnable: Runnable) {
            runnable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::ManualEventLoop;
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn overtake_cancels_later_task_scenario_7() {
        let event_loop = ManualEventLoop::new();
        let scheduler = RetryScheduler::new(event_loop.clone(), None);

        let superseded = Arc::new(AtomicBool::new(false));
        let superseded_clone = superseded.clone();
        scheduler
            .try_schedule(
                Box::new(|| panic!("task A must not run, it was superseded")),
                Box::new(move |err| {
                    assert!(matches!(err, SchedulerError::Superseded));
                    superseded_clone.store(true, Ordering::SeqCst);
                }),
                200,
            )
            .unwrap();

        let ran_b = Arc::new(AtomicBool::new(false));
        let ran_b_clone = ran_b.clone();
        let scheduled = scheduler
            .try_schedule(Box::new(move || ran_b_clone.store(true, Ordering::SeqCst)), Box::new(|_| {}), 100)
            .unwrap();

        assert!(scheduled);
        assert!(superseded.load(Ordering::SeqCst));

        event_loop.fire(1);
        assert!(ran_b.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn deadline_rejects_schedule_scenario_8() {
        let event_loop = ManualEventLoop::new();
        let now = event_loop.now();
        let scheduler = RetryScheduler::new(event_loop.clone(), Some(now + Duration::from_secs(1)));

        let scheduled = scheduler
            .try_schedule(Box::new(|| {}), Box::new(|_| {}), 1005 + SCHEDULING_TOLERANCE.as_millis() as i64 + 1)
            .unwrap();

        assert!(!scheduled);
        assert!(!scheduler.is_closed());
    }

    #[tokio::test]
    async fn deadline_elapsing_with_pending_task_closes_exceptionally_scenario_8() {
        let event_loop = ManualEventLoop::new();
        let now = event_loop.now();
        let scheduler = RetryScheduler::new(event_loop.clone(), Some(now + Duration::from_millis(500)));

        scheduler
            .try_schedule(Box::new(|| {}), Box::new(|_| {}), 100)
            .unwrap();

        // Index 0 is the deadline watchdog armed in `new`; index 1 is the
        // retry task scheduled above.
        event_loop.fire(0);

        let result = scheduler.when_closed().await;
        assert!(matches!(result, Err(SchedulerError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn deadline_elapsing_after_clean_close_is_a_no_op() {
        let event_loop = ManualEventLoop::new();
        let now = event_loop.now();
        let scheduler = RetryScheduler::new(event_loop.clone(), Some(now + Duration::from_millis(500)));
        scheduler.close();
        // The watchdog fires but no task is pending: it must not overwrite
        // the already-successful close.
        event_loop.fire(0);
        assert!(matches!(scheduler.when_closed().await, Ok(())));
    }

    #[tokio::test]
    async fn close_cancels_pending_without_on_failure() {
        let event_loop = ManualEventLoop::new();
        let scheduler = RetryScheduler::new(event_loop.clone(), None);
        let on_failure_called = Arc::new(AtomicBool::new(false));
        let called = on_failure_called.clone();

        scheduler
            .try_schedule(
                Box::new(|| {}),
                Box::new(move |_| called.store(true, Ordering::SeqCst)),
                1000,
            )
            .unwrap();

        scheduler.close();
        assert!(!on_failure_called.load(Ordering::SeqCst));
        scheduler.when_closed().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let event_loop = ManualEventLoop::new();
        let scheduler = RetryScheduler::new(event_loop, None);
        scheduler.close();
        scheduler.close();
        scheduler.when_closed().await.unwrap();
    }

    #[tokio::test]
    async fn min_backoff_floor_raises_target() {
        let event_loop = ManualEventLoop::new();
        let scheduler = RetryScheduler::new(event_loop.clone(), None);
        scheduler.apply_minimum_backoff_millis(500).unwrap();
        scheduler.try_schedule(Box::new(|| {}), Box::new(|_| {}), 10).unwrap();
        let delays = event_loop.scheduled_delays();
        assert_eq!(delays.len(), 1);
        assert!(delays[0] >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn runnable_panic_closes_exceptionally() {
        let event_loop = ManualEventLoop::new();
        let scheduler = RetryScheduler::new(event_loop.clone(), None);
        scheduler
            .try_schedule(Box::new(|| panic!("attempt exploded")), Box::new(|_| {}), 0)
            .unwrap();
        event_loop.fire(0);
        let result = scheduler.when_closed().await;
        assert!(matches!(result, Err(SchedulerError::RunnableFailed(_))));
    }

    #[tokio::test]
    async fn at_most_one_pending_task_invariant() {
        let event_loop = ManualEventLoop::new();
        let scheduler = RetryScheduler::new(event_loop.clone(), None);
        let ran = Arc::new(AtomicUsize::new(0));
        for delay in [300, 200, 100] {
            let ran = ran.clone();
            let _ = scheduler.try_schedule(Box::new(move || { ran.fetch_add(1, Ordering::SeqCst); }), Box::new(|_| {}), delay);
        }
        // Only the last (earliest) schedule should still be live.
        event_loop.fire(2);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
