//! Readiness poller.
//!
//! Unique responsibility: wait for a remote condition to hold, polling at a fixed
//! interval, within a bounded time budget.
//!
//! Contract:
//! - Every wait ends as `Satisfied`, `TimedOut`, `Canceled` or `Fatal`.
//! - Total time spent is at most `timeout` plus one interval; the last sleep is
//!   clamped to the remaining budget, and a fetch still in flight when that
//!   deadline passes is dropped and the wait ends as `TimedOut`.
//! - Transient fetch errors are retried on the next tick; any other error aborts
//!   the wait immediately as `Fatal`.
//! - Cancellation is checked at tick boundaries only, never mid-request.
//! - Waits share no mutable state, so independent waits may run concurrently.
//!
//! Time comes from a `Clock`, so tests can drive timeouts without real delays.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

/// Source of elapsed time and sleeps.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Monotonic time elapsed since the clock's origin.
    fn elapsed(&self) -> Duration;

    /// Suspend the calling task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `tokio::time`.
///
/// Honors `tokio::time::pause()`, so paused-runtime tests also work with it.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    /// Create a clock whose origin is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock: sleeping advances time instantly.
///
/// Every sleep moves the one shared counter. Waits that run concurrently on
/// the same `ManualClock` therefore see each other's sleeps and may time out
/// early; give each concurrent wait its own clock when budgets are tight.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock at time zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nanos: AtomicU64::new(0),
        }
    }

    /// Move the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let delta = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let _ = self
            .nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.saturating_add(delta))
            });
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Errors that may clear up on their own.
pub trait Retryable {
    /// Whether the failure is worth another attempt.
    fn is_transient(&self) -> bool;
}

/// Parameters of one wait.
#[derive(Debug, Clone)]
pub struct PollRequest {
    /// Time between two fetches.
    pub interval: Duration,
    /// Total time budget.
    pub timeout: Duration,
    /// Cooperative cancellation: the wait stops once this holds `true`.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl PollRequest {
    /// Create a request without cancellation.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            cancel: None,
        }
    }

    /// Attach a cancellation signal.
    #[must_use]
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_canceled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

/// Terminal result of a wait.
#[derive(Debug)]
#[must_use]
pub enum WaitOutcome<T, E> {
    /// The condition held; carries the observation that satisfied it.
    Satisfied(T),
    /// The budget ran out first.
    TimedOut {
        /// Time spent waiting.
        waited: Duration,
    },
    /// Cancellation was requested.
    Canceled {
        /// Time spent waiting.
        waited: Duration,
    },
    /// A non-transient error ended the wait.
    Fatal(E),
}

impl<T, E> WaitOutcome<T, E> {
    /// Whether the condition was met.
    pub const fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied(_))
    }
}

impl<T, E> fmt::Display for WaitOutcome<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Satisfied(_) => write!(f, "satisfied"),
            Self::TimedOut { waited } => write!(f, "timed out after {waited:?}"),
            Self::Canceled { waited } => write!(f, "canceled after {waited:?}"),
            Self::Fatal(_) => write!(f, "aborted"),
        }
    }
}

/// Fixed-interval poller.
#[derive(Clone)]
pub struct Poller {
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("elapsed", &self.clock.elapsed())
            .finish()
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new(Arc::new(TokioClock::new()))
    }
}

impl Poller {
    /// Create a poller on the given clock.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// The clock this poller reads.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Poll `fetch` until `condition` holds on its result.
    pub async fn wait<T, E, F, Fut, P>(
        &self,
        request: &PollRequest,
        mut fetch: F,
        condition: P,
    ) -> WaitOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&T) -> bool,
        E: Retryable + fmt::Display,
    {
        let started = self.clock.elapsed();
        let interval = request.interval.max(Duration::from_millis(1));
        let mut tick: u32 = 0;

        loop {
            let waited = self.clock.elapsed().saturating_sub(started);
            if request.is_canceled() {
                tracing::info!(tick, ?waited, "wait canceled");
                return WaitOutcome::Canceled { waited };
            }

            tick = tick.saturating_add(1);
            let deadline = request.timeout.saturating_sub(waited).saturating_add(interval);
            let fetched = tokio::select! {
                biased;
                result = fetch() => Some(result),
                () = self.clock.sleep(deadline) => None,
            };
            let Some(result) = fetched else {
                let waited = self.clock.elapsed().saturating_sub(started);
                tracing::warn!(tick, ?waited, timeout = ?request.timeout, "fetch outlived the wait budget");
                return WaitOutcome::TimedOut { waited };
            };

            match result {
                Ok(observed) if condition(&observed) => {
                    tracing::debug!(tick, ?waited, "condition satisfied");
                    return WaitOutcome::Satisfied(observed);
                }
                Ok(_) => tracing::debug!(tick, ?waited, "condition pending"),
                Err(e) if e.is_transient() => {
                    tracing::warn!(tick, ?waited, error = %e, "transient error while polling");
                }
                Err(e) => {
                    tracing::warn!(tick, ?waited, error = %e, "fatal error while polling");
                    return WaitOutcome::Fatal(e);
                }
            }

            let waited = self.clock.elapsed().saturating_sub(started);
            if waited >= request.timeout {
                tracing::info!(tick, ?waited, timeout = ?request.timeout, "wait timed out");
                return WaitOutcome::TimedOut { waited };
            }

            let remaining = request.timeout.saturating_sub(waited);
            self.clock.sleep(interval.min(remaining)).await;
        }
    }
}
