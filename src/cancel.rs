//! Cancellation and time for bounded waits
//!
//! The service status poll is the one place the orchestrator waits on the
//! outside world for an unbounded-looking amount of time. It runs against a
//! [`Clock`] (so tests can drive time by hand) and observes a
//! [`CancelToken`] (set by an interrupt or the overall run timeout).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Granularity at which a sleeping wait notices cancellation
pub const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Shared, one-way cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Source of time for polling loops
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Sleep for `duration`, waking every [`CANCEL_CHECK_INTERVAL`] to check
/// `cancel`. Returns `false` as soon as cancellation is observed. A duration
/// too large to represent as a deadline sleeps until cancelled.
pub fn sleep_cancellable(clock: &dyn Clock, cancel: &CancelToken, duration: Duration) -> bool {
    let deadline = clock.now().checked_add(duration);
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = clock.now();
        let remaining = match deadline {
            Some(deadline) if now >= deadline => return true,
            Some(deadline) => deadline - now,
            None => CANCEL_CHECK_INTERVAL,
        };
        clock.sleep(remaining.min(CANCEL_CHECK_INTERVAL));
    }
}
