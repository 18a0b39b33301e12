//! clock
//!
//! The engine only ever needs a monotonic instant and saturating duration
//! arithmetic.

use std::time::{Duration, Instant};

/// A monotonic clock. Exists as a trait so tests can substitute a logical
/// clock driven by [`crate::wait::memory::InMemoryWaitBackend`] instead of
/// real wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The real OS monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Saturating `now + seconds`, never panicking on overflow. Mirrors
/// CFRunLoop's `__CFTSRToTimeInterval(LLONG_MAX) < seconds` overflow guard.
pub fn deadline_from_seconds(now: Instant, seconds: f64) -> Instant {
    if seconds <= 0.0 {
        return now;
    }
    if !seconds.is_finite() || seconds >= i64::MAX as f64 {
        return far_future(now);
    }
    match Duration::try_from_secs_f64(seconds) {
        Ok(dur) => now.checked_add(dur).unwrap_or_else(|| far_future(now)),
        Err(_) => far_future(now),
    }
}

/// An instant far enough in the future to stand in for "no deadline" without
/// needing an `Option` at every call site.
pub fn far_future(now: Instant) -> Instant {
    now.checked_add(Duration::from_secs(86_400 * 365 * 100))
        .unwrap_or(now)
}
