//! Timers and the drift-free rearm algorithm.
//!
//! CFRunLoop models a timer's kernel wait object as a "timer port"
//! registered with the run loop's wait primitive. This crate drops that:
//! the engine computes the nearest deadline across every timer scheduled
//! into the modes it's waiting on and passes *that single instant* to
//! [`crate::wait::WaitBackend::wait`]. On timeout the engine (not a kernel
//! object) walks the scheduled timers, collects every one whose deadline
//! has passed, sorts them by [`Timer::order`], and dispatches each in turn.
//! This keeps the ordering and drift-free guarantees without a
//! per-platform timerfd/waitable-timer per timer; see `wait/mod.rs` for the
//! rationale.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::clock::deadline_from_seconds;

pub type Order = i64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    id: u64,
    order: Order,
    /// `None` means one-shot; `Some(interval)` means periodic (interval in
    /// seconds, as an `f64`).
    interval: Option<f64>,
    deadline: Instant,
    valid: AtomicBool,
    firing: AtomicBool,
    perform: Option<Box<dyn FnMut(&Timer) + Send>>,
}

/// A deadline-driven callback. See the module docs for how dispatch is
/// decided without a kernel timer port.
pub struct Timer {
    inner: Arc<Mutex<Inner>>,
}

impl Clone for Timer {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A stable, cloneable reference to a [`Timer`], usable to reschedule or
/// invalidate it from inside its own `perform` callback or from another
/// thread.
#[derive(Clone)]
pub struct TimerHandle {
    inner: Arc<Mutex<Inner>>,
}

impl Timer {
    /// `fire_after` and `interval` are seconds from "now" as observed by the
    /// caller; `interval <= 0.0` (or `None`) makes this a one-shot timer.
    pub fn new(
        order: Order,
        now: Instant,
        fire_after: f64,
        interval: Option<f64>,
        perform: impl FnMut(&Timer) + Send + 'static,
    ) -> Self {
        let deadline = deadline_from_seconds(now, fire_after);
        let interval = interval.filter(|i| *i > 0.0);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                order,
                interval,
                deadline,
                valid: AtomicBool::new(true),
                firing: AtomicBool::new(false),
                perform: Some(Box::new(perform)),
            })),
        }
    }

    pub fn handle(&self) -> TimerHandle {
        TimerHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.lock().id
    }

    pub fn order(&self) -> Order {
        self.inner.lock().order
    }

    pub fn is_valid(&self) -> bool {
        self.inner.lock().valid.load(Ordering::Acquire)
    }

    pub fn is_periodic(&self) -> bool {
        self.inner.lock().interval.is_some()
    }

    pub fn deadline(&self) -> Instant {
        self.inner.lock().deadline
    }

    /// Replace this timer's next fire date outright, e.g. from inside its
    /// own `perform` callback to override the automatic rearm below.
    pub fn set_next_fire(&self, now: Instant, seconds_from_now: f64) {
        let mut guard = self.inner.lock();
        guard.deadline = deadline_from_seconds(now, seconds_from_now);
    }

    pub fn invalidate(&self) {
        self.inner.lock().valid.store(false, Ordering::Release);
    }

    /// Whether `self` is due relative to `now`.
    pub(crate) fn is_due(&self, now: Instant) -> bool {
        let guard = self.inner.lock();
        guard.valid.load(Ordering::Acquire) && guard.deadline <= now
    }

    /// Fire this timer: run `perform` with no loop/mode/item locks held,
    /// then rearm a periodic timer using the drift-free algorithm below.
    /// Mirrors `__CFRunLoopDoTimer`: capture the pre-callout deadline,
    /// run the callback, and only then decide the next deadline. If the
    /// callback itself moved `deadline` (via `set_next_fire`) forward of
    /// where it started, that wins; otherwise advance by whole multiples
    /// of `interval` from the pre-callout deadline until the result is
    /// later than `now`, so a late-running process catches up rather than
    /// firing a burst of back-to-back catch-up callbacks.
    pub(crate) fn fire(&self, now: Instant) {
        let (already_firing, old_deadline, interval, mut perform) = {
            let mut guard = self.inner.lock();
            (
                guard.firing.swap(true, Ordering::AcqRel),
                guard.deadline,
                guard.interval,
                guard.perform.take(),
            )
        };
        if already_firing {
            return;
        }

        // Run the callback with no item lock held, so it can call back into
        // this same timer (e.g. `set_next_fire`, `invalidate`) through a
        // `TimerHandle` without deadlocking.
        if let Some(perform) = &mut perform {
            perform(self);
        }
        self.inner.lock().perform = perform;

        {
            let mut guard = self.inner.lock();
            guard.firing.store(false, Ordering::Release);
            if !guard.valid.load(Ordering::Acquire) {
                return;
            }
            match interval {
                None => {
                    guard.valid.store(false, Ordering::Release);
                }
                Some(interval) => {
                    if guard.deadline > old_deadline {
                        // The callback called `set_next_fire`; honor it
                        // verbatim.
                        return;
                    }
                    let step = Duration::try_from_secs_f64(interval).unwrap_or(Duration::ZERO);
                    let mut next = old_deadline;
                    let mut skipped = 0u32;
                    loop {
                        match next.checked_add(step) {
                            Some(candidate) => {
                                next = candidate;
                                if next > now {
                                    break;
                                }
                                skipped += 1;
                            }
                            None => {
                                next = crate::clock::far_future(now);
                                break;
                            }
                        }
                    }
                    if skipped > 1 {
                        warn!(
                            order = guard.order,
                            skipped,
                            "timer callback exceeded its own interval"
                        );
                    }
                    guard.deadline = next;
                }
            }
        }
    }
}

impl TimerHandle {
    pub fn invalidate(&self) {
        Timer {
            inner: Arc::clone(&self.inner),
        }
        .invalidate()
    }

    pub fn is_valid(&self) -> bool {
        Timer {
            inner: Arc::clone(&self.inner),
        }
        .is_valid()
    }

    pub fn set_next_fire(&self, now: Instant, seconds_from_now: f64) {
        Timer {
            inner: Arc::clone(&self.inner),
        }
        .set_next_fire(now, seconds_from_now)
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Timer {}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.lock();
        f.debug_struct("Timer")
            .field("id", &guard.id)
            .field("order", &guard.order)
            .field("periodic", &guard.interval.is_some())
            .field("valid", &guard.valid.load(Ordering::Relaxed))
            .finish()
    }
}

/// Sort timers due at or before `now`, most-due-first then by `order`, the
/// order the engine dispatches them in for a single wait return.
pub(crate) fn due_timers_sorted(timers: &[Timer], now: Instant) -> Vec<Timer> {
    let mut due: Vec<Timer> = timers.iter().filter(|t| t.is_due(now)).cloned().collect();
    due.sort_by(|a, b| {
        a.deadline()
            .cmp(&b.deadline())
            .then(a.order().cmp(&b.order()))
    });
    due
}
