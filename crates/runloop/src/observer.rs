//! Observers: callbacks fired at fixed phases of a run-loop pass.
//!
//! Collected under a snapshot, never iterated while a mode lock is held, so
//! an observer's own callback is free to add or remove other observers
//! without deadlocking or corrupting iteration.

use bitflags::bitflags;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

bitflags! {
    /// The phases of a single pass through [`crate::Loop::run_in_mode`] an
    /// [`Observer`] can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Activity: u32 {
        /// About to enter the mode for this pass.
        const ENTRY          = 0x01;
        /// About to dispatch due timers.
        const BEFORE_TIMERS  = 0x02;
        /// About to dispatch signalled/fired sources.
        const BEFORE_SOURCES = 0x04;
        /// About to block in [`crate::wait::WaitBackend::wait`].
        const BEFORE_WAITING = 0x20;
        /// Just returned from a block, before dispatching whatever woke it.
        const AFTER_WAITING  = 0x40;
        /// About to leave the mode for this pass, for any reason.
        const EXIT           = 0x80;
        const ALL            = Self::ENTRY.bits()
            | Self::BEFORE_TIMERS.bits()
            | Self::BEFORE_SOURCES.bits()
            | Self::BEFORE_WAITING.bits()
            | Self::AFTER_WAITING.bits()
            | Self::EXIT.bits();
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    id: u64,
    order: i64,
    activities: Activity,
    repeats: bool,
    valid: AtomicBool,
    firing: AtomicBool,
    perform: Option<Box<dyn FnMut(Activity) + Send>>,
}

/// A callback that fires at one or more [`Activity`] phases of a run-loop
/// pass. A non-repeating observer invalidates itself after its first fire.
pub struct Observer {
    inner: Arc<Mutex<Inner>>,
}

impl Clone for Observer {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A stable, cloneable reference to an [`Observer`].
#[derive(Clone)]
pub struct ObserverHandle {
    inner: Arc<Mutex<Inner>>,
}

impl Observer {
    pub fn new(
        order: i64,
        activities: Activity,
        repeats: bool,
        perform: impl FnMut(Activity) + Send + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                order,
                activities,
                repeats,
                valid: AtomicBool::new(true),
                firing: AtomicBool::new(false),
                perform: Some(Box::new(perform)),
            })),
        }
    }

    pub fn handle(&self) -> ObserverHandle {
        ObserverHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.lock().id
    }

    pub fn order(&self) -> i64 {
        self.inner.lock().order
    }

    pub fn is_valid(&self) -> bool {
        self.inner.lock().valid.load(Ordering::Acquire)
    }

    pub(crate) fn wants(&self, activity: Activity) -> bool {
        let guard = self.inner.lock();
        guard.valid.load(Ordering::Acquire) && guard.activities.intersects(activity)
    }

    pub fn invalidate(&self) {
        self.inner.lock().valid.store(false, Ordering::Release);
    }

    /// Run the callback for `activity` with no item lock held, then
    /// invalidate a non-repeating observer.
    pub(crate) fn fire(&self, activity: Activity) {
        let (already_firing, repeats, mut perform) = {
            let mut guard = self.inner.lock();
            (
                guard.firing.swap(true, Ordering::AcqRel),
                guard.repeats,
                guard.perform.take(),
            )
        };
        if already_firing {
            return;
        }
        if let Some(perform) = &mut perform {
            perform(activity);
        }
        let mut guard = self.inner.lock();
        guard.perform = perform;
        guard.firing.store(false, Ordering::Release);
        if !repeats {
            guard.valid.store(false, Ordering::Release);
        }
    }
}

impl ObserverHandle {
    pub fn invalidate(&self) {
        Observer {
            inner: Arc::clone(&self.inner),
        }
        .invalidate()
    }

    pub fn is_valid(&self) -> bool {
        Observer {
            inner: Arc::clone(&self.inner),
        }
        .is_valid()
    }
}

impl PartialEq for Observer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Observer {}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.lock();
        f.debug_struct("Observer")
            .field("id", &guard.id)
            .field("order", &guard.order)
            .field("activities", &guard.activities)
            .field("repeats", &guard.repeats)
            .field("valid", &guard.valid.load(Ordering::Relaxed))
            .finish()
    }
}

/// Sort a snapshot of observers wanting `activity`, by `order` then
/// registration id, the order they fire in for a single phase.
pub(crate) fn firing_order(observers: &[Observer], activity: Activity) -> Vec<Observer> {
    let mut wanting: Vec<Observer> = observers
        .iter()
        .filter(|o| o.wants(activity))
        .cloned()
        .collect();
    wanting.sort_by(|a, b| a.order().cmp(&b.order()).then(a.id().cmp(&b.id())));
    wanting
}
