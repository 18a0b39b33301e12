//! Sources: the two ways work gets scheduled into a mode between wakeups.
//!
//! A v0 ("manual") source carries a signalled bit the owner sets from
//! anywhere; the engine dispatches it on the next pass through a mode it's
//! scheduled in, no wait-backend registration required. A v1 ("port")
//! source is backed by a [`crate::wait::RawWaitable`] registered with the
//! active [`crate::wait::WaitBackend`]; the engine dispatches it only when
//! the backend reports that handle readable.

use crate::wait::{Message, RawWaitable};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Ordering key for dispatch when more than one source is due in a single
/// pass. Lower values run first; ties keep registration order.
pub type Order = i64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

enum Flavor {
    Manual,
    Port {
        port: RawWaitable,
        get_port: Box<dyn Fn() -> RawWaitable + Send + Sync>,
    },
}

struct Inner {
    id: u64,
    order: Order,
    flavor: Flavor,
    valid: AtomicBool,
    signalled: AtomicBool,
    perform: Option<Box<dyn FnMut(Option<Message>) + Send>>,
    scheduled_in: HashSet<(u64, crate::mode::ModeName)>,
}

/// A unit of app-supplied work scheduled into one or more modes of one or
/// more loops. See the module docs for the manual/port distinction.
pub struct Source {
    inner: Arc<Mutex<Inner>>,
}

impl Clone for Source {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A stable, cloneable reference to a [`Source`] usable from any thread to
/// signal it, independent of whether the owning `Source` value is still
/// live in the caller's scope.
#[derive(Clone)]
pub struct SourceHandle {
    inner: Arc<Mutex<Inner>>,
}

impl Source {
    /// Build a manual (v0) source. `perform` receives `None` every time it
    /// fires; the signalled bit carries no payload.
    pub fn manual(order: Order, perform: impl FnMut(Option<Message>) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                order,
                flavor: Flavor::Manual,
                valid: AtomicBool::new(true),
                signalled: AtomicBool::new(false),
                perform: Some(Box::new(perform)),
                scheduled_in: HashSet::new(),
            })),
        }
    }

    /// Build a port (v1) source. `get_port` is called once, at construction,
    /// to obtain the waitable handle the engine registers with the wait
    /// backend; `perform` receives `Some(message)` with whatever the backend
    /// read off that handle.
    pub fn port(
        order: Order,
        get_port: impl Fn() -> RawWaitable + Send + Sync + 'static,
        perform: impl FnMut(Option<Message>) + Send + 'static,
    ) -> Self {
        let port = get_port();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                order,
                flavor: Flavor::Port {
                    port,
                    get_port: Box::new(get_port),
                },
                valid: AtomicBool::new(true),
                signalled: AtomicBool::new(false),
                perform: Some(Box::new(perform)),
                scheduled_in: HashSet::new(),
            })),
        }
    }

    pub fn handle(&self) -> SourceHandle {
        SourceHandle {
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

    pub fn is_port(&self) -> bool {
        matches!(self.inner.lock().flavor, Flavor::Port { .. })
    }

    /// The waitable handle a port source currently presents, re-queried
    /// through `get_port` each time a wait set is rebuilt so a source can
    /// rotate its underlying handle between runs.
    pub fn raw_waitable(&self) -> Option<RawWaitable> {
        let mut guard = self.inner.lock();
        match &mut guard.flavor {
            Flavor::Manual => None,
            Flavor::Port { port, get_port } => {
                *port = get_port();
                Some(*port)
            }
        }
    }

    /// Set the signalled bit on a manual source. A no-op (returns `false`) on
    /// a port source or an invalidated source.
    pub fn signal(&self) -> bool {
        let guard = self.inner.lock();
        if !matches!(guard.flavor, Flavor::Manual) || !guard.valid.load(Ordering::Acquire) {
            return false;
        }
        guard.signalled.store(true, Ordering::Release);
        trace!(order = guard.order, "source signalled");
        true
    }

    pub fn is_signalled(&self) -> bool {
        self.inner.lock().signalled.load(Ordering::Acquire)
    }

    /// Clear the signalled bit and run `perform`, no loop/mode/item locks
    /// held by the caller. `message` is `Some` only for a port source fire.
    pub fn dispatch(&self, message: Option<Message>) {
        let mut perform = {
            let mut guard = self.inner.lock();
            guard.signalled.store(false, Ordering::Release);
            guard.perform.take()
        };
        // Run with no item lock held, so `perform` can call back into this
        // same source (e.g. `invalidate`, re-`signal`) through a
        // `SourceHandle` without deadlocking.
        if let Some(perform) = &mut perform {
            perform(message);
        }
        self.inner.lock().perform = perform;
    }

    /// Record that this source has been added to `(loop_id, mode)`. Used so
    /// `invalidate` can remove the source from every mode it was scheduled
    /// in without the caller having to track that set itself.
    pub(crate) fn note_scheduled(&self, loop_id: u64, mode: crate::mode::ModeName) {
        self.inner.lock().scheduled_in.insert((loop_id, mode));
    }

    pub(crate) fn note_unscheduled(&self, loop_id: u64, mode: &crate::mode::ModeName) {
        self.inner.lock().scheduled_in.remove(&(loop_id, mode.clone()));
    }

    pub(crate) fn scheduled_in(&self) -> Vec<(u64, crate::mode::ModeName)> {
        self.inner.lock().scheduled_in.iter().cloned().collect()
    }

    /// Mark the source invalid. It is removed from every mode it's scheduled
    /// in the next time that mode's membership is touched; existing
    /// in-flight dispatches are not interrupted.
    pub fn invalidate(&self) {
        self.inner.lock().valid.store(false, Ordering::Release);
    }
}

impl SourceHandle {
    pub fn signal(&self) -> bool {
        Source {
            inner: Arc::clone(&self.inner),
        }
        .signal()
    }

    pub fn invalidate(&self) {
        Source {
            inner: Arc::clone(&self.inner),
        }
        .invalidate()
    }

    pub fn is_valid(&self) -> bool {
        Source {
            inner: Arc::clone(&self.inner),
        }
        .is_valid()
    }
}

impl PartialEq for Source {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Source {}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.lock();
        f.debug_struct("Source")
            .field("id", &guard.id)
            .field("order", &guard.order)
            .field("port", &matches!(guard.flavor, Flavor::Port { .. }))
            .field("valid", &guard.valid.load(Ordering::Relaxed))
            .field("signalled", &guard.signalled.load(Ordering::Relaxed))
            .finish()
    }
}
