//! Per-thread loop storage and the process-wide main-loop singleton.
//!
//! CFRunLoop stores a `CFRunLoop` per thread in a global dictionary keyed by
//! `pthread_t`, lazily created, with a process-id check so a forked child
//! doesn't inherit a pointer to a loop object a thread in the parent still
//! owns. This crate doesn't need a global dictionary (`thread_local!`
//! already gives per-thread storage), but it keeps the fork check: a loop
//! created before `fork()` is unusable in the child since none of its
//! threads survive the fork, so [`current`] rebuilds a fresh loop when the
//! observed pid no longer matches the one recorded at construction.

use crate::engine::Loop;
use parking_lot::{Mutex, Once};
use std::sync::Arc;

fn process_id() -> u32 {
    #[cfg(unix)]
    {
        // SAFETY: getpid(2) takes no arguments and cannot fail.
        unsafe { libc::getpid() as u32 }
    }
    #[cfg(windows)]
    {
        // SAFETY: GetCurrentProcessId takes no arguments and cannot fail.
        unsafe { windows_sys::Win32::System::Threading::GetCurrentProcessId() }
    }
    #[cfg(not(any(unix, windows)))]
    {
        0
    }
}

struct Pinned {
    pid: u32,
    inner: Arc<Loop>,
}

thread_local! {
    static CURRENT: std::cell::RefCell<Option<Pinned>> = std::cell::RefCell::new(None);
}

static MAIN: Mutex<Option<Arc<Loop>>> = Mutex::new(None);
static MAIN_ONCE: Once = Once::new();

/// The loop for the calling thread, creating one on first access and
/// re-creating it if the process has forked since the cached one was built.
pub fn current() -> Arc<Loop> {
    CURRENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        let pid = process_id();
        if let Some(pinned) = slot.as_ref() {
            if pinned.pid == pid {
                return Arc::clone(&pinned.inner);
            }
        }
        let inner = Arc::new(Loop::new_unregistered());
        *slot = Some(Pinned {
            pid,
            inner: Arc::clone(&inner),
        });
        inner
    })
}

/// The process's designated main loop: the first thread to call this
/// becomes its owner. Every later call from any thread returns the same
/// loop, mirroring `CFRunLoopGetMain`.
pub fn main() -> Arc<Loop> {
    MAIN_ONCE.call_once(|| {
        *MAIN.lock() = Some(Arc::new(Loop::new_unregistered()));
    });
    Arc::clone(MAIN.lock().as_ref().expect("main loop initialized by Once"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_is_stable_within_a_thread() {
        let a = current();
        let b = current();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn main_is_shared_across_threads() {
        let main_here = main();
        let handle = std::thread::spawn(main);
        let main_there = handle.join().unwrap();
        assert!(Arc::ptr_eq(&main_here, &main_there));
    }
}
