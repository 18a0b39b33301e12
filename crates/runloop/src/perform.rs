//! The perform-enqueue adapter: `CFRunLoopPerformBlock` generalized.
//!
//! A per-`(loop, mode)` manual source coalesces an unbounded number of
//! cross-thread function submissions into a single wakeup: [`enqueue`]
//! pushes a boxed closure onto a shared queue and signals the source once;
//! whenever the engine dispatches that source it swaps the queue out empty
//! and runs everything that had accumulated, in submission order. A burst
//! of a thousand `enqueue` calls between two passes of the loop costs one
//! dispatch, not a thousand.

use crate::engine::Loop;
use crate::mode::ModeName;
use crate::source::Source;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

type Job = Box<dyn FnOnce() + Send>;

struct Queue {
    pending: Arc<SegQueue<Job>>,
    source: Source,
}

/// Holds the one real strong reference to each `(loop, mode)` queue, so the
/// same manual source is reused by every `enqueue` call instead of a fresh
/// one being registered each time. Entries are removed when their loop
/// drops (see [`remove_loop`]), not by refcounting, since nothing else in
/// the loop keeps a `Queue` alive on its own (the mode holds the `Source`
/// clone, not this struct).
static ADAPTERS: Mutex<Option<HashMap<(u64, ModeName), Arc<Queue>>>> = Mutex::new(None);

fn adapter_for(loop_: &Loop, mode: &ModeName) -> Arc<Queue> {
    let key = (loop_.id(), mode.clone());
    let mut map_guard = ADAPTERS.lock();
    let map = map_guard.get_or_insert_with(HashMap::new);

    if let Some(existing) = map.get(&key) {
        return Arc::clone(existing);
    }

    let pending: Arc<SegQueue<Job>> = Arc::new(SegQueue::new());
    let drain = Arc::clone(&pending);
    let source = Source::manual(i64::MIN, move |_| {
        while let Some(job) = drain.pop() {
            job();
        }
    });
    loop_.add_source(source.clone(), mode.clone());

    let queue = Arc::new(Queue { pending, source });
    map.insert(key, Arc::clone(&queue));
    queue
}

/// Drop every queue belonging to `loop_id`. Called from [`crate::Loop`]'s
/// `Drop` impl so a loop's perform-adapter sources don't linger in the
/// process-wide map after the loop itself is gone.
pub(crate) fn remove_loop(loop_id: u64) {
    if let Some(map) = ADAPTERS.lock().as_mut() {
        map.retain(|(id, _), _| *id != loop_id);
    }
}

/// Submit `job` to run on `loop_`'s thread the next time it dispatches
/// sources in `mode` (or any mode fanned out to via [`crate::COMMON_MODE_NAME`]).
/// Coalesces with any other pending jobs for the same `(loop, mode)` pair
/// into a single wakeup: the backing queue is a lock-free MPSC (`crossbeam`'s
/// `SegQueue`), so a burst of submissions from many threads never blocks on
/// the same mutex the loop thread would otherwise contend on while draining.
pub fn enqueue(loop_: &Loop, mode: ModeName, job: impl FnOnce() + Send + 'static) {
    let queue = adapter_for(loop_, &mode);
    queue.pending.push(Box::new(job));
    queue.source.signal();
    loop_.wake_up();
}
