//! An in-memory [`WaitBackend`] with no OS dependency.
//!
//! Real wall-clock waits are replaced by a condition variable; "kernel
//! handles" are replaced by tokens a test fires directly through a
//! [`InMemoryController`]. This is what makes the integration tests in
//! `tests/` deterministic instead of racing real timing.

use super::{Message, RawWaitable, Token, WaitBackend, WaitOutcome};
use crate::error::LoopError;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

#[derive(Default)]
struct State {
    woken: bool,
    pending: VecDeque<(Token, Message)>,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// A deterministic wait backend for tests and embedders that want a
/// reproducible harness instead of the real OS primitives.
pub struct InMemoryWaitBackend {
    shared: Arc<Shared>,
    ports: HashMap<Token, RawWaitable>,
}

impl InMemoryWaitBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                cond: Condvar::new(),
            }),
            ports: HashMap::new(),
        }
    }

    /// A cloneable, `Send + Sync` handle that other threads (or the test
    /// itself) use to simulate a port firing or an explicit wake-up.
    pub fn controller(&self) -> InMemoryController {
        InMemoryController {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for InMemoryWaitBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitBackend for InMemoryWaitBackend {
    fn register(&mut self, token: Token, handle: RawWaitable) -> Result<(), LoopError> {
        self.ports.insert(token, handle);
        Ok(())
    }

    fn unregister(&mut self, token: Token) {
        self.ports.remove(&token);
    }

    fn wake(&self) {
        self.controller().wake();
    }

    fn waker(&self) -> super::Waker {
        let controller = self.controller();
        Box::new(move || controller.wake())
    }

    fn wait(&mut self, deadline: Option<Instant>, _scratch: usize) -> WaitOutcome {
        let mut state = self.shared.state.lock();
        loop {
            if let Some((token, msg)) = state.pending.pop_front() {
                return WaitOutcome::Port(token, msg);
            }
            if state.woken {
                state.woken = false;
                return WaitOutcome::Woke;
            }
            match deadline {
                None => self.shared.cond.wait(&mut state),
                Some(when) => {
                    let now = Instant::now();
                    if now >= when {
                        return WaitOutcome::TimedOut;
                    }
                    let timed_out = self
                        .shared
                        .cond
                        .wait_for(&mut state, when - now)
                        .timed_out();
                    if timed_out && state.pending.is_empty() && !state.woken {
                        return WaitOutcome::TimedOut;
                    }
                }
            }
        }
    }
}

/// A handle used to drive an [`InMemoryWaitBackend`] from outside the loop's
/// thread: firing a port, or waking the loop the way [`crate::Loop::wake_up`]
/// would.
#[derive(Clone)]
pub struct InMemoryController {
    shared: Arc<Shared>,
}

impl InMemoryController {
    pub fn wake(&self) {
        let mut state = self.shared.state.lock();
        state.woken = true;
        self.shared.cond.notify_all();
    }

    pub fn fire(&self, token: Token, message: Message) {
        let mut state = self.shared.state.lock();
        state.pending.push_back((token, message));
        self.shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_times_out() {
        let mut backend = InMemoryWaitBackend::new();
        let outcome = backend.wait(Some(Instant::now() + Duration::from_millis(10)), 0);
        assert!(matches!(outcome, WaitOutcome::TimedOut));
    }

    #[test]
    fn cross_thread_wake_returns_promptly() {
        let mut backend = InMemoryWaitBackend::new();
        let controller = backend.controller();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            controller.wake();
        });
        let outcome = backend.wait(Some(Instant::now() + Duration::from_secs(5)), 0);
        assert!(matches!(outcome, WaitOutcome::Woke));
        handle.join().unwrap();
    }

    #[test]
    fn fired_port_is_returned() {
        let mut backend = InMemoryWaitBackend::new();
        backend.register(Token(1), 0).unwrap();
        let controller = backend.controller();
        controller.fire(
            Token(1),
            Message {
                local_port: 0,
                bytes: vec![1, 2, 3],
            },
        );
        match backend.wait(None, 0) {
            WaitOutcome::Port(token, msg) => {
                assert_eq!(token, Token(1));
                assert_eq!(msg.bytes, vec![1, 2, 3]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
