//! A `WaitForMultipleObjects`-based [`WaitBackend`] for Windows targets.
//!
//! Waits on an arbitrary set of waitable `HANDLE`s plus one always-present
//! auto-reset event used as the wake handle. `WaitForMultipleObjects` caps
//! the object count at `MAXIMUM_WAIT_OBJECTS` (64); callers registering more
//! than that get a [`LoopError`] back from `register`.

use super::{Message, RawWaitable, Token, WaitBackend, WaitOutcome};
use crate::error::LoopError;
use std::io;
use std::time::Instant;
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::System::Threading::{
    CreateEventW, ResetEvent, SetEvent, WaitForMultipleObjects, INFINITE,
};

const MAXIMUM_WAIT_OBJECTS: usize = 64;

pub struct NativeWaitBackend {
    wake_event: HANDLE,
    ports: Vec<(Token, HANDLE)>,
}

impl NativeWaitBackend {
    pub fn new() -> Result<Self, LoopError> {
        // SAFETY: all pointers are null, requesting an unnamed, auto-reset,
        // initially non-signaled event; a well-defined CreateEventW call.
        let wake_event = unsafe { CreateEventW(std::ptr::null(), 0, 0, std::ptr::null()) };
        if wake_event == 0 {
            return Err(LoopError::from(io::Error::last_os_error()));
        }
        Ok(Self {
            wake_event,
            ports: Vec::new(),
        })
    }
}

impl Drop for NativeWaitBackend {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.wake_event);
        }
    }
}

// SAFETY: HANDLEs are only ever touched through Win32 calls guarded by our
// own API; no thread-local state is involved.
unsafe impl Send for NativeWaitBackend {}

/// Signal `event`. Safe to call concurrently with a `WaitForMultipleObjects`
/// call blocked on the same event in another thread.
fn wake_handle(event: HANDLE) {
    // SAFETY: `event` is a valid HANDLE owned for the backend's lifetime.
    unsafe {
        SetEvent(event);
    }
}

impl WaitBackend for NativeWaitBackend {
    fn register(&mut self, token: Token, handle: RawWaitable) -> Result<(), LoopError> {
        if self.ports.len() + 1 >= MAXIMUM_WAIT_OBJECTS {
            return Err(LoopError::from(io::Error::new(
                io::ErrorKind::Other,
                "too many port sources for a single wait set (Win32 MAXIMUM_WAIT_OBJECTS limit)",
            )));
        }
        let handle = handle as HANDLE;
        if !self.ports.iter().any(|(t, _)| *t == token) {
            self.ports.push((token, handle));
        }
        Ok(())
    }

    fn unregister(&mut self, token: Token) {
        self.ports.retain(|(t, _)| *t != token);
    }

    fn wake(&self) {
        wake_handle(self.wake_event);
    }

    fn waker(&self) -> super::Waker {
        let handle = self.wake_event;
        Box::new(move || wake_handle(handle))
    }

    fn wait(&mut self, deadline: Option<Instant>, scratch: usize) -> WaitOutcome {
        let timeout_ms = match deadline {
            None => INFINITE,
            Some(when) => {
                let now = Instant::now();
                if now >= when {
                    0
                } else {
                    (when - now).as_millis().min(INFINITE as u128 - 1) as u32
                }
            }
        };

        let mut handles: Vec<HANDLE> = Vec::with_capacity(1 + self.ports.len());
        handles.push(self.wake_event);
        for (_, handle) in &self.ports {
            handles.push(*handle);
        }

        // SAFETY: handles points at a valid, appropriately-sized Vec<HANDLE>
        // we just built; its length matches the count argument and is below
        // MAXIMUM_WAIT_OBJECTS, enforced in `register`.
        let rc = unsafe {
            WaitForMultipleObjects(handles.len() as u32, handles.as_ptr(), 0, timeout_ms)
        };

        if rc == WAIT_TIMEOUT {
            return WaitOutcome::TimedOut;
        }
        if rc == WAIT_FAILED {
            return WaitOutcome::Woke;
        }
        let index = (rc - WAIT_OBJECT_0) as usize;
        if index == 0 {
            unsafe {
                ResetEvent(self.wake_event);
            }
            return WaitOutcome::Woke;
        }

        if let Some((token, _handle)) = self.ports.get(index - 1).copied() {
            // Windows waitable objects carry no payload of their own; the
            // scratch buffer stands ready for a source that layers a pipe or
            // socket read on top of its handle, mirroring the unix backend's
            // contract even though nothing is read here directly.
            let _ = scratch;
            return WaitOutcome::Port(
                token,
                Message {
                    local_port: handles[index] as RawWaitable,
                    bytes: Vec::new(),
                },
            );
        }

        WaitOutcome::Woke
    }
}
