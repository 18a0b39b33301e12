//! A `poll(2)`-based [`WaitBackend`] for unix targets.
//!
//! The loop's wake handle is a self-pipe: `wake()` writes one byte to the
//! write end from any thread, `wait()` includes the read end in every poll
//! and drains it when it fires. Port sources contribute their raw fd
//! directly; readiness is translated into a [`Message`] by reading whatever
//! is available into a scratch buffer, the generic equivalent of CFRunLoop's
//! Mach-message receive.

use super::{Message, RawWaitable, Token, WaitBackend, WaitOutcome};
use crate::error::LoopError;
use std::io;
use std::os::fd::RawFd;
use std::time::Instant;

pub struct NativeWaitBackend {
    wake_read: RawFd,
    wake_write: RawFd,
    ports: Vec<(Token, RawFd)>,
}

impl NativeWaitBackend {
    pub fn new() -> Result<Self, LoopError> {
        let mut fds = [0i32; 2];
        // SAFETY: pipe2 with O_CLOEXEC|O_NONBLOCK is a well-defined libc call
        // with a valid out-pointer to a 2-element array.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if rc != 0 {
            return Err(LoopError::from(io::Error::last_os_error()));
        }
        Ok(Self {
            wake_read: fds[0],
            wake_write: fds[1],
            ports: Vec::new(),
        })
    }
}

impl Drop for NativeWaitBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

// SAFETY: the fds are only ever touched through libc calls guarded by our
// own API; no thread-local state is involved.
unsafe impl Send for NativeWaitBackend {}

/// Write a single wake byte to `fd`. Safe to call concurrently with a
/// `poll(2)` call reading the other end in another thread: the self-pipe
/// trick is exactly this guarantee.
fn wake_fd(fd: RawFd) {
    let byte = [1u8];
    // SAFETY: write(2) into a valid, open fd we own with a valid 1-byte
    // buffer. EAGAIN (pipe already has a pending wake byte) is fine to
    // ignore: the wake is already pending.
    unsafe {
        libc::write(fd, byte.as_ptr() as *const _, 1);
    }
}

impl WaitBackend for NativeWaitBackend {
    fn register(&mut self, token: Token, handle: RawWaitable) -> Result<(), LoopError> {
        if !self.ports.iter().any(|(t, _)| *t == token) {
            self.ports.push((token, handle));
        }
        Ok(())
    }

    fn unregister(&mut self, token: Token) {
        self.ports.retain(|(t, _)| *t != token);
    }

    fn wake(&self) {
        wake_fd(self.wake_write);
    }

    fn waker(&self) -> super::Waker {
        let fd = self.wake_write;
        Box::new(move || wake_fd(fd))
    }

    fn wait(&mut self, deadline: Option<Instant>, scratch: usize) -> WaitOutcome {
        let timeout_ms = match deadline {
            None => -1,
            Some(when) => {
                let now = Instant::now();
                if now >= when {
                    0
                } else {
                    (when - now).as_millis().min(i32::MAX as u128) as i32
                }
            }
        };

        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(1 + self.ports.len());
        fds.push(libc::pollfd {
            fd: self.wake_read,
            events: libc::POLLIN,
            revents: 0,
        });
        for (_, fd) in &self.ports {
            fds.push(libc::pollfd {
                fd: *fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }

        // SAFETY: fds points at a valid, appropriately-sized Vec<pollfd> we
        // just built; nfds matches its length.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return WaitOutcome::Interrupted;
            }
            // Treat any other poll failure as a spurious wake so the engine
            // re-evaluates stop/deadline conditions rather than looping on
            // an error the caller can't act on.
            return WaitOutcome::Woke;
        }
        if rc == 0 {
            return WaitOutcome::TimedOut;
        }

        if fds[0].revents & libc::POLLIN != 0 {
            let mut drain = [0u8; 64];
            // SAFETY: read(2) into a valid, appropriately sized stack buffer
            // from our own non-blocking pipe read end.
            while unsafe {
                libc::read(self.wake_read, drain.as_mut_ptr() as *mut _, drain.len())
            } > 0
            {}
            return WaitOutcome::Woke;
        }

        for (i, (token, fd)) in self.ports.iter().enumerate() {
            if fds[i + 1].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                let mut buf = vec![0u8; scratch.max(1)];
                // SAFETY: read(2) into a valid buffer of length `buf.len()`
                // from a fd the caller registered as readable.
                let n = unsafe { libc::read(*fd, buf.as_mut_ptr() as *mut _, buf.len()) };
                buf.truncate(n.max(0) as usize);
                return WaitOutcome::Port(
                    *token,
                    Message {
                        local_port: *fd,
                        bytes: buf,
                    },
                );
            }
        }

        WaitOutcome::Woke
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_unblocks_wait() {
        let mut backend = NativeWaitBackend::new().unwrap();
        backend.wake();
        let outcome = backend.wait(None, 128);
        assert!(matches!(outcome, WaitOutcome::Woke));
    }

    #[test]
    fn timeout_elapses() {
        let mut backend = NativeWaitBackend::new().unwrap();
        let outcome = backend.wait(
            Some(Instant::now() + std::time::Duration::from_millis(10)),
            128,
        );
        assert!(matches!(outcome, WaitOutcome::TimedOut));
    }

    #[test]
    fn port_fires_are_reported() {
        let mut backend = NativeWaitBackend::new().unwrap();
        let mut fds = [0i32; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        backend.register(Token(7), fds[0]).unwrap();
        let payload = b"hello";
        unsafe {
            libc::write(fds[1], payload.as_ptr() as *const _, payload.len());
        }
        match backend.wait(None, 128) {
            WaitOutcome::Port(token, msg) => {
                assert_eq!(token, Token(7));
                assert_eq!(msg.bytes, payload);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
