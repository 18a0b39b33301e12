//! The abstract wait-set capability the engine blocks on: the OS primitive
//! that delivers a blocking wait with timeout on a set of kernel handles.
//! This module specifies that primitive as a trait and ships three
//! implementations: a native unix backend (`poll(2)` over raw fds), a native
//! Windows backend (`WaitForMultipleObjects` over `HANDLE`s), and an
//! in-memory backend used by tests.
//!
//! Per-timer kernel objects (CFRunLoop's "timer port") are not modeled
//! here; see [`crate::timer`] module docs for why the engine computes
//! deadlines instead of registering one waitable per timer.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

mod memory;

use crate::error::LoopError;
use std::time::Instant;

pub use memory::InMemoryWaitBackend;
#[cfg(unix)]
pub use unix::NativeWaitBackend;
#[cfg(windows)]
pub use windows::NativeWaitBackend;

/// A raw, platform-specific waitable handle supplied by a port source's
/// `get_port` callback.
#[cfg(unix)]
pub type RawWaitable = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawWaitable = std::os::windows::io::RawHandle;
#[cfg(not(any(unix, windows)))]
pub type RawWaitable = usize;

/// Identifies a registered port within a wait backend. Assigned by the
/// engine, opaque to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

/// What woke a call to [`WaitBackend::wait`].
#[derive(Debug)]
pub enum WaitOutcome {
    /// The loop's own wake handle fired. No item dispatches directly; the
    /// engine just re-evaluates its stop/poll conditions.
    Woke,
    /// The deadline passed with nothing else firing.
    TimedOut,
    /// A registered port fired; its token and the received message are
    /// returned so the engine can find the owning source.
    Port(Token, Message),
    /// The wait was interrupted by a transient OS condition (e.g. `EINTR`)
    /// and should simply be retried by the caller.
    Interrupted,
}

/// A message received from a fired port source: at minimum the local port
/// identity and the body bytes read off it, mirroring CFRunLoop's opaque
/// Mach message buffer.
#[derive(Debug, Clone)]
pub struct Message {
    pub local_port: RawWaitable,
    pub bytes: Vec<u8>,
}

/// A cheap, `Send + Sync` handle that makes a concurrently-blocked
/// [`WaitBackend::wait`] return promptly, without needing mutable access to
/// the backend itself. Obtained once via [`WaitBackend::waker`] and cached
/// by the owning [`crate::Loop`] so [`crate::Loop::wake_up`] never contends
/// with the loop thread's exclusive access to the backend for
/// `register`/`unregister`/`wait`.
pub type Waker = Box<dyn Fn() + Send + Sync>;

/// The pluggable wait primitive a [`crate::Loop`] drives its blocking phase
/// through. Implementors need not be `Sync`; `register`/`unregister`/`wait`
/// are only ever called by the thread that owns the loop. `wake` (and any
/// [`Waker`] obtained from it) must tolerate concurrent calls from other
/// threads, including while `wait` is blocked.
pub trait WaitBackend: Send {
    /// Register a port-source handle under `token`. Called when a port
    /// source is scheduled into a mode whose wait set is being rebuilt.
    fn register(&mut self, token: Token, handle: RawWaitable) -> Result<(), LoopError>;

    /// Remove a previously registered port. A no-op if `token` is unknown.
    fn unregister(&mut self, token: Token);

    /// Make a blocked or about-to-block [`Self::wait`] return promptly. May
    /// be called from any thread, including while another thread is inside
    /// [`Self::wait`].
    fn wake(&self);

    /// A cloneable, lock-free stand-in for [`Self::wake`] usable without
    /// holding whatever exclusive access the caller otherwise requires to
    /// reach `&self`/`&mut self` on this backend.
    fn waker(&self) -> Waker;

    /// Block until a registered port fires, the wake handle fires, or
    /// `deadline` passes. `None` means wait indefinitely.
    fn wait(&mut self, deadline: Option<Instant>, scratch: usize) -> WaitOutcome;
}
