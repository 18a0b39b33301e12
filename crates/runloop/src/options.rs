//! options
//!
//! Construction-time configuration for a [`crate::Loop`]. Mirrors the shape
//! of `TimerThreadpoolOptions` from the threadpool timer module this crate
//! grew out of: a small `Default`-able struct of the handful of choices an
//! embedder legitimately has, rather than a sprawling builder.

/// Which [`crate::wait::WaitBackend`] implementation a [`crate::Loop`] should
/// construct for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitBackendKind {
    /// The real OS-backed wait set (epoll/poll on unix, `WaitForMultipleObjects`
    /// on Windows).
    Native,
    /// A deterministic in-memory backend with no OS dependency, driven by
    /// tests and embedders that want a reproducible harness. See the Design
    /// Notes' suggestion that "a test harness can use an in-memory event
    /// queue to drive the engine deterministically."
    InMemory,
}

impl Default for WaitBackendKind {
    fn default() -> Self {
        Self::Native
    }
}

/// Configure a [`crate::Loop`] at construction time.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// Which wait backend to build.
    pub backend: WaitBackendKind,
    /// Capacity of the wake-handle's pending-wakeup queue (native unix
    /// backend only; Windows events and the in-memory backend coalesce
    /// wakeups without a bound).
    pub wake_capacity: usize,
    /// Initial size, in bytes, of the scratch buffer a port source's message
    /// is received into. Mirrors CFRunLoop's inline `uint8_t buffer[1024 +
    /// 80]`; grown on demand if a backend reports the message didn't fit.
    pub scratch_buffer: usize,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            backend: WaitBackendKind::default(),
            wake_capacity: 8,
            scratch_buffer: 1024 + 80,
        }
    }
}
