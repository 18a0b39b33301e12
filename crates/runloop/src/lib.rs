//! A per-thread event loop.
//!
//! A [`Loop`] is bound to exactly one OS thread. It multiplexes three kinds
//! of work across one or more named [`Mode`]s: manually- or port-signalled
//! sources, deadline-based [`Timer`]s, and phase-notified [`Observer`]s. Only
//! items registered in the mode currently being run are serviced, which lets
//! a caller temporarily exclude classes of work (for example, suspending
//! normal event delivery while a modal dialog runs its own mode).
//!
//! See [`Loop::run_in_mode`] for the engine's dispatch algorithm.

mod clock;
mod engine;
mod error;
mod mode;
mod observer;
mod options;
mod perform;
mod registry;
mod source;
mod timer;
mod wait;

pub use clock::{Clock, MonotonicClock};
pub use engine::{Loop, RunResult, DEFAULT_MODE_NAME};
pub use error::LoopError;
pub use mode::{Mode, ModeName, COMMON_MODE_NAME};
pub use observer::{Activity, Observer, ObserverHandle};
pub use options::{LoopOptions, WaitBackendKind};
pub use perform::enqueue;
pub use source::{Message, Source, SourceHandle};
pub use timer::{Timer, TimerHandle};
pub use wait::RawWaitable;
