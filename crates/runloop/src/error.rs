//! error
use std::{error, fmt, io};

/// Failure modes that are genuinely fatal to the engine's contract, as
/// opposed to the silent no-ops the rest of the registration surface uses
/// (see the crate's top-level docs on error handling).
#[derive(Debug)]
pub enum LoopError {
    /// The wait backend could not allocate the kernel primitives it needs
    /// (an event/pipe for the wake handle, a waitable object for a port
    /// source). The loop cannot satisfy its contract without one.
    Backend(io::Error),
    /// A lock guarding shared loop state was poisoned by a panicking
    /// callback on another thread.
    Poisoned,
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "wait backend error => {e}"),
            Self::Poisoned => write!(f, "loop lock poisoned by a panicking callback"),
        }
    }
}

impl error::Error for LoopError {}

impl From<io::Error> for LoopError {
    fn from(value: io::Error) -> Self {
        Self::Backend(value)
    }
}
