//! Error taxonomy (spec'd in four tiers):
//!
//! - Expected negative outcomes (disabled event, full buffer, exhausted
//!   budget, oversized payload) are never errors — callers get `bool` or
//!   `Option`.
//! - Soft errors (short writes, sink failures) are recorded on the
//!   session and surface only through `Session::has_errors` /
//!   `disable()`; producers never see them.
//! - Invariant violations panic in debug builds and abort in release
//!   (`debug_assert!`/`assert!` at the call site, not a `Result`).
//! - Startup/resource failures (can't open the output file, can't map a
//!   buffer) are the only thing this module models explicitly.

use std::fmt;

/// A setup-time failure: opening a sink, mapping a buffer, spawning the
/// streaming thread. Surfaced to the caller of `facade::enable`, never to
/// a producer thread.
#[derive(Debug)]
pub enum SetupError {
    Io(std::io::Error),
    TooManySessions,
    InvalidProviderConfig(String),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::Io(e) => write!(f, "i/o error: {e}"),
            SetupError::TooManySessions => write!(f, "no free session slot (max 64)"),
            SetupError::InvalidProviderConfig(s) => write!(f, "invalid provider config: {s}"),
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SetupError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SetupError {
    fn from(e: std::io::Error) -> Self {
        SetupError::Io(e)
    }
}

pub type SetupResult<T> = Result<T, SetupError>;
