use std::fmt;
use std::io;

/// Errors surfaced by runtime operations.
///
/// Programming errors (calling owner-thread-only operations from the
/// wrong thread, using a stale node handle) are contract violations and
/// are enforced with assertions instead of error values.
#[derive(Debug)]
pub enum Error {
    /// A kernel call failed; carries the OS error it failed with.
    Sys(io::Error),
}

impl Error {
    /// Capture `errno` from the most recent failed kernel call.
    pub fn last_os_error() -> Self {
        Error::Sys(io::Error::last_os_error())
    }

    /// The raw OS error code, when one is attached.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Sys(e) => e.raw_os_error(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Sys(e) => write!(f, "system error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Sys(e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Sys(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
