//! Typed error hierarchy for the debugger core.
//!
//! Every fallible operation in this crate returns [`Result<T>`], an alias
//! over [`CoreError`]. Callers above the core (the UI layer) match on the
//! error kind to decide whether to retry, roll back their own state, or
//! just surface a message -- `NotAttached` and `Timeout` in particular are
//! routinely handled rather than merely logged, so this is a real enum and
//! not a boxed string.

use crate::address::{Address, Tid};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("operation requires an attached process")]
    NotAttached,

    #[error("a process is already attached")]
    AlreadyAttached,

    #[error("OS call failed with errno {0}")]
    OsError(i32),

    #[error("failed to spawn traced process: {0}")]
    SpawnFailed(String),

    #[error("unexpected first event after spawn/attach: {0}")]
    UnexpectedFirstEvent(String),

    #[error("thread {0} is not registered")]
    UnknownThread(Tid),

    #[error("address {0} is not mapped")]
    AddressUnmapped(Address),

    #[error("failed to decode an instruction at {0}")]
    DisassemblyFailed(Address),

    #[error("operation timed out")]
    Timeout,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CoreError {
    /// Wraps the current `errno` as reported by `libc`.
    pub fn from_errno() -> CoreError {
        CoreError::OsError(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    pub fn os(err: nix::Error) -> CoreError {
        CoreError::OsError(err as i32)
    }
}
