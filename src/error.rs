//! Error types for the multiplexer.

use std::io;
use std::os::unix::io::RawFd;

/// Errors returned by [`Listener`](crate::Listener) operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A socket with this file descriptor is already registered.
    ///
    /// The original registration is left intact and functional.
    #[error("file descriptor {0} is already registered")]
    AlreadyRegistered(RawFd),

    /// No free socket slots available.
    #[error("socket limit reached")]
    SocketLimitReached,

    /// The listener has been shut down and cannot be reused.
    #[error("listener has been shut down")]
    ShutDown,

    /// An OS-level I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias for listener operations.
pub type Result<T> = std::result::Result<T, Error>;
