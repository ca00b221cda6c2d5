//! Error types for shell sessions

use thiserror::Error;

/// Unified error type for shell sessions
#[derive(Error, Debug)]
pub enum Error {
    /// No shell binary could be started
    #[error("failed to spawn shell: {reason}")]
    SpawnFailed {
        /// The reason for the spawn failure
        reason: String,
    },

    /// An operation was attempted on a shell that is not connected
    #[error("shell is not connected (id: {id})")]
    NotConnected {
        /// Id of the connection the operation was attempted on
        id: u32,
    },

    /// A command did not produce its full output before the deadline
    ///
    /// The command itself keeps running inside the shell process; there is no
    /// way to cancel it over a plain pipe. Callers should treat the
    /// connection as tainted and recycle it.
    #[error("command timed out after {millis}ms")]
    Timeout {
        /// The configured deadline in milliseconds
        millis: u64,
    },

    /// The shell process exited while a command was waiting for output
    #[error("connection lost while waiting for command output (id: {id})")]
    ConnectionLost {
        /// Id of the connection that dropped
        id: u32,
    },

    /// Writing a command to the shell's stdin pipe failed
    #[error("failed to write to the shell's input pipe (id: {id})")]
    WriteFailed {
        /// Id of the connection the write was attempted on
        id: u32,
    },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// For convenience, re-export specific error constructors
impl Error {
    /// Create a spawn failed error
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            reason: reason.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
