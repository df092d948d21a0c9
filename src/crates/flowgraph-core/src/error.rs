//! Error types for the runtime core.

use flowgraph_protocol::{BrokenIo, Key};
use thiserror::Error;

/// Convenience result type using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the reactor, the stream layer and the executor.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Underlying system call failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] flowgraph_protocol::CodecError),

    /// A stream direction broke (peer EOF or I/O failure).
    #[error("{0}")]
    Broken(BrokenIo),

    /// The reactor behind a handle is gone.
    #[error("reactor has shut down")]
    Terminated,

    /// An operation that only the reactor owner thread may perform was
    /// attempted from another thread.
    #[error("operation restricted to the reactor owner thread")]
    NotOwner,

    /// A graph lookup used a key that does not exist.
    #[error("invalid key {0}")]
    InvalidKey(Key),

    /// A builder precondition failed (duplicate endpoint, missing vertex).
    #[error("graph construction error: {0}")]
    Build(String),

    /// An external vertex program could not be launched.
    #[error("failed to spawn vertex program '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// The distributed context handed to this executor is incomplete.
    #[error("incomplete executor context: {0}")]
    Context(String),
}

impl CoreError {
    /// Map a raw OS errno into an I/O error.
    pub fn from_errno(errno: i32) -> Self {
        CoreError::Io(std::io::Error::from_raw_os_error(errno))
    }
}
