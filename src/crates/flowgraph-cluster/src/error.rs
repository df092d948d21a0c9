//! Error types for the cluster runtime.

use thiserror::Error;

/// Convenience result type using [`ClusterError`].
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Errors raised by the master, agents and the container supervisor.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("runtime core error: {0}")]
    Core(#[from] flowgraph_core::CoreError),

    #[error("codec error: {0}")]
    Codec(#[from] flowgraph_protocol::CodecError),

    /// Container process handling failed.
    #[error("container error: {0}")]
    Container(String),

    /// A control-group file could not be read or written.
    #[error("control group '{path}': {source}")]
    CGroup {
        path: String,
        source: std::io::Error,
    },

    /// A task or peer the operation named is unknown.
    #[error("unknown {kind} '{name}'")]
    Unknown { kind: &'static str, name: String },
}

impl ClusterError {
    pub fn from_errno(errno: nix::errno::Errno) -> Self {
        ClusterError::Io(std::io::Error::from_raw_os_error(errno as i32))
    }

    pub fn unknown(kind: &'static str, name: impl ToString) -> Self {
        ClusterError::Unknown {
            kind,
            name: name.to_string(),
        }
    }
}
