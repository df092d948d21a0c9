//! Wire protocol for the FlowGraph runtime.
//!
//! Every control message exchanged between masters, agents, executors and
//! graph clients is a single tagged value of the [`Message`] sum type,
//! serialized through the length-prefixed binary [`codec`]. The same codec
//! carries user records over data streams, so anything `serde` can derive
//! travels between vertices unchanged.
//!
//! The crate is deliberately free of I/O: it defines values and their
//! encoding, nothing else. The runtime crates own the sockets.

pub mod codec;
pub mod message;
pub mod resource;
pub mod runtime;
pub mod task;
pub mod topology;

pub use codec::{decode_frame, encode_frame, CodecError, FRAME_HEADER_LEN};
pub use message::{BrokenIo, Direction, FrontierPacket, KillTask, LoadInfo, Message};
pub use resource::Resource;
pub use runtime::{execution_mode_from_env, ExecutionMode, Runtime};
pub use task::{ExitStatus, Solution, TaskId, TaskInfo};
pub use topology::{ContainerSpec, StreamSpec, Topology, VertexSpec};

/// Process-local identifier for vertices, streams, containers and graphs.
///
/// Keys are dense: each graph hands them out from a monotonic counter.
pub type Key = i32;

/// Sentinel for an unassigned key.
pub const NONE_KEY: Key = -1;

/// Executor exited cleanly.
pub const EXIT_OK: i32 = 0;
/// The connection to the master or agent broke.
pub const EXIT_BROKEN_CONNECTION: i32 = 100;
/// A stream flagged critical reached end-of-file.
pub const EXIT_CRITICAL_STREAM: i32 = 101;
/// The container supervisor failed to spawn the executor.
pub const EXIT_CONTAINER_SPAWN_FAILED: i32 = 102;
/// An external vertex program could not be launched.
pub const EXIT_VERTEX_PROGRAM_FAILED: i32 = 103;
