//! # flowgraph-cluster
//!
//! Cluster side of the FlowGraph runtime: the [`master`] coordinator that
//! queues and places submitted graphs, the per-host [`agent`] that hatches
//! tasks and matches frontiers, and the [`container`] supervisor that runs
//! one executor process under a [`cgroup`] with inherited stream fds.

pub mod agent;
pub mod cgroup;
pub mod container;
pub mod error;
pub mod master;
pub mod placer;
pub mod probe;
pub mod scheduler;

pub use agent::{Agent, AgentConfig};
pub use cgroup::ControlGroup;
pub use container::Container;
pub use error::{ClusterError, Result};
pub use master::Master;
pub use placer::Placer;
