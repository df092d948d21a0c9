//! Task identity and status reporting.

use crate::{Key, EXIT_BROKEN_CONNECTION, EXIT_CONTAINER_SPAWN_FAILED, EXIT_CRITICAL_STREAM, EXIT_VERTEX_PROGRAM_FAILED, NONE_KEY};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one container instance of one graph across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub graph: Key,
    pub topology: Key,
}

impl TaskId {
    pub fn new(graph: Key, topology: Key) -> Self {
        Self { graph, topology }
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self {
            graph: NONE_KEY,
            topology: NONE_KEY,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.graph, self.topology)
    }
}

/// How a container process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    /// `exit()` with the given code.
    Exited(i32),
    /// Killed by the given signal.
    Signaled(i32),
}

impl ExitStatus {
    pub fn is_error(&self) -> bool {
        !matches!(self, ExitStatus::Exited(0))
    }

    /// Exit code, if the process exited rather than being signaled.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            ExitStatus::Signaled(_) => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ExitStatus::Exited(0) => write!(f, "exited ok"),
            ExitStatus::Exited(EXIT_BROKEN_CONNECTION) => write!(f, "broken connection"),
            ExitStatus::Exited(EXIT_CRITICAL_STREAM) => write!(f, "critical stream reached"),
            ExitStatus::Exited(EXIT_CONTAINER_SPAWN_FAILED) => write!(f, "container spawn failed"),
            ExitStatus::Exited(EXIT_VERTEX_PROGRAM_FAILED) => write!(f, "vertex program failed"),
            ExitStatus::Exited(code) => write!(f, "exited with code {code}"),
            ExitStatus::Signaled(sig) => write!(f, "terminated by signal {sig}"),
        }
    }
}

/// Status report an agent ships to the master when a task finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    /// Host label of the reporting agent.
    pub agent: String,
    pub status: ExitStatus,
}

impl TaskInfo {
    pub fn new(task_id: TaskId, agent: impl Into<String>, status: ExitStatus) -> Self {
        Self {
            task_id,
            agent: agent.into(),
            status,
        }
    }

    pub fn has_error(&self) -> bool {
        self.status.is_error()
    }
}

impl fmt::Display for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} on {}: {}", self.task_id, self.agent, self.status)
    }
}

/// Final per-graph report sent to a submit-mode client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Solution {
    pub graph: Key,
    /// Errno-style code describing a cluster-level failure, zero when the
    /// graph ran to completion (individual tasks may still have failed).
    pub errc: i32,
    pub taskinfos: Vec<TaskInfo>,
}

impl Solution {
    pub fn new(graph: Key) -> Self {
        Self {
            graph,
            errc: 0,
            taskinfos: Vec::new(),
        }
    }

    pub fn num_errors(&self) -> usize {
        self.taskinfos.iter().filter(|t| t.has_error()).count()
    }

    /// Worst exit code across the solution, for client process exit.
    pub fn worst_exit_code(&self) -> i32 {
        self.taskinfos
            .iter()
            .map(|t| t.status.code().unwrap_or(1))
            .max()
            .unwrap_or(if self.errc == 0 { 0 } else { 1 })
    }
}

impl fmt::Display for Solution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "solution for graph {} ({} tasks, {} errors, errc={})",
            self.graph,
            self.taskinfos.len(),
            self.num_errors(),
            self.errc
        )?;
        for info in &self.taskinfos {
            writeln!(f, "  {info}")?;
        }
        Ok(())
    }
}
