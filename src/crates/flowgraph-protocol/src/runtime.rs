//! Per-graph runtime settings and the environment contract to child
//! executors.
//!
//! A [`Runtime`] is an ordered string map serialized inside every
//! [`Topology`](crate::Topology). A handful of reserved names carry the
//! plumbing a child executor needs to reconstruct its context: execution
//! mode, the submit binary and argv, inherited bridge fds, the master
//! endpoint, the control-channel fd, the vertex-to-host map and the stdio
//! forwarding endpoints. Everything else is user environment passed through
//! verbatim.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Reserved environment names. Children read exactly these.
pub const ENV_EXECUTION_MODE: &str = "FLOWGRAPH_EXECUTION_MODE";
pub const ENV_SUBMIT_FILE: &str = "FLOWGRAPH_SUBMIT_FILE";
pub const ENV_SUBMIT_ARGV: &str = "FLOWGRAPH_SUBMIT_ARGV";
pub const ENV_BRIDGES: &str = "FLOWGRAPH_BRIDGES";
pub const ENV_MASTER_ENDPOINT: &str = "FLOWGRAPH_MASTER_ENDPOINT";
pub const ENV_CONTROL_FD: &str = "FLOWGRAPH_CONTROL_FD";
pub const ENV_GRAPH_ID: &str = "FLOWGRAPH_GRAPH_ID";
pub const ENV_TOPOLOGY_ID: &str = "FLOWGRAPH_TOPOLOGY_ID";
pub const ENV_VERTEX_HOSTS: &str = "FLOWGRAPH_VERTEX_HOSTS";
pub const ENV_FRONTIER_ENDPOINT: &str = "FLOWGRAPH_FRONTIER_ENDPOINT";
pub const ENV_FRONTIER_FDS: &str = "FLOWGRAPH_FRONTIER_FDS";
pub const ENV_STDOUT_ENDPOINT: &str = "FLOWGRAPH_STDOUT_ENDPOINT";
pub const ENV_STDERR_ENDPOINT: &str = "FLOWGRAPH_STDERR_ENDPOINT";
pub const ENV_CGROUP_ROOT: &str = "FLOWGRAPH_CGROUP_ROOT";

/// How an executor process interprets the graph handed to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Run the whole graph in this process, no cluster involved.
    #[default]
    Local,
    /// Act as the graph's client: ship the topology to a master and wait
    /// for the solution.
    Submit,
    /// Run one container of a placed topology under an agent.
    Distributed,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOCAL" => Ok(ExecutionMode::Local),
            "SUBMIT" => Ok(ExecutionMode::Submit),
            "DISTRIBUTED" => Ok(ExecutionMode::Distributed),
            other => Err(format!("unknown execution mode '{other}'")),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Local => write!(f, "LOCAL"),
            ExecutionMode::Submit => write!(f, "SUBMIT"),
            ExecutionMode::Distributed => write!(f, "DISTRIBUTED"),
        }
    }
}

/// Current process execution mode, read from the environment.
pub fn execution_mode_from_env() -> ExecutionMode {
    std::env::var(ENV_EXECUTION_MODE)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

/// Master endpoint this process should dial, with a loopback default.
pub fn master_endpoint_from_env() -> String {
    std::env::var(ENV_MASTER_ENDPOINT).unwrap_or_else(|_| "127.0.0.1:6499".to_string())
}

/// Externally reachable address of this host.
pub fn this_host() -> String {
    std::env::var("FLOWGRAPH_THIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// Ordered environment map carried by a topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runtime {
    envs: BTreeMap<String, String>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current process environment.
    pub fn from_process_env() -> Self {
        let mut runtime = Self::default();
        runtime.merge_process_env();
        runtime
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.envs.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn remove(&mut self, key: &str) -> &mut Self {
        self.envs.remove(key);
        self
    }

    /// Fold the current process environment underneath this runtime:
    /// existing runtime entries win over inherited ones.
    pub fn merge_process_env(&mut self) -> &mut Self {
        for (key, value) in std::env::vars() {
            self.envs.entry(key).or_insert(value);
        }
        self
    }

    /// Environment pairs for `std::process::Command::envs`.
    pub fn envs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    // ---- typed accessors for the reserved names ------------------------

    pub fn execution_mode(&self) -> ExecutionMode {
        self.get(ENV_EXECUTION_MODE)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    pub fn set_execution_mode(&mut self, mode: ExecutionMode) -> &mut Self {
        self.set(ENV_EXECUTION_MODE, mode.to_string())
    }

    pub fn submit_file(&self) -> Option<&str> {
        self.get(ENV_SUBMIT_FILE)
    }

    pub fn set_submit_file(&mut self, file: impl Into<String>) -> &mut Self {
        self.set(ENV_SUBMIT_FILE, file.into())
    }

    pub fn submit_argv(&self) -> Option<&str> {
        self.get(ENV_SUBMIT_ARGV)
    }

    pub fn set_submit_argv(&mut self, argv: impl Into<String>) -> &mut Self {
        self.set(ENV_SUBMIT_ARGV, argv.into())
    }

    pub fn master_endpoint(&self) -> Option<&str> {
        self.get(ENV_MASTER_ENDPOINT)
    }

    pub fn set_master_endpoint(&mut self, endpoint: impl Into<String>) -> &mut Self {
        self.set(ENV_MASTER_ENDPOINT, endpoint.into())
    }

    pub fn control_fd(&self) -> Option<i32> {
        self.get(ENV_CONTROL_FD).and_then(|v| v.parse().ok())
    }

    pub fn set_control_fd(&mut self, fd: i32) -> &mut Self {
        self.set(ENV_CONTROL_FD, fd.to_string())
    }

    pub fn remove_control_fd(&mut self) -> &mut Self {
        self.remove(ENV_CONTROL_FD)
    }

    /// Bridge fd mapping handed to external vertex programs:
    /// space-separated `tag-or-key:fd` pairs.
    pub fn bridges(&self) -> Vec<(String, i32)> {
        parse_pairs(self.get(ENV_BRIDGES).unwrap_or(""))
    }

    pub fn set_bridges(&mut self, pairs: &str) -> &mut Self {
        self.set(ENV_BRIDGES, pairs)
    }

    /// Frontier fd mapping for a distributed child: `stream_key:fd` pairs.
    pub fn frontier_fds(&self) -> Vec<(i32, i32)> {
        parse_pairs(self.get(ENV_FRONTIER_FDS).unwrap_or(""))
            .into_iter()
            .filter_map(|(k, fd)| k.parse().ok().map(|k| (k, fd)))
            .collect()
    }

    pub fn set_frontier_fds(&mut self, pairs: &str) -> &mut Self {
        self.set(ENV_FRONTIER_FDS, pairs)
    }

    pub fn remove_frontier_fds(&mut self) -> &mut Self {
        self.remove(ENV_FRONTIER_FDS)
    }

    /// Vertex-to-host rendezvous map: space-separated `vkey=host:port`.
    pub fn vertex_hosts(&self) -> BTreeMap<i32, String> {
        let mut hosts = BTreeMap::new();
        for entry in self
            .get(ENV_VERTEX_HOSTS)
            .unwrap_or("")
            .split_whitespace()
        {
            if let Some((key, host)) = entry.split_once('=') {
                if let Ok(key) = key.parse() {
                    hosts.insert(key, host.to_string());
                }
            }
        }
        hosts
    }

    pub fn set_vertex_hosts(&mut self, rendered: impl Into<String>) -> &mut Self {
        self.set(ENV_VERTEX_HOSTS, rendered.into())
    }

    pub fn remove_vertex_hosts(&mut self) -> &mut Self {
        self.remove(ENV_VERTEX_HOSTS)
    }

    pub fn frontier_endpoint(&self) -> Option<&str> {
        self.get(ENV_FRONTIER_ENDPOINT)
    }

    pub fn set_frontier_endpoint(&mut self, endpoint: impl Into<String>) -> &mut Self {
        self.set(ENV_FRONTIER_ENDPOINT, endpoint.into())
    }

    pub fn stdout_endpoint(&self) -> Option<&str> {
        self.get(ENV_STDOUT_ENDPOINT)
    }

    pub fn set_stdout_endpoint(&mut self, endpoint: impl Into<String>) -> &mut Self {
        self.set(ENV_STDOUT_ENDPOINT, endpoint.into())
    }

    pub fn stderr_endpoint(&self) -> Option<&str> {
        self.get(ENV_STDERR_ENDPOINT)
    }

    pub fn set_stderr_endpoint(&mut self, endpoint: impl Into<String>) -> &mut Self {
        self.set(ENV_STDERR_ENDPOINT, endpoint.into())
    }

    pub fn graph_id(&self) -> Option<i32> {
        self.get(ENV_GRAPH_ID).and_then(|v| v.parse().ok())
    }

    pub fn topology_id(&self) -> Option<i32> {
        self.get(ENV_TOPOLOGY_ID).and_then(|v| v.parse().ok())
    }

    pub fn set_task_id(&mut self, graph: i32, topology: i32) -> &mut Self {
        self.set(ENV_GRAPH_ID, graph.to_string());
        self.set(ENV_TOPOLOGY_ID, topology.to_string())
    }
}

/// Render `name:fd` pairs the way [`Runtime::bridges`] parses them.
pub fn render_fd_pairs<'a>(pairs: impl Iterator<Item = (&'a str, i32)>) -> String {
    let mut out = String::new();
    for (name, fd) in pairs {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(name);
        out.push(':');
        out.push_str(&fd.to_string());
    }
    out
}

// Tags may themselves contain ':', fds never do, so split on the last one.
fn parse_pairs(raw: &str) -> Vec<(String, i32)> {
    raw.split_whitespace()
        .filter_map(|entry| {
            let (name, fd) = entry.rsplit_once(':')?;
            Some((name.to_string(), fd.parse().ok()?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_mode_parses_reserved_values() {
        assert_eq!("LOCAL".parse::<ExecutionMode>().unwrap(), ExecutionMode::Local);
        assert_eq!("SUBMIT".parse::<ExecutionMode>().unwrap(), ExecutionMode::Submit);
        assert_eq!(
            "DISTRIBUTED".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::Distributed
        );
        assert!("local".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn bridges_round_trip_through_rendering() {
        let rendered = render_fd_pairs([("sensor", 7), ("12", 9)].into_iter());
        let mut runtime = Runtime::new();
        runtime.set_bridges(&rendered);
        assert_eq!(
            runtime.bridges(),
            vec![("sensor".to_string(), 7), ("12".to_string(), 9)]
        );
    }

    #[test]
    fn vertex_hosts_parse_host_port_values() {
        let mut runtime = Runtime::new();
        runtime.set_vertex_hosts("3=node1:6000 5=node2:6001");
        let hosts = runtime.vertex_hosts();
        assert_eq!(hosts.get(&3).map(String::as_str), Some("node1:6000"));
        assert_eq!(hosts.get(&5).map(String::as_str), Some("node2:6001"));
    }

    #[test]
    fn runtime_entries_win_over_inherited_environment() {
        std::env::set_var("FLOWGRAPH_TEST_MERGE", "inherited");
        let mut runtime = Runtime::new();
        runtime.set("FLOWGRAPH_TEST_MERGE", "explicit");
        runtime.merge_process_env();
        assert_eq!(runtime.get("FLOWGRAPH_TEST_MERGE"), Some("explicit"));
        std::env::remove_var("FLOWGRAPH_TEST_MERGE");
    }

    #[test]
    fn frontier_fds_ignore_malformed_entries() {
        let mut runtime = Runtime::new();
        runtime.set_frontier_fds("4:11 junk 9:12");
        assert_eq!(runtime.frontier_fds(), vec![(4, 11), (9, 12)]);
    }
}
