//! Serializable snapshot of a graph or one container's slice of it.
//!
//! A whole graph serializes with `topology == NONE_KEY`. After placement the
//! master calls [`Topology::extract`] once per container to obtain the
//! sub-topology shipped to the hosting agent: exactly the vertices assigned
//! to that container plus every stream incident to at least one of them.
//! Streams whose far endpoint falls outside the slice keep their key but
//! lose the foreign vertex, which is how a stream becomes inter-container.

use crate::message::Direction;
use crate::resource::Resource;
use crate::runtime::Runtime;
use crate::task::TaskId;
use crate::{Key, NONE_KEY};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One vertex entry of a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexSpec {
    pub key: Key,
    /// Container this vertex is assigned to.
    pub container: Key,
}

/// One stream entry of a topology.
///
/// `tail` writes, `head` reads. Either endpoint may be `NONE_KEY` in an
/// extracted sub-topology, meaning the far side lives in another container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub key: Key,
    pub tail: Key,
    pub head: Key,
}

/// One container entry of a topology.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub key: Key,
    pub resource: Resource,
    pub configs: HashMap<String, String>,
}

/// Serializable description of part or all of a graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub graph: Key,
    /// Container key this slice belongs to; `NONE_KEY` for a whole graph.
    pub topology: Key,
    pub runtime: Runtime,
    pub vertices: HashMap<Key, VertexSpec>,
    pub streams: HashMap<Key, StreamSpec>,
    pub containers: HashMap<Key, ContainerSpec>,
}

impl Topology {
    pub fn new(graph: Key, topology: Key) -> Self {
        Self {
            graph,
            topology,
            ..Default::default()
        }
    }

    pub fn task_id(&self) -> TaskId {
        TaskId::new(self.graph, self.topology)
    }

    pub fn has_vertex(&self, key: Key) -> bool {
        self.vertices.contains_key(&key)
    }

    pub fn has_stream(&self, key: Key) -> bool {
        self.streams.contains_key(&key)
    }

    pub fn has_container(&self, key: Key) -> bool {
        self.containers.contains_key(&key)
    }

    /// Both endpoints of the stream live in this topology.
    pub fn is_intra_stream(&self, key: Key) -> bool {
        self.streams
            .get(&key)
            .map(|s| self.has_vertex(s.tail) && self.has_vertex(s.head))
            .unwrap_or(false)
    }

    /// Exactly one endpoint of the stream lives in this topology.
    pub fn is_inter_stream(&self, key: Key) -> bool {
        self.streams
            .get(&key)
            .map(|s| self.has_vertex(s.tail) != self.has_vertex(s.head))
            .unwrap_or(false)
    }

    /// Local direction of an inter-container stream: [`Direction::Out`] when
    /// the writer is local, [`Direction::In`] when the reader is.
    pub fn inter_stream_direction(&self, key: Key) -> Option<Direction> {
        let stream = self.streams.get(&key)?;
        match (self.has_vertex(stream.tail), self.has_vertex(stream.head)) {
            (true, false) => Some(Direction::Out),
            (false, true) => Some(Direction::In),
            _ => None,
        }
    }

    pub fn num_inter_streams(&self) -> usize {
        self.streams
            .keys()
            .filter(|k| self.is_inter_stream(**k))
            .count()
    }

    pub fn num_intra_streams(&self) -> usize {
        self.streams
            .keys()
            .filter(|k| self.is_intra_stream(**k))
            .count()
    }

    /// Total resource demand across all containers.
    pub fn resource(&self) -> Resource {
        let mut total = Resource::default();
        for container in self.containers.values() {
            total.give(&container.resource);
        }
        total
    }

    /// Sub-topology for one container: its vertices plus every incident
    /// stream. The runtime is carried over so per-graph settings (stdout
    /// endpoints, submit argv) reach the hosting agent.
    pub fn extract(&self, container: Key) -> Topology {
        let mut sub = Topology::new(self.graph, container);
        sub.runtime = self.runtime.clone();

        for (key, vertex) in &self.vertices {
            if vertex.container == container {
                sub.vertices.insert(*key, *vertex);
            }
        }

        for (key, stream) in &self.streams {
            if sub.has_vertex(stream.tail) || sub.has_vertex(stream.head) {
                sub.streams.insert(*key, *stream);
            }
        }

        if let Some(spec) = self.containers.get(&container) {
            sub.containers.insert(container, spec.clone());
        }

        sub
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "topology {} of graph {}: {} vertices, {} streams ({} inter), {} containers",
            self.topology,
            self.graph,
            self.vertices.len(),
            self.streams.len(),
            self.num_inter_streams(),
            self.containers.len()
        )
    }
}

/// Whether this topology describes a whole, unpartitioned graph.
impl Topology {
    pub fn is_whole_graph(&self) -> bool {
        self.topology == NONE_KEY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Two containers: c0 = {v0, v1}, c1 = {v2}; streams v0->v1 (intra c0),
    // v1->v2 and v2->v0 (inter).
    fn sample() -> Topology {
        let mut t = Topology::new(9, NONE_KEY);
        for (v, c) in [(0, 0), (1, 0), (2, 1)] {
            t.vertices.insert(v, VertexSpec { key: v, container: c });
        }
        for (s, tail, head) in [(10, 0, 1), (11, 1, 2), (12, 2, 0)] {
            t.streams.insert(s, StreamSpec { key: s, tail, head });
        }
        for c in [0, 1] {
            t.containers.insert(
                c,
                ContainerSpec {
                    key: c,
                    resource: Resource::new(1, 1 << 20, 0),
                    configs: HashMap::new(),
                },
            );
        }
        t
    }

    #[test]
    fn whole_graph_has_no_inter_streams() {
        let t = sample();
        assert!(t.is_whole_graph());
        assert_eq!(t.num_inter_streams(), 0);
        assert_eq!(t.num_intra_streams(), 3);
    }

    #[test]
    fn extract_keeps_assigned_vertices_and_incident_streams() {
        let t = sample();

        let c0 = t.extract(0);
        assert_eq!(c0.topology, 0);
        assert!(c0.has_vertex(0) && c0.has_vertex(1) && !c0.has_vertex(2));
        // All three streams touch c0.
        assert_eq!(c0.streams.len(), 3);
        assert!(c0.is_intra_stream(10));
        assert!(c0.is_inter_stream(11));
        assert!(c0.is_inter_stream(12));
        assert_eq!(c0.inter_stream_direction(11), Some(Direction::Out));
        assert_eq!(c0.inter_stream_direction(12), Some(Direction::In));

        let c1 = t.extract(1);
        assert!(c1.has_vertex(2) && c1.vertices.len() == 1);
        assert_eq!(c1.streams.len(), 2);
        assert!(c1.is_inter_stream(11) && c1.is_inter_stream(12));
        assert_eq!(c1.inter_stream_direction(11), Some(Direction::In));
        assert_eq!(c1.inter_stream_direction(12), Some(Direction::Out));
    }

    #[test]
    fn extract_carries_only_its_container() {
        let t = sample();
        let c1 = t.extract(1);
        assert!(c1.has_container(1) && !c1.has_container(0));
        assert_eq!(c1.task_id(), TaskId::new(9, 1));
    }

    #[test]
    fn resource_sums_container_demands() {
        let t = sample();
        let total = t.resource();
        assert_eq!(total.num_cpus, 2);
        assert_eq!(total.memory_limit_in_bytes, 2 << 20);
    }
}
