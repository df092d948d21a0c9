//! Declarative dataflow graph and its fluent builders.
//!
//! A [`Graph`] is evaluated before execution: vertices, streams, probers and
//! containers are declared through builders that share the graph, so they
//! can be kept around and refined in any order. Keys are dense, handed out
//! by a per-graph monotonic counter, and become the identifiers used on the
//! wire after [`Graph::topologize`].
//!
//! ```no_run
//! use flowgraph_core::graph::Graph;
//! use flowgraph_core::reactor::Signal;
//!
//! let g = Graph::new();
//! let a = g.vertex();
//! let b = g.vertex();
//! let ab = g.stream(&a, &b).on_istream(|_vertex, is| {
//!     if let Ok(Some(msg)) = is.recv::<String>() {
//!         println!("got {msg}");
//!         return Signal::Remove;
//!     }
//!     Signal::Default
//! });
//! let ab_key = ab.key();
//! a.on_enter(move |v| {
//!     v.send(ab_key, &"hello".to_string()).unwrap();
//! });
//! ```

mod vertex;

pub use vertex::Vertex;

use crate::error::{CoreError, Result};
use crate::reactor::Signal;
use crate::stream::{InputStream, OutputStream};
use flowgraph_protocol::{
    ContainerSpec, Key, Resource, StreamSpec, Topology, VertexSpec, NONE_KEY,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One-shot callback run when a vertex first becomes active.
pub type VertexCallback = Box<dyn FnOnce(&mut Vertex) + Send>;
/// Per-event read callback of a stream.
pub type StreamReadCallback = Box<dyn FnMut(&mut Vertex, &InputStream) -> Signal + Send>;
/// Per-event write callback of a stream.
pub type StreamWriteCallback = Box<dyn FnMut(&mut Vertex, &OutputStream) -> Signal + Send>;
/// Periodic callback of a prober.
pub type ProberCallback = Box<dyn FnMut(&mut Vertex) -> Signal + Send>;

pub(crate) struct VertexNode {
    pub key: Key,
    pub tag: Option<String>,
    pub on_enter: Option<VertexCallback>,
    pub program: Option<String>,
    pub envs: Vec<(String, String)>,
}

pub(crate) struct StreamNode {
    pub key: Key,
    pub tail: Key,
    pub head: Key,
    pub tag: Option<String>,
    pub critical: bool,
    pub on_istream: Option<StreamReadCallback>,
    pub on_ostream: Option<StreamWriteCallback>,
}

pub(crate) struct ProberNode {
    pub key: Key,
    pub vertex: Key,
    pub period: Duration,
    pub on: Option<ProberCallback>,
}

pub(crate) struct ContainerNode {
    pub key: Key,
    pub resource: Resource,
    pub configs: HashMap<String, String>,
    pub members: Vec<Key>,
}

#[derive(Default)]
pub(crate) struct GraphInner {
    counter: Key,
    pub vertices: HashMap<Key, VertexNode>,
    pub streams: HashMap<Key, StreamNode>,
    pub probers: HashMap<Key, ProberNode>,
    pub containers: HashMap<Key, ContainerNode>,
}

impl GraphInner {
    fn allocate(&mut self) -> Key {
        let key = self.counter;
        self.counter += 1;
        key
    }
}

/// Build-time description of a dataflow.
///
/// Cheap to clone into builders; consumed by an
/// [`Executor`](crate::executor::Executor) when the graph runs.
#[derive(Clone, Default)]
pub struct Graph {
    inner: Arc<Mutex<GraphInner>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a vertex.
    pub fn vertex(&self) -> VertexBuilder {
        let mut inner = self.inner.lock();
        let key = inner.allocate();
        inner.vertices.insert(
            key,
            VertexNode {
                key,
                tag: None,
                on_enter: None,
                program: None,
                envs: Vec::new(),
            },
        );
        VertexBuilder {
            graph: self.inner.clone(),
            key,
        }
    }

    /// Declare a directed stream from `tail` to `head`.
    pub fn stream(&self, tail: impl Into<Key>, head: impl Into<Key>) -> StreamBuilder {
        let (tail, head) = (tail.into(), head.into());
        let mut inner = self.inner.lock();
        let key = inner.allocate();
        inner.streams.insert(
            key,
            StreamNode {
                key,
                tail,
                head,
                tag: None,
                critical: false,
                on_istream: None,
                on_ostream: None,
            },
        );
        StreamBuilder {
            graph: self.inner.clone(),
            key,
        }
    }

    /// Attach a time-driven prober to `vertex`.
    pub fn prober(&self, vertex: impl Into<Key>) -> ProberBuilder {
        let vertex = vertex.into();
        let mut inner = self.inner.lock();
        let key = inner.allocate();
        inner.probers.insert(
            key,
            ProberNode {
                key,
                vertex,
                period: Duration::ZERO,
                on: None,
            },
        );
        ProberBuilder {
            graph: self.inner.clone(),
            key,
        }
    }

    /// Declare a container with resource demands and member vertices.
    pub fn container(&self) -> ContainerBuilder {
        let mut inner = self.inner.lock();
        let key = inner.allocate();
        inner.containers.insert(
            key,
            ContainerNode {
                key,
                resource: Resource::default(),
                configs: HashMap::new(),
                members: Vec::new(),
            },
        );
        ContainerBuilder {
            graph: self.inner.clone(),
            key,
        }
    }

    /// Publish a set of stream endpoints before any streams are attached.
    pub fn placeholder(&self, tail: Option<Key>, head: Option<Key>) -> PlaceHolder {
        PlaceHolder {
            tail,
            head,
            keys: Vec::new(),
        }
    }

    /// Create a stream from `tail` into the placeholder's head vertex,
    /// recording the new key on the placeholder.
    pub fn stream_to(&self, tail: impl Into<Key>, ph: &mut PlaceHolder) -> Result<StreamBuilder> {
        let head = ph
            .head
            .ok_or_else(|| CoreError::Build("placeholder has no head vertex".to_string()))?;
        let builder = self.stream(tail, head);
        ph.keys.push(builder.key());
        Ok(builder)
    }

    /// Create a stream from the placeholder's tail vertex into `head`,
    /// recording the new key on the placeholder.
    pub fn stream_from(&self, ph: &mut PlaceHolder, head: impl Into<Key>) -> Result<StreamBuilder> {
        let tail = ph
            .tail
            .ok_or_else(|| CoreError::Build("placeholder has no tail vertex".to_string()))?;
        let builder = self.stream(tail, head);
        ph.keys.push(builder.key());
        Ok(builder)
    }

    pub fn num_vertices(&self) -> usize {
        self.inner.lock().vertices.len()
    }

    pub fn num_streams(&self) -> usize {
        self.inner.lock().streams.len()
    }

    /// Serialize the graph into a whole-graph topology.
    ///
    /// Every vertex must belong to at most one declared container; vertices
    /// left out get an implicit single-vertex container so placement always
    /// has something to schedule.
    pub fn topologize(&self) -> Result<Topology> {
        let mut inner = self.inner.lock();
        let mut topology = Topology::new(NONE_KEY, NONE_KEY);

        let mut assignment: HashMap<Key, Key> = HashMap::new();
        for container in inner.containers.values() {
            for member in &container.members {
                if !inner.vertices.contains_key(member) {
                    return Err(CoreError::InvalidKey(*member));
                }
                if assignment.insert(*member, container.key).is_some() {
                    return Err(CoreError::Build(format!(
                        "vertex {member} belongs to more than one container"
                    )));
                }
            }
            topology.containers.insert(
                container.key,
                ContainerSpec {
                    key: container.key,
                    resource: container.resource.clone(),
                    configs: container.configs.clone(),
                },
            );
        }

        let unassigned: Vec<Key> = inner
            .vertices
            .keys()
            .filter(|k| !assignment.contains_key(k))
            .copied()
            .collect();
        for vertex in unassigned {
            let key = inner.allocate();
            topology.containers.insert(
                key,
                ContainerSpec {
                    key,
                    resource: Resource::default(),
                    configs: HashMap::new(),
                },
            );
            assignment.insert(vertex, key);
        }

        for vertex in inner.vertices.values() {
            topology.vertices.insert(
                vertex.key,
                VertexSpec {
                    key: vertex.key,
                    container: assignment[&vertex.key],
                },
            );
        }
        for stream in inner.streams.values() {
            topology.streams.insert(
                stream.key,
                StreamSpec {
                    key: stream.key,
                    tail: stream.tail,
                    head: stream.head,
                },
            );
        }
        Ok(topology)
    }

    pub(crate) fn take_inner(&self) -> GraphInner {
        std::mem::take(&mut *self.inner.lock())
    }
}

// ------------------------------------------------------------------------

/// Fluent handle for one declared vertex.
#[derive(Clone)]
pub struct VertexBuilder {
    graph: Arc<Mutex<GraphInner>>,
    key: Key,
}

impl VertexBuilder {
    pub fn key(&self) -> Key {
        self.key
    }

    /// One-shot callback run when the vertex first becomes active.
    pub fn on_enter(&self, f: impl FnOnce(&mut Vertex) + Send + 'static) -> Self {
        if let Some(node) = self.graph.lock().vertices.get_mut(&self.key) {
            node.on_enter = Some(Box::new(f));
        }
        self.clone()
    }

    pub fn tag(&self, tag: impl Into<String>) -> Self {
        if let Some(node) = self.graph.lock().vertices.get_mut(&self.key) {
            node.tag = Some(tag.into());
        }
        self.clone()
    }

    /// Run this vertex as an external program instead of in-process logic.
    pub fn program(&self, command: impl Into<String>) -> Self {
        if let Some(node) = self.graph.lock().vertices.get_mut(&self.key) {
            node.program = Some(command.into());
        }
        self.clone()
    }

    /// Extra environment variable for the external program.
    pub fn env(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Some(node) = self.graph.lock().vertices.get_mut(&self.key) {
            node.envs.push((key.into(), value.into()));
        }
        self.clone()
    }
}

impl From<&VertexBuilder> for Key {
    fn from(builder: &VertexBuilder) -> Key {
        builder.key
    }
}

// ------------------------------------------------------------------------

/// Fluent handle for one declared stream.
#[derive(Clone)]
pub struct StreamBuilder {
    graph: Arc<Mutex<GraphInner>>,
    key: Key,
}

impl StreamBuilder {
    pub fn key(&self) -> Key {
        self.key
    }

    /// Read-side callback, run on the head vertex for each readiness event.
    pub fn on_istream(
        &self,
        f: impl FnMut(&mut Vertex, &InputStream) -> Signal + Send + 'static,
    ) -> Self {
        if let Some(node) = self.graph.lock().streams.get_mut(&self.key) {
            node.on_istream = Some(Box::new(f));
        }
        self.clone()
    }

    /// Write-side callback, run on the tail vertex when the stream drains.
    pub fn on_ostream(
        &self,
        f: impl FnMut(&mut Vertex, &OutputStream) -> Signal + Send + 'static,
    ) -> Self {
        if let Some(node) = self.graph.lock().streams.get_mut(&self.key) {
            node.on_ostream = Some(Box::new(f));
        }
        self.clone()
    }

    /// An inter-container stream whose peer dies takes the executor down
    /// with the critical-stream exit code.
    pub fn critical(&self, critical: bool) -> Self {
        if let Some(node) = self.graph.lock().streams.get_mut(&self.key) {
            node.critical = critical;
        }
        self.clone()
    }

    /// Name used when inheriting this stream's fd into an external program.
    pub fn tag(&self, tag: impl Into<String>) -> Self {
        if let Some(node) = self.graph.lock().streams.get_mut(&self.key) {
            node.tag = Some(tag.into());
        }
        self.clone()
    }
}

impl From<&StreamBuilder> for Key {
    fn from(builder: &StreamBuilder) -> Key {
        builder.key
    }
}

// ------------------------------------------------------------------------

/// Fluent handle for one declared prober.
#[derive(Clone)]
pub struct ProberBuilder {
    graph: Arc<Mutex<GraphInner>>,
    key: Key,
}

impl ProberBuilder {
    pub fn key(&self) -> Key {
        self.key
    }

    /// Sampling period between firings.
    pub fn duration(&self, period: Duration) -> Self {
        if let Some(node) = self.graph.lock().probers.get_mut(&self.key) {
            node.period = period;
        }
        self.clone()
    }

    pub fn on(&self, f: impl FnMut(&mut Vertex) -> Signal + Send + 'static) -> Self {
        if let Some(node) = self.graph.lock().probers.get_mut(&self.key) {
            node.on = Some(Box::new(f));
        }
        self.clone()
    }
}

// ------------------------------------------------------------------------

/// Fluent handle for one declared container.
#[derive(Clone)]
pub struct ContainerBuilder {
    graph: Arc<Mutex<GraphInner>>,
    key: Key,
}

impl ContainerBuilder {
    pub fn key(&self) -> Key {
        self.key
    }

    pub fn add(&self, vertex: impl Into<Key>) -> Self {
        let vertex = vertex.into();
        if let Some(node) = self.graph.lock().containers.get_mut(&self.key) {
            node.members.push(vertex);
        }
        self.clone()
    }

    pub fn num_cpus(&self, cpus: u64) -> Self {
        if let Some(node) = self.graph.lock().containers.get_mut(&self.key) {
            node.resource.num_cpus = cpus;
        }
        self.clone()
    }

    pub fn memory_limit(&self, bytes: u64) -> Self {
        if let Some(node) = self.graph.lock().containers.get_mut(&self.key) {
            node.resource.memory_limit_in_bytes = bytes;
        }
        self.clone()
    }

    pub fn space_limit(&self, bytes: u64) -> Self {
        if let Some(node) = self.graph.lock().containers.get_mut(&self.key) {
            node.resource.space_limit_in_bytes = bytes;
        }
        self.clone()
    }

    pub fn config(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Some(node) = self.graph.lock().containers.get_mut(&self.key) {
            node.configs.insert(key.into(), value.into());
        }
        self.clone()
    }
}

// ------------------------------------------------------------------------

/// Published set of stream endpoints of a composition cell.
///
/// Either `tail` (the cell writes) or `head` (the cell reads) names the
/// vertex behind the endpoints; stream keys accumulate as higher layers
/// attach concrete streams.
pub struct PlaceHolder {
    pub tail: Option<Key>,
    pub head: Option<Key>,
    keys: Vec<Key>,
}

impl PlaceHolder {
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn num_keys(&self) -> usize {
        self.keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_dense_and_unique() {
        let g = Graph::new();
        let a = g.vertex();
        let b = g.vertex();
        let s = g.stream(&a, &b);
        assert_eq!(a.key(), 0);
        assert_eq!(b.key(), 1);
        assert_eq!(s.key(), 2);
    }

    #[test]
    fn topologize_assigns_declared_containers() {
        let g = Graph::new();
        let a = g.vertex();
        let b = g.vertex();
        let s = g.stream(&a, &b);
        let ca = g.container();
        ca.add(&a).num_cpus(1).memory_limit(1 << 20);
        let cb = g.container();
        cb.add(&b).num_cpus(1);

        let topology = g.topologize().unwrap();
        assert_eq!(topology.vertices[&a.key()].container, ca.key());
        assert_eq!(topology.vertices[&b.key()].container, cb.key());
        assert!(topology.has_stream(s.key()));
        assert_eq!(topology.containers.len(), 2);
    }

    #[test]
    fn topologize_creates_implicit_containers() {
        let g = Graph::new();
        let a = g.vertex();
        let b = g.vertex();
        g.stream(&a, &b);

        let topology = g.topologize().unwrap();
        assert_eq!(topology.containers.len(), 2);
        let ca = topology.vertices[&a.key()].container;
        let cb = topology.vertices[&b.key()].container;
        assert_ne!(ca, cb);
    }

    #[test]
    fn double_container_membership_is_rejected() {
        let g = Graph::new();
        let a = g.vertex();
        g.container().add(&a);
        g.container().add(&a);
        assert!(g.topologize().is_err());
    }

    #[test]
    fn placeholder_collects_attached_keys() {
        let g = Graph::new();
        let cell = g.vertex();
        let feeder = g.vertex();
        let mut ph = g.placeholder(None, Some(cell.key()));
        let s = g.stream_to(&feeder, &mut ph).unwrap();
        assert_eq!(ph.keys(), &[s.key()]);
        assert_eq!(ph.num_keys(), 1);
    }
}
