//! Per-container runtime: materializes a graph onto a reactor.
//!
//! One executor drives one process worth of dataflow. In *local* mode the
//! whole graph runs here; in *submit* mode the process is only the graph's
//! client; in *distributed* mode it hosts the single container an agent
//! assigned to it, with frontier sockets carrying the inter-container
//! streams.

use crate::device::{Device, ScopedOpenOnExec, Socket};
use crate::error::{CoreError, Result};
use crate::graph::{Graph, GraphInner, StreamNode, Vertex};
use crate::reactor::{Reactor, Signal};
use crate::stream::{InputStream, OutputStream, StreamEvent};
use flowgraph_protocol::runtime::{master_endpoint_from_env, this_host};
use flowgraph_protocol::{
    execution_mode_from_env, ExecutionMode, Key, Message, Runtime, Topology,
    EXIT_BROKEN_CONNECTION, EXIT_CRITICAL_STREAM, EXIT_OK, EXIT_VERTEX_PROGRAM_FAILED,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::process::Child;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Tracks the graph-driving events (input streams and probers) still alive
/// in this executor; when the last one retires, the armed teardown runs.
struct LiveSet {
    count: AtomicUsize,
    on_zero: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl LiveSet {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(0),
            on_zero: Mutex::new(None),
        })
    }

    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(teardown) = self.on_zero.lock().take() {
                teardown();
            }
        }
    }

    fn arm(&self, teardown: Box<dyn FnOnce() + Send>) {
        if self.count.load(Ordering::SeqCst) == 0 {
            teardown();
        } else {
            *self.on_zero.lock() = Some(teardown);
        }
    }
}

struct Materialized {
    cells: HashMap<Key, Arc<Mutex<Vertex>>>,
    children: Vec<Child>,
    live: Arc<LiveSet>,
}

/// Per-container runtime over one reactor.
pub struct Executor {
    reactor: Arc<Reactor>,
    mode: ExecutionMode,
    graph: Graph,
}

impl Executor {
    /// Build an executor whose mode comes from the environment contract.
    pub fn new(graph: Graph) -> Result<Self> {
        Self::with_mode(graph, execution_mode_from_env())
    }

    pub fn with_mode(graph: Graph, mode: ExecutionMode) -> Result<Self> {
        Ok(Self {
            reactor: Reactor::new()?,
            mode,
            graph,
        })
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Run to completion and return the process exit code.
    pub fn run(self) -> Result<i32> {
        match self.mode {
            ExecutionMode::Local => self.run_local(),
            ExecutionMode::Submit => self.run_submit(),
            ExecutionMode::Distributed => self.run_distributed(),
        }
    }

    // ---- local ---------------------------------------------------------

    fn run_local(self) -> Result<i32> {
        let inner = self.graph.take_inner();
        let materialized =
            materialize(&self.reactor, inner, None, &HashMap::new(), &Runtime::new())?;
        // Quiescence ends the loop once every stream and prober retires.
        self.reactor.run()?;

        let Materialized { cells, children, .. } = materialized;
        drop(cells);
        drop(self.reactor);
        reap(children)
    }

    // ---- submit --------------------------------------------------------

    fn run_submit(self) -> Result<i32> {
        let mut topology = self.graph.topologize()?;

        let stdout_endpoint = insert_forward_listener(&self.reactor, StdioTarget::Out)?;
        let stderr_endpoint = insert_forward_listener(&self.reactor, StdioTarget::Err)?;

        let argv: Vec<String> = std::env::args().collect();
        topology
            .runtime
            .set_submit_file(
                std::env::current_exe()?
                    .to_string_lossy()
                    .into_owned(),
            )
            .set_submit_argv(argv.join(" "))
            .set_stdout_endpoint(stdout_endpoint)
            .set_stderr_endpoint(stderr_endpoint);

        let master = Socket::connect(master_endpoint_from_env())?;
        let device = master.into_device();
        let ostream = OutputStream::insert(&self.reactor, device.clone(), None)?;

        let exit_code = Arc::new(AtomicI32::new(EXIT_OK));
        let reactor_weak = Arc::downgrade(&self.reactor);
        let exit_in_cb = exit_code.clone();
        let _istream = InputStream::insert(&self.reactor, device, move |is, event| {
            let reactor = reactor_weak.upgrade();
            match event {
                StreamEvent::Ready => {
                    while let Ok(Some(message)) = is.recv::<Message>() {
                        if let Message::Solution(solution) = message {
                            print!("{solution}");
                            exit_in_cb.store(solution.worst_exit_code(), Ordering::SeqCst);
                            if let Some(reactor) = &reactor {
                                reactor.shutdown();
                            }
                            return Signal::Remove;
                        }
                    }
                    Signal::Default
                }
                StreamEvent::Broken(broken) => {
                    tracing::error!(%broken, "lost connection to master");
                    exit_in_cb.store(EXIT_BROKEN_CONNECTION, Ordering::SeqCst);
                    if let Some(reactor) = &reactor {
                        reactor.shutdown();
                    }
                    Signal::Remove
                }
            }
        })?;

        ostream.send(&Message::Topology(topology))?;
        self.reactor.run()?;
        Ok(exit_code.load(Ordering::SeqCst))
    }

    // ---- distributed ---------------------------------------------------

    fn run_distributed(self) -> Result<i32> {
        let runtime = Runtime::from_process_env();
        let control_fd = runtime
            .control_fd()
            .ok_or_else(|| CoreError::Context("missing control channel fd".to_string()))?;
        // The agent opened this fd for us; it is ours alone now.
        let control_dev = Arc::new(Device::new(unsafe { OwnedFd::from_raw_fd(control_fd) })?);

        let mut frontier_in: HashMap<Key, Arc<Device>> = HashMap::new();
        for (stream, fd) in runtime.frontier_fds() {
            let device = Device::new(unsafe { OwnedFd::from_raw_fd(fd) })?;
            frontier_in.insert(stream, Arc::new(device));
        }

        let control_out = OutputStream::insert(&self.reactor, control_dev.clone(), None)?;

        // Filled once the control channel delivers our sub-topology.
        let children: Arc<Mutex<Vec<Child>>> = Arc::new(Mutex::new(Vec::new()));
        let holder: Arc<Mutex<Option<Arc<InputStream>>>> = Arc::new(Mutex::new(None));

        let graph = self.graph.clone();
        let reactor_weak = Arc::downgrade(&self.reactor);
        let mut built = false;
        let children_in_cb = children.clone();
        let holder_in_cb = holder.clone();
        let control_out_in_cb = control_out.clone();
        let frontier_in = Arc::new(frontier_in);

        let control_in = InputStream::insert(&self.reactor, control_dev, move |is, event| {
            match event {
                StreamEvent::Ready => {
                    while let Ok(Some(message)) = is.recv::<Message>() {
                        match message {
                            Message::Topology(topology) if !built => {
                                built = true;
                                let Some(reactor) = reactor_weak.upgrade() else {
                                    return Signal::Remove;
                                };
                                match build_container(
                                    &reactor,
                                    &graph,
                                    topology,
                                    &frontier_in,
                                    &holder_in_cb,
                                    &control_out_in_cb,
                                ) {
                                    Ok(materialized) => {
                                        // The stream callbacks hold their own
                                        // vertex references; only the children
                                        // need reaping later.
                                        children_in_cb
                                            .lock()
                                            .extend(materialized.children);
                                    }
                                    Err(err) => {
                                        tracing::error!(error = %err, "container build failed");
                                        std::process::exit(EXIT_VERTEX_PROGRAM_FAILED);
                                    }
                                }
                            }
                            Message::KillTask(_) => {
                                if let Some(reactor) = reactor_weak.upgrade() {
                                    reactor.shutdown();
                                }
                            }
                            _ => {}
                        }
                    }
                    Signal::Default
                }
                StreamEvent::Broken(broken) => {
                    tracing::error!(%broken, "lost connection to agent");
                    std::process::exit(EXIT_BROKEN_CONNECTION);
                }
            }
        })?;
        *holder.lock() = Some(control_in);

        self.reactor.run()?;

        let children = std::mem::take(&mut *children.lock());
        drop(holder);
        drop(self.reactor);
        reap(children)
    }
}

fn reap(children: Vec<Child>) -> Result<i32> {
    let mut code = EXIT_OK;
    for mut child in children {
        match child.wait() {
            Ok(status) if status.success() => {}
            Ok(status) => {
                tracing::warn!(%status, "vertex program exited with failure");
                code = EXIT_VERTEX_PROGRAM_FAILED;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to reap vertex program");
                code = EXIT_VERTEX_PROGRAM_FAILED;
            }
        }
    }
    Ok(code)
}

/// Build the distributed slice once the agent ships our topology.
fn build_container(
    reactor: &Arc<Reactor>,
    graph: &Graph,
    topology: Topology,
    frontier_in: &HashMap<Key, Arc<Device>>,
    control_in: &Arc<Mutex<Option<Arc<InputStream>>>>,
    control_out: &Arc<OutputStream>,
) -> Result<Materialized> {
    let inner = graph.take_inner();
    let base_runtime = topology.runtime.clone();
    let materialized = materialize(reactor, inner, Some(&topology), frontier_in, &base_runtime)?;

    // Once the last stream retires, release the control channel so the
    // reactor can reach quiescence.
    let control_in = control_in.clone();
    let control_out = control_out.clone();
    materialized.live.arm(Box::new(move || {
        if let Some(istream) = control_in.lock().take() {
            istream.deregister();
        }
        control_out.remove_on_flush();
    }));
    Ok(materialized)
}

/// Wire a graph (or the slice named by `scope`) onto the reactor.
fn materialize(
    reactor: &Arc<Reactor>,
    mut inner: GraphInner,
    scope: Option<&Topology>,
    frontier_in: &HashMap<Key, Arc<Device>>,
    base_runtime: &Runtime,
) -> Result<Materialized> {
    let is_local = |key: Key| scope.map(|t| t.has_vertex(key)).unwrap_or(true);

    let programs: HashMap<Key, String> = inner
        .vertices
        .values()
        .filter_map(|v| v.program.clone().map(|p| (v.key, p)))
        .collect();

    let mut cells: HashMap<Key, Arc<Mutex<Vertex>>> = HashMap::new();
    for node in inner.vertices.values() {
        if is_local(node.key) && !programs.contains_key(&node.key) {
            cells.insert(
                node.key,
                Arc::new(Mutex::new(Vertex::new(node.key, node.tag.clone()))),
            );
        }
    }

    let live = LiveSet::new();
    let mut bridges: HashMap<Key, Vec<(String, Arc<Device>)>> = HashMap::new();

    let stream_keys: Vec<Key> = inner.streams.keys().copied().collect();
    for key in stream_keys {
        if let Some(t) = scope {
            if !t.has_stream(key) {
                inner.streams.remove(&key);
                continue;
            }
        }
        let mut node = match inner.streams.remove(&key) {
            Some(node) => node,
            None => continue,
        };
        let tail_local = is_local(node.tail);
        let head_local = is_local(node.head);
        if !tail_local && !head_local {
            continue;
        }
        let bridge_name = node
            .tag
            .clone()
            .unwrap_or_else(|| key.to_string());

        // Pick devices for each present side.
        let (read_dev, write_dev): (Option<Arc<Device>>, Option<Arc<Device>>) =
            if tail_local && head_local {
                let (r, w) = Device::pipe()?;
                (Some(Arc::new(r)), Some(Arc::new(w)))
            } else if head_local {
                let device = frontier_in.get(&key).cloned().ok_or_else(|| {
                    CoreError::Context(format!("no inherited frontier for stream {key}"))
                })?;
                (Some(device), None)
            } else {
                // The agent pre-dialed this outgoing frontier at hatch time
                // and handed us the socket.
                let device = frontier_in.get(&key).cloned().ok_or_else(|| {
                    CoreError::Context(format!("no inherited frontier for stream {key}"))
                })?;
                (None, Some(device))
            };

        if head_local {
            let Some(read_dev) = read_dev else {
                continue;
            };
            if programs.contains_key(&node.head) {
                bridges
                    .entry(node.head)
                    .or_default()
                    .push((bridge_name.clone(), read_dev));
            } else {
                let head = node.head;
                let istream = insert_graph_istream(
                    reactor,
                    read_dev,
                    &mut node,
                    &cells[&head],
                    !tail_local,
                    &live,
                )?;
                cells[&node.head].lock().attach_istream(key, istream);
            }
        }

        if tail_local {
            let Some(write_dev) = write_dev else {
                continue;
            };
            if programs.contains_key(&node.tail) {
                bridges
                    .entry(node.tail)
                    .or_default()
                    .push((bridge_name, write_dev));
            } else {
                let tail = node.tail;
                let ostream = insert_graph_ostream(
                    reactor,
                    write_dev,
                    &mut node,
                    &cells[&tail],
                    !head_local,
                )?;
                cells[&node.tail].lock().attach_ostream(key, ostream);
            }
        }
    }

    // Probers become periodic events on their vertex.
    for (_, mut prober) in inner.probers.drain() {
        if !is_local(prober.vertex) || programs.contains_key(&prober.vertex) {
            continue;
        }
        let Some(mut callback) = prober.on.take() else {
            continue;
        };
        let cell = cells[&prober.vertex].clone();
        live.add();
        let live_in_cb = live.clone();
        let mut finished = false;
        reactor
            .insert_periodic(prober.period, move |_, _| {
                let signal = {
                    let mut vertex = cell.lock();
                    callback(&mut vertex)
                };
                if matches!(signal, Signal::Remove | Signal::Close) && !finished {
                    finished = true;
                    live_in_cb.done();
                }
                signal
            })
            .wait()??;
    }

    // On-enter callbacks run exactly once, before any stream activity.
    let mut children = Vec::new();
    for (_, mut node) in inner.vertices.drain() {
        if !is_local(node.key) {
            continue;
        }
        if let Some(program) = programs.get(&node.key) {
            let vertex_bridges = bridges.remove(&node.key).unwrap_or_default();
            children.push(spawn_program(program, &node.envs, vertex_bridges, base_runtime)?);
            continue;
        }
        if let Some(on_enter) = node.on_enter.take() {
            let cell = cells[&node.key].clone();
            reactor.dispatch_with(move |_| {
                let mut vertex = cell.lock();
                on_enter(&mut vertex);
            });
        }
    }

    Ok(Materialized {
        cells,
        children,
        live,
    })
}

fn insert_graph_istream(
    reactor: &Arc<Reactor>,
    device: Arc<Device>,
    node: &mut StreamNode,
    cell: &Arc<Mutex<Vertex>>,
    inter: bool,
    live: &Arc<LiveSet>,
) -> Result<Arc<InputStream>> {
    live.add();
    let stream_key = node.key;
    let critical = node.critical;
    let mut user = node.on_istream.take();
    let cell = cell.clone();
    let live = live.clone();
    let mut finished = false;

    InputStream::insert(reactor, device, move |is, event| match event {
        StreamEvent::Ready => {
            let signal = match user.as_mut() {
                Some(callback) => {
                    let mut vertex = cell.lock();
                    callback(&mut vertex, is)
                }
                None => Signal::Default,
            };
            if matches!(signal, Signal::Remove | Signal::Close) && !finished {
                finished = true;
                live.done();
            }
            signal
        }
        StreamEvent::Broken(broken) => {
            if critical && inter {
                tracing::error!(stream = stream_key, %broken, "critical stream reached");
                std::process::exit(EXIT_CRITICAL_STREAM);
            }
            tracing::debug!(stream = stream_key, %broken, "input stream closed");
            if !finished {
                finished = true;
                live.done();
            }
            Signal::Remove
        }
    })
}

fn insert_graph_ostream(
    reactor: &Arc<Reactor>,
    device: Arc<Device>,
    node: &mut StreamNode,
    cell: &Arc<Mutex<Vertex>>,
    inter: bool,
) -> Result<Arc<OutputStream>> {
    let stream_key = node.key;
    let critical = node.critical;
    let mut user = node.on_ostream.take();
    let cell = cell.clone();

    let handler: crate::stream::OutputHandler = Box::new(move |os: &OutputStream, event: StreamEvent| match event {
        StreamEvent::Ready => match user.as_mut() {
            Some(callback) => {
                let mut vertex = cell.lock();
                callback(&mut vertex, os)
            }
            None => Signal::Default,
        },
        StreamEvent::Broken(broken) => {
            if critical && inter {
                tracing::error!(stream = stream_key, %broken, "critical stream reached");
                std::process::exit(EXIT_CRITICAL_STREAM);
            }
            tracing::debug!(stream = stream_key, %broken, "output stream closed");
            Signal::Remove
        }
    });
    OutputStream::insert(reactor, device, Some(handler))
}

/// Launch an external vertex program with its stream fds inherited through
/// the environment contract.
fn spawn_program(
    command_line: &str,
    extra_envs: &[(String, String)],
    bridges: Vec<(String, Arc<Device>)>,
    base_runtime: &Runtime,
) -> Result<Child> {
    let mut words = command_line.split_whitespace();
    let file = words
        .next()
        .ok_or_else(|| CoreError::Build("empty vertex program".to_string()))?;

    let mut runtime = base_runtime.clone();
    runtime.merge_process_env();
    for (key, value) in extra_envs {
        runtime.set(key.clone(), value.clone());
    }
    runtime.set_bridges(&flowgraph_protocol::runtime::render_fd_pairs(
        bridges.iter().map(|(name, device)| (name.as_str(), device.fd())),
    ));
    runtime
        .remove_vertex_hosts()
        .remove_control_fd()
        .remove_frontier_fds()
        .remove(flowgraph_protocol::runtime::ENV_EXECUTION_MODE);

    // Bridge fds stay inheritable and blocking only for the spawn window.
    let mut guards = Vec::with_capacity(bridges.len());
    for (_, device) in &bridges {
        guards.push(ScopedOpenOnExec::new(device.clone())?);
    }

    let child = std::process::Command::new(file)
        .args(words)
        .env_clear()
        .envs(runtime.envs())
        .spawn()
        .map_err(|source| CoreError::Spawn {
            program: command_line.to_string(),
            source,
        })?;
    drop(guards);
    tracing::info!(program = file, pid = child.id(), "spawned vertex program");
    Ok(child)
}

#[derive(Clone, Copy)]
enum StdioTarget {
    Out,
    Err,
}

/// Listener that copies every accepted connection onto our stdout/stderr,
/// so remote containers' output lands on the submitting client's console.
fn insert_forward_listener(reactor: &Arc<Reactor>, target: StdioTarget) -> Result<String> {
    let listener = Socket::listen("0.0.0.0:0")?;
    let port = listener
        .local_endpoint()?
        .rsplit(':')
        .next()
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| CoreError::Context("listener without a port".to_string()))?;
    let endpoint = format!("{}:{port}", this_host());

    let device = listener.device().clone();
    reactor
        .insert_read(device, move |reactor, _| {
            while let Ok(Some(peer)) = listener.accept() {
                let peer_dev = peer.into_device();
                let read_dev = peer_dev.clone();
                reactor.insert_read(peer_dev, move |_, _| forward_bytes(&read_dev, target));
            }
            Signal::Default
        })
        .wait()??;
    Ok(endpoint)
}

fn forward_bytes(device: &Arc<Device>, target: StdioTarget) -> Signal {
    use std::io::Write;
    let mut buf = [0u8; 4096];
    loop {
        match device.read(&mut buf) {
            Ok(0) => return Signal::Remove,
            Ok(n) => {
                let result = match target {
                    StdioTarget::Out => std::io::stdout().write_all(&buf[..n]),
                    StdioTarget::Err => std::io::stderr().write_all(&buf[..n]),
                };
                if result.is_err() {
                    return Signal::Remove;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Signal::Default,
            Err(_) => return Signal::Remove,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Signal;

    #[test]
    fn empty_graph_completes_immediately_with_zero() {
        let graph = Graph::new();
        let executor = Executor::with_mode(graph, ExecutionMode::Local).unwrap();
        assert_eq!(executor.run().unwrap(), EXIT_OK);
    }

    #[test]
    fn single_stream_delivers_and_terminates() {
        let graph = Graph::new();
        let a = graph.vertex();
        let b = graph.vertex();
        let ab = graph.stream(&a, &b);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_cb = seen.clone();
        ab.on_istream(move |_vertex, is| {
            if let Ok(Some(value)) = is.recv::<i64>() {
                seen_in_cb.lock().push(value);
                return Signal::Remove;
            }
            Signal::Default
        });

        let ab_key = ab.key();
        a.on_enter(move |vertex| {
            vertex.send(ab_key, &99i64).unwrap();
        });

        let executor = Executor::with_mode(graph, ExecutionMode::Local).unwrap();
        assert_eq!(executor.run().unwrap(), EXIT_OK);
        assert_eq!(*seen.lock(), vec![99]);
    }

    #[test]
    fn on_enter_runs_exactly_once() {
        let graph = Graph::new();
        let a = graph.vertex();
        let b = graph.vertex();
        let ab = graph.stream(&a, &b);
        let ab_key = ab.key();

        let entries = Arc::new(AtomicUsize::new(0));
        let entries_in_cb = entries.clone();
        a.on_enter(move |vertex| {
            entries_in_cb.fetch_add(1, Ordering::SeqCst);
            for i in 0..3i32 {
                vertex.send(ab_key, &i).unwrap();
            }
        });

        let received = Arc::new(AtomicUsize::new(0));
        let received_in_cb = received.clone();
        ab.on_istream(move |_vertex, is| {
            while let Ok(Some(_value)) = is.recv::<i32>() {
                if received_in_cb.fetch_add(1, Ordering::SeqCst) == 2 {
                    return Signal::Remove;
                }
            }
            Signal::Default
        });

        let executor = Executor::with_mode(graph, ExecutionMode::Local).unwrap();
        assert_eq!(executor.run().unwrap(), EXIT_OK);
        assert_eq!(entries.load(Ordering::SeqCst), 1);
        assert_eq!(received.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn vertex_program_inherits_bridge_fds() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("dump.sh");
        let out_path = dir.path().join("env.txt");
        std::fs::write(
            &script,
            "#!/bin/sh\nprintenv FLOWGRAPH_BRIDGES > \"$BRIDGE_DUMP\"\n",
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let graph = Graph::new();
        let feeder = graph.vertex();
        let sink = graph.vertex();
        let stream = graph.stream(&feeder, &sink).tag("sensor");
        let stream_key = stream.key();
        sink.program(script.to_string_lossy())
            .env("BRIDGE_DUMP", out_path.to_string_lossy());

        a_feeder_sends(&feeder, stream_key);

        let executor = Executor::with_mode(graph, ExecutionMode::Local).unwrap();
        assert_eq!(executor.run().unwrap(), EXIT_OK);

        let dumped = std::fs::read_to_string(&out_path).unwrap();
        let entry = dumped.trim();
        let (name, fd) = entry.rsplit_once(':').unwrap();
        assert_eq!(name, "sensor");
        assert!(fd.parse::<i32>().is_ok());
    }

    fn a_feeder_sends(feeder: &crate::graph::VertexBuilder, stream_key: Key) {
        feeder.on_enter(move |vertex| {
            let _ = vertex.send(stream_key, &1u8);
        });
    }
}
