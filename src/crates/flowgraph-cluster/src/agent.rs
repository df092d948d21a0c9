//! Per-host daemon hosting executor containers.
//!
//! The agent advertises its probed capacity to the master (the resource's
//! `host` field doubles as the frontier listener endpoint), then serves two
//! flows: topologies from the master become *hatching* tasks that collect
//! their incoming frontier sockets, and accepted frontier connections are
//! routed to the hatching task naming their stream. Once every expected
//! frontier and the stdio forwards are attached, the task's container is
//! spawned with all fds passed through the environment contract and the
//! sub-topology shipped over the control channel.

use crate::container::{namespace_flags, Container, SpawnCommand};
use crate::error::{ClusterError, Result};
use crate::placer::Placer;
use crate::probe;
use flowgraph_core::{Device, InputStream, OutputStream, Reactor, Signal, Socket, StreamEvent};
use flowgraph_protocol::codec::{decode_frame, FRAME_HEADER_LEN};
use flowgraph_protocol::runtime::{master_endpoint_from_env, this_host};
use flowgraph_protocol::{
    Direction, ExitStatus, FrontierPacket, Key, Message, TaskId, TaskInfo, Topology,
    EXIT_CONTAINER_SPAWN_FAILED,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Agent daemon settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub master_endpoint: String,
    /// Root under which per-task control groups are created; `None`
    /// disables resource enforcement.
    pub cgroup_root: Option<PathBuf>,
    /// Externally reachable address of this host.
    pub host: Option<String>,
    pub reap_interval: Duration,
    /// Period of the load heartbeat to the master; `None` disables it.
    pub load_interval: Option<Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            master_endpoint: master_endpoint_from_env(),
            cgroup_root: None,
            host: None,
            reap_interval: Duration::from_millis(200),
            load_interval: Some(Duration::from_secs(5)),
        }
    }
}

/// One accepted inter-container stream half waiting for (or attached to)
/// its hatching task.
struct Frontier {
    graph: Key,
    stream: Key,
    device: Arc<Device>,
}

struct Hatchery {
    /// Inbound frontiers still expected from the listener.
    expected: usize,
    inbound: Vec<Frontier>,
    /// Outbound frontiers this agent dialed at hatch time.
    outbound: Vec<Frontier>,
    stdout: Option<Arc<Device>>,
    stderr: Option<Arc<Device>>,
}

struct Running {
    container: Container,
    control: Arc<OutputStream>,
}

enum Handle {
    Hatching(Hatchery),
    Executing(Running),
}

struct Task {
    topology: Topology,
    handle: Handle,
}

struct State {
    host: String,
    tasks: HashMap<TaskId, Task>,
    orphans: Vec<Frontier>,
    placer: Placer,
    cgroup_root: Option<PathBuf>,
    master: Arc<OutputStream>,
    master_endpoint: String,
    reactor: std::sync::Weak<Reactor>,
}

/// The per-host daemon.
pub struct Agent {
    reactor: Arc<Reactor>,
    state: Arc<Mutex<State>>,
    disconnected: Arc<AtomicBool>,
    endpoint: String,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Agent> {
        let reactor = Reactor::new()?;
        let disconnected = Arc::new(AtomicBool::new(false));

        let mut resource = probe::host_resource();
        let host = config.host.clone().unwrap_or_else(this_host);

        // Frontier listener; its endpoint rides along in the advertisement.
        let frontier_listener = Socket::listen("0.0.0.0:0")?;
        let port = frontier_listener
            .local_endpoint()?
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| ClusterError::Container("frontier listener without port".into()))?;
        let endpoint = format!("{host}:{port}");
        resource.host = endpoint.clone();

        let master_socket = Socket::connect(config.master_endpoint.as_str())?;
        let master_device = master_socket.into_device();
        let master_out = OutputStream::insert(&reactor, master_device.clone(), None)?;

        let state = Arc::new(Mutex::new(State {
            host: endpoint.clone(),
            tasks: HashMap::new(),
            orphans: Vec::new(),
            placer: Placer::new(resource.num_cpus as u32),
            cgroup_root: config.cgroup_root.clone(),
            master: master_out.clone(),
            master_endpoint: config.master_endpoint.clone(),
            reactor: Arc::downgrade(&reactor),
        }));

        // Control messages from the master.
        let state_in_cb = state.clone();
        let disconnected_in_cb = disconnected.clone();
        let reactor_weak = Arc::downgrade(&reactor);
        let _master_in = InputStream::insert(&reactor, master_device, move |is, event| {
            match event {
                StreamEvent::Ready => {
                    while let Ok(Some(message)) = is.recv::<Message>() {
                        match message {
                            Message::Topology(topology) => {
                                insert_task(&state_in_cb, topology);
                            }
                            Message::KillTask(kill) => {
                                remove_task(&state_in_cb, &kill.task_id, false);
                            }
                            other => {
                                tracing::debug!(message = ?other, "unexpected master message");
                            }
                        }
                    }
                    Signal::Default
                }
                StreamEvent::Broken(broken) => {
                    tracing::error!(%broken, "lost connection to master");
                    disconnected_in_cb.store(true, Ordering::SeqCst);
                    if let Some(reactor) = reactor_weak.upgrade() {
                        reactor.shutdown();
                    }
                    Signal::Remove
                }
            }
        })?;

        // Frontier handshakes.
        let state_in_cb = state.clone();
        let listener_device = frontier_listener.device().clone();
        let reactor_weak = Arc::downgrade(&reactor);
        reactor
            .insert_read(listener_device, move |_, _| {
                let Some(reactor) = reactor_weak.upgrade() else {
                    return Signal::Remove;
                };
                while let Ok(Some(peer)) = frontier_listener.accept() {
                    insert_frontier_handshake(&reactor, &state_in_cb, peer);
                }
                Signal::Default
            })
            .wait()??;

        // Child reaper.
        let state_in_cb = state.clone();
        let agent_host = endpoint.clone();
        reactor
            .insert_periodic(config.reap_interval, move |_, _| {
                reap_finished(&state_in_cb, &agent_host);
                Signal::Default
            })
            .wait()??;

        // Load heartbeat.
        if let Some(period) = config.load_interval {
            let heartbeat_out = master_out.clone();
            reactor
                .insert_periodic(period, move |_, _| {
                    let _ = heartbeat_out.send(&Message::LoadInfo(probe::load_info()));
                    Signal::Default
                })
                .wait()??;
        }

        master_out.send(&Message::Resource(resource))?;
        tracing::info!(frontier = %endpoint, "agent up");

        Ok(Agent {
            reactor,
            state,
            disconnected,
            endpoint,
        })
    }

    /// Frontier listener endpoint advertised to the master.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn num_tasks(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Drive the daemon; returns an error if the master link broke.
    pub fn run(&self) -> Result<()> {
        self.reactor.run()?;
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(ClusterError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "master connection lost",
            )));
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.reactor.shutdown();
    }
}

/// Read exactly one `FrontierPacket` frame off a fresh connection, then
/// hand the socket over as the stream's data channel. Reading byte-exact
/// matters: anything past the handshake already belongs to the stream.
fn insert_frontier_handshake(reactor: &Arc<Reactor>, state: &Arc<Mutex<State>>, peer: Socket) {
    let device = peer.into_device();
    let read_device = device.clone();
    let state_in_cb = state.clone();
    let mut collected: Vec<u8> = Vec::with_capacity(FRAME_HEADER_LEN);
    let mut needed = FRAME_HEADER_LEN;

    let promise = reactor.insert_read(device, move |_, _| {
        loop {
            let mut buf = vec![0u8; needed - collected.len()];
            match read_device.read(&mut buf) {
                Ok(0) => return Signal::Remove,
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    if collected.len() < needed {
                        continue;
                    }
                    if needed == FRAME_HEADER_LEN {
                        let mut header = [0u8; FRAME_HEADER_LEN];
                        header.copy_from_slice(&collected);
                        let body = u32::from_le_bytes(header) as usize;
                        if body == 0 || body > 64 {
                            tracing::warn!(len = body, "malformed frontier handshake");
                            return Signal::Remove;
                        }
                        needed += body;
                        continue;
                    }
                    match decode_frame::<FrontierPacket>(&collected) {
                        Ok(Some((packet, _))) => {
                            insert_frontier(
                                &state_in_cb,
                                Frontier {
                                    graph: packet.graph,
                                    stream: packet.stream,
                                    device: read_device.clone(),
                                },
                            );
                        }
                        other => {
                            tracing::warn!(result = ?other.is_ok(), "bad frontier packet");
                        }
                    }
                    return Signal::Remove;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    return Signal::Default;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "frontier handshake failed");
                    return Signal::Remove;
                }
            }
        }
    });
    drop(promise);
}

fn insert_frontier(state: &Arc<Mutex<State>>, frontier: Frontier) {
    let mut state = state.lock();
    tracing::debug!(graph = frontier.graph, stream = frontier.stream, "frontier arrived");

    let mut target: Option<TaskId> = None;
    for (task_id, task) in &state.tasks {
        if task.topology.graph == frontier.graph
            && task.topology.inter_stream_direction(frontier.stream) == Some(Direction::In)
            && matches!(task.handle, Handle::Hatching(_))
        {
            target = Some(*task_id);
            break;
        }
    }

    match target {
        Some(task_id) => {
            if let Some(Task {
                handle: Handle::Hatching(hatchery),
                ..
            }) = state.tasks.get_mut(&task_id)
            {
                hatchery.inbound.push(frontier);
            }
            maybe_deploy(&mut state, task_id);
        }
        None => {
            // The topology may still be in flight from the master.
            state.orphans.push(frontier);
        }
    }
}

/// A topology arrived: enter the hatching state, dial the outbound
/// frontiers and collect the inbound ones.
///
/// Outbound halves are dialed by the tail-side agent right here, before any
/// executor exists; waiting for executors on both sides would deadlock two
/// containers whose streams point at each other.
fn insert_task(state: &Arc<Mutex<State>>, topology: Topology) {
    let task_id = topology.task_id();
    tracing::info!(task = %task_id, "hatching");

    let expected = topology
        .streams
        .keys()
        .filter(|key| topology.inter_stream_direction(**key) == Some(Direction::In))
        .count();

    let stdout = dial_forward(topology.runtime.stdout_endpoint());
    let stderr = dial_forward(topology.runtime.stderr_endpoint());

    let mut hatchery = Hatchery {
        expected,
        inbound: Vec::new(),
        outbound: Vec::new(),
        stdout,
        stderr,
    };

    let vertex_hosts = topology.runtime.vertex_hosts();
    for (key, spec) in &topology.streams {
        if topology.inter_stream_direction(*key) != Some(Direction::Out) {
            continue;
        }
        match dial_frontier(&vertex_hosts, topology.graph, *key, spec.head) {
            Ok(frontier) => hatchery.outbound.push(frontier),
            Err(err) => {
                tracing::error!(task = %task_id, stream = key, error = %err, "frontier dial failed");
                let mut state = state.lock();
                let info = TaskInfo::new(
                    task_id,
                    state.host.clone(),
                    ExitStatus::Exited(EXIT_CONTAINER_SPAWN_FAILED),
                );
                let _ = state.master.send(&Message::TaskInfo(info));
                return;
            }
        }
    }

    let mut state = state.lock();

    // Adopt inbound frontiers that arrived ahead of the topology.
    let mut keep = Vec::new();
    for frontier in state.orphans.drain(..) {
        if frontier.graph == topology.graph
            && topology.inter_stream_direction(frontier.stream) == Some(Direction::In)
        {
            hatchery.inbound.push(frontier);
        } else {
            keep.push(frontier);
        }
    }
    state.orphans = keep;

    state.tasks.insert(
        task_id,
        Task {
            topology,
            handle: Handle::Hatching(hatchery),
        },
    );
    maybe_deploy(&mut state, task_id);
}

/// Open the data channel for one outgoing inter-container stream: connect
/// to the head vertex's agent and announce the stream.
fn dial_frontier(
    vertex_hosts: &std::collections::BTreeMap<Key, String>,
    graph: Key,
    stream: Key,
    head: Key,
) -> Result<Frontier> {
    let host = vertex_hosts
        .get(&head)
        .ok_or_else(|| ClusterError::unknown("vertex host", head))?;
    let socket = Socket::connect(host.as_str())?;
    let device = socket.into_device();
    let frame = flowgraph_protocol::codec::encode_frame(&FrontierPacket { graph, stream })?;
    let mut remaining: &[u8] = &frame;
    while !remaining.is_empty() {
        match device.write(remaining) {
            Ok(n) => remaining = &remaining[n..],
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(Frontier {
        graph,
        stream,
        device,
    })
}

fn dial_forward(endpoint: Option<&str>) -> Option<Arc<Device>> {
    let endpoint = endpoint?;
    match Socket::connect(endpoint) {
        Ok(socket) => Some(socket.into_device()),
        Err(err) => {
            tracing::warn!(%endpoint, error = %err, "stdio forward dial failed");
            None
        }
    }
}

fn maybe_deploy(state: &mut State, task_id: TaskId) {
    let ready = match state.tasks.get(&task_id) {
        Some(Task {
            handle: Handle::Hatching(hatchery),
            ..
        }) => hatchery.inbound.len() >= hatchery.expected,
        _ => false,
    };
    if !ready {
        return;
    }
    if let Err(err) = deploy(state, task_id) {
        tracing::error!(task = %task_id, error = %err, "deploy failed");
        let info = TaskInfo::new(
            task_id,
            state.host.clone(),
            ExitStatus::Exited(EXIT_CONTAINER_SPAWN_FAILED),
        );
        let _ = state.master.send(&Message::TaskInfo(info));
        state.tasks.remove(&task_id);
        state.placer.release(&task_id);
    }
}

/// All frontiers and stdio are attached: spawn the executor child.
fn deploy(state: &mut State, task_id: TaskId) -> Result<()> {
    let task = state
        .tasks
        .get_mut(&task_id)
        .ok_or_else(|| ClusterError::unknown("task", task_id))?;
    let hatchery = match std::mem::replace(
        &mut task.handle,
        Handle::Hatching(Hatchery {
            expected: 0,
            inbound: Vec::new(),
            outbound: Vec::new(),
            stdout: None,
            stderr: None,
        }),
    ) {
        Handle::Hatching(hatchery) => hatchery,
        executing => {
            task.handle = executing;
            return Ok(());
        }
    };
    let topology = task.topology.clone();

    let container_spec = topology.containers.get(&topology.topology).cloned();
    let demand_cpus = container_spec
        .as_ref()
        .map(|c| c.resource.num_cpus.max(1) as usize)
        .unwrap_or(1);

    // Control group plus cpu bucket pinning.
    let cgroup = match (&state.cgroup_root, &container_spec) {
        (Some(root), Some(spec)) => {
            let group = crate::cgroup::ControlGroup::new(root.join(task_id.to_string()))?;
            if spec.resource.memory_limit_in_bytes > 0 {
                let _ = group.set_memory_limit_in_bytes(spec.resource.memory_limit_in_bytes);
                let _ = group.set_memory_swappiness(0);
            }
            Some(group)
        }
        _ => None,
    };
    let cpus = state.placer.assign(task_id, demand_cpus);
    if let Some(group) = &cgroup {
        let _ = group.set_cpuset_cpus(&Placer::cpuset_string(&cpus));
    }

    // Control channel between agent and executor child.
    let (parent_end, child_end) = Device::socket_pair()?;
    let parent_end = Arc::new(parent_end);
    let child_end = Arc::new(child_end);

    let mut runtime = topology.runtime.clone();
    runtime.merge_process_env();
    runtime
        .set_execution_mode(flowgraph_protocol::ExecutionMode::Distributed)
        .set_task_id(topology.graph, topology.topology)
        .set_master_endpoint(state.master_endpoint.clone())
        .set_control_fd(child_end.fd());

    let named_fds: Vec<(String, i32)> = hatchery
        .inbound
        .iter()
        .chain(hatchery.outbound.iter())
        .map(|f| (f.stream.to_string(), f.device.fd()))
        .collect();
    let frontier_pairs = flowgraph_protocol::runtime::render_fd_pairs(
        named_fds.iter().map(|(name, fd)| (name.as_str(), *fd)),
    );
    runtime.set_frontier_fds(&frontier_pairs);

    let file = runtime
        .submit_file()
        .ok_or_else(|| ClusterError::Container("topology without submit file".into()))?
        .to_string();
    let args: Vec<String> = runtime
        .submit_argv()
        .map(|argv| argv.split_whitespace().skip(1).map(String::from).collect())
        .unwrap_or_default();

    let mut inherit: Vec<Arc<Device>> = vec![child_end.clone()];
    inherit.extend(
        hatchery
            .inbound
            .iter()
            .chain(hatchery.outbound.iter())
            .map(|f| f.device.clone()),
    );

    let command = SpawnCommand {
        file,
        args,
        envs: runtime.envs().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        stdio: hatchery.stdout.clone().zip(hatchery.stderr.clone()),
        inherit,
        namespaces: container_spec
            .as_ref()
            .map(|c| namespace_flags(&c.configs))
            .unwrap_or_else(nix::sched::CloneFlags::empty),
    };

    let mut container = Container::new(cgroup);
    container.spawn(&command)?;

    // Our copy of the child's end closes now; the child holds its own.
    drop(child_end);

    // Ship the sub-topology over the control channel.
    let reactor = state
        .reactor
        .upgrade()
        .ok_or_else(|| ClusterError::Container("reactor gone".into()))?;
    let control = OutputStream::insert(&reactor, parent_end, None)?;
    control.send(&Message::Topology(topology))?;

    if let Some(task) = state.tasks.get_mut(&task_id) {
        task.handle = Handle::Executing(Running { container, control });
    }
    Ok(())
}

/// Reap exited containers and report them upstream.
fn reap_finished(state: &Arc<Mutex<State>>, agent_host: &str) {
    let mut state = state.lock();
    let mut finished: Vec<(TaskId, ExitStatus)> = Vec::new();

    for (task_id, task) in state.tasks.iter_mut() {
        if let Handle::Executing(running) = &mut task.handle {
            match running.container.try_wait() {
                Ok(Some(status)) => finished.push((*task_id, status)),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(task = %task_id, error = %err, "reap failed");
                    finished.push((*task_id, ExitStatus::Exited(EXIT_CONTAINER_SPAWN_FAILED)));
                }
            }
        }
    }

    for (task_id, status) in finished {
        tracing::info!(task = %task_id, %status, "task finished");
        state.tasks.remove(&task_id);
        state.placer.release(&task_id);
        let info = TaskInfo::new(task_id, agent_host.to_string(), status);
        let _ = state.master.send(&Message::TaskInfo(info));
    }
}

/// Tear one task down: gracefully via the control channel, or with SIGKILL.
fn remove_task(state: &Arc<Mutex<State>>, task_id: &TaskId, graceful: bool) {
    let mut state = state.lock();
    match state.tasks.get_mut(task_id) {
        Some(Task {
            handle: Handle::Executing(running),
            ..
        }) => {
            if graceful {
                let _ = running
                    .control
                    .send(&Message::KillTask(flowgraph_protocol::KillTask {
                        task_id: *task_id,
                    }));
            } else if let Err(err) = running.container.kill() {
                tracing::warn!(task = %task_id, error = %err, "kill failed");
            }
            // The reaper observes the exit and reports it.
        }
        Some(_) => {
            // Still hatching: drop the record and its collected sockets.
            state.tasks.remove(task_id);
            state.placer.release(task_id);
        }
        None => {
            tracing::debug!(task = %task_id, "remove for unknown task");
        }
    }
}
