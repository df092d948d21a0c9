//! Cluster coordinator.
//!
//! One reactor process accepting two kinds of peers, told apart by their
//! first message: graph clients send a `Topology` and wait for a
//! `Solution`; agents send their `Resource` and then exchange control
//! messages. Submitted graphs queue FIFO; placement is best-fit bin packing
//! over the agents' free capacities, retried from the queue head whenever
//! capacity frees up.

use crate::error::Result;
use crate::scheduler::{best_fit, Bin};
use flowgraph_core::{InputStream, OutputStream, Reactor, Signal, Socket, StreamEvent};
use flowgraph_protocol::{
    KillTask, Key, LoadInfo, Message, Resource, Solution, TaskId, TaskInfo, Topology,
    EXIT_BROKEN_CONNECTION, EXIT_CRITICAL_STREAM,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

struct Peer {
    #[allow(dead_code)]
    istream: Arc<InputStream>,
    ostream: Arc<OutputStream>,
}

struct AgentEntry {
    /// Advertised capacity; `host` carries the agent's frontier endpoint.
    resource: Resource,
    /// Currently unreserved share of the capacity.
    released: Resource,
    load: Option<LoadInfo>,
    /// Demands of the tasks placed on this agent, for reclamation.
    tasks: HashMap<TaskId, Resource>,
    channel: Peer,
}

struct GraphEntry {
    topology: Topology,
    solution: Solution,
    /// Still-outstanding task placements.
    placement: HashMap<TaskId, Key>,
    channel: Peer,
}

#[derive(Default)]
struct State {
    counter: Key,
    pending: HashMap<Key, Peer>,
    agents: HashMap<Key, AgentEntry>,
    graphs: HashMap<Key, GraphEntry>,
    queue: VecDeque<Key>,
}

/// The cluster-wide coordinator process.
pub struct Master {
    reactor: Arc<Reactor>,
    state: Arc<Mutex<State>>,
    endpoint: String,
}

impl Master {
    /// Bind the listener and install the accept loop. `listen` may use port
    /// zero to let the kernel pick.
    pub fn new(listen: &str) -> Result<Master> {
        let reactor = Reactor::new()?;
        let state: Arc<Mutex<State>> = Arc::new(Mutex::new(State::default()));

        let listener = Socket::listen(listen)?;
        let endpoint = listener.local_endpoint()?.to_string();

        let device = listener.device().clone();
        let state_in_cb = state.clone();
        let reactor_weak = Arc::downgrade(&reactor);
        reactor
            .insert_read(device, move |_, _| {
                let Some(reactor) = reactor_weak.upgrade() else {
                    return Signal::Remove;
                };
                loop {
                    match listener.accept() {
                        Ok(Some(peer)) => {
                            if let Err(err) = insert_peer(&reactor, &state_in_cb, peer) {
                                tracing::warn!(error = %err, "failed to install peer channel");
                            }
                        }
                        Ok(None) => return Signal::Default,
                        Err(err) => {
                            tracing::error!(error = %err, "listener accept failed");
                            return Signal::Default;
                        }
                    }
                }
            })
            .wait()??;

        tracing::info!(%endpoint, "master listening");
        Ok(Master {
            reactor,
            state,
            endpoint,
        })
    }

    /// Address graph clients and agents should dial.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn num_agents(&self) -> usize {
        self.state.lock().agents.len()
    }

    pub fn num_graphs(&self) -> usize {
        self.state.lock().graphs.len()
    }

    /// Drive the coordinator until shutdown.
    pub fn run(&self) -> Result<()> {
        self.reactor.run()?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.reactor.shutdown();
    }
}

/// Install the framed channel for a freshly accepted, not yet classified
/// connection.
fn insert_peer(reactor: &Arc<Reactor>, state: &Arc<Mutex<State>>, peer: Socket) -> Result<()> {
    // The accept handler runs on the reactor thread, so registering here is
    // immediate; a same-cycle readiness for this socket cannot outrun the
    // pending-table insert below.
    let device = peer.into_device();
    let ostream = OutputStream::insert(reactor, device.clone(), None)?;

    let key = {
        let mut state = state.lock();
        let key = state.counter;
        state.counter += 1;
        key
    };

    let state_in_cb = state.clone();
    let istream = InputStream::insert(reactor, device, move |is, event| match event {
        StreamEvent::Ready => {
            while let Ok(Some(message)) = is.recv::<Message>() {
                handle_message(&state_in_cb, key, message);
            }
            Signal::Default
        }
        StreamEvent::Broken(broken) => {
            tracing::debug!(peer = key, %broken, "peer disconnected");
            handle_disconnect(&state_in_cb, key);
            Signal::Remove
        }
    })?;

    state.lock().pending.insert(key, Peer { istream, ostream });
    Ok(())
}

fn handle_message(state: &Arc<Mutex<State>>, key: Key, message: Message) {
    let mut state = state.lock();
    match message {
        Message::Resource(resource) => on_resource(&mut state, key, resource),
        Message::Topology(topology) => on_topology(&mut state, key, topology),
        Message::TaskInfo(info) => on_taskinfo(&mut state, key, info),
        Message::LoadInfo(load) => {
            if let Some(agent) = state.agents.get_mut(&key) {
                agent.load = Some(load);
            }
        }
        other => {
            tracing::debug!(peer = key, message = ?other, "ignoring unexpected message");
        }
    }
}

/// First message of an agent: its capacity advertisement.
fn on_resource(state: &mut State, key: Key, resource: Resource) {
    let Some(channel) = state.pending.remove(&key) else {
        // Re-advertisement of a known agent refreshes its capacity view.
        if let Some(agent) = state.agents.get_mut(&key) {
            agent.released = resource.clone();
            agent.resource = resource;
        }
        try_place_queue(state);
        return;
    };
    tracing::info!(agent = key, %resource, "agent joined");
    state.agents.insert(
        key,
        AgentEntry {
            released: resource.clone(),
            resource,
            load: None,
            tasks: HashMap::new(),
            channel,
        },
    );
    try_place_queue(state);
}

/// First message of a graph client: the topology to place.
fn on_topology(state: &mut State, key: Key, mut topology: Topology) {
    let Some(channel) = state.pending.remove(&key) else {
        tracing::warn!(peer = key, "topology from an already-classified peer");
        return;
    };
    topology.graph = key;
    tracing::info!(graph = key, %topology, "graph submitted");
    state.graphs.insert(
        key,
        GraphEntry {
            topology,
            solution: Solution::new(key),
            placement: HashMap::new(),
            channel,
        },
    );
    state.queue.push_back(key);
    try_place_queue(state);
}

/// FIFO over submission order; the head blocks the queue until it fits.
fn try_place_queue(state: &mut State) {
    while let Some(graph_key) = state.queue.front().copied() {
        if !state.graphs.contains_key(&graph_key) {
            state.queue.pop_front();
            continue;
        }
        if try_place_graph(state, graph_key) {
            state.queue.pop_front();
        } else {
            break;
        }
    }
}

fn try_place_graph(state: &mut State, graph_key: Key) -> bool {
    let Some(topology) = state.graphs.get(&graph_key).map(|g| g.topology.clone()) else {
        return false;
    };

    let mut bins: Vec<Bin> = state
        .agents
        .iter()
        .map(|(key, agent)| Bin {
            key: *key,
            resource: agent.released.clone(),
        })
        .collect();

    let Some(assignment) = best_fit(&topology, &mut bins) else {
        return false;
    };

    // Commit the debited capacities.
    for bin in bins {
        if let Some(agent) = state.agents.get_mut(&bin.key) {
            agent.released = bin.resource;
        }
    }

    // Frontier rendezvous addresses, one per agent.
    let agent_hosts: HashMap<Key, String> = state
        .agents
        .iter()
        .map(|(key, agent)| (*key, agent.resource.host.clone()))
        .collect();

    for (container, agent_key) in &assignment {
        let mut sub = topology.extract(*container);

        let mut hosts: BTreeMap<Key, String> = BTreeMap::new();
        for stream in sub.streams.values() {
            for vertex in [stream.tail, stream.head] {
                if let Some(spec) = topology.vertices.get(&vertex) {
                    let owner = assignment[&spec.container];
                    hosts.insert(vertex, agent_hosts[&owner].clone());
                }
            }
        }
        let rendered = hosts
            .iter()
            .map(|(vertex, host)| format!("{vertex}={host}"))
            .collect::<Vec<_>>()
            .join(" ");
        sub.runtime.set_vertex_hosts(rendered);

        let task_id = sub.task_id();
        let demand = topology
            .containers
            .get(container)
            .map(|c| c.resource.clone())
            .unwrap_or_default();

        if let Some(agent) = state.agents.get_mut(agent_key) {
            agent.tasks.insert(task_id, demand);
            tracing::info!(task = %task_id, agent = agent_key, "task placed");
            if let Err(err) = agent.channel.ostream.send(&Message::Topology(sub)) {
                tracing::warn!(agent = agent_key, error = %err, "failed to ship topology");
            }
        }
        if let Some(graph) = state.graphs.get_mut(&graph_key) {
            graph.placement.insert(task_id, *agent_key);
        }
    }
    true
}

/// A task finished somewhere; fold it into its graph's solution.
fn on_taskinfo(state: &mut State, agent_key: Key, info: TaskInfo) {
    tracing::info!(agent = agent_key, %info, "task report");

    if let Some(agent) = state.agents.get_mut(&agent_key) {
        if let Some(demand) = agent.tasks.remove(&info.task_id) {
            agent.released.give(&demand);
        }
    }

    let graph_key = info.task_id.graph;
    let mut finished = false;
    let mut critical = false;
    if let Some(graph) = state.graphs.get_mut(&graph_key) {
        graph.placement.remove(&info.task_id);
        critical = info.status.code() == Some(EXIT_CRITICAL_STREAM);
        graph.solution.taskinfos.push(info);
        let expected = graph.topology.containers.len();
        finished = graph.solution.taskinfos.len() >= expected;
    }

    if finished || critical {
        conclude_graph(state, graph_key);
    }
    try_place_queue(state);
}

/// Ship the (possibly partial) solution to the client, kill whatever is
/// still running, and deregister the graph.
fn conclude_graph(state: &mut State, graph_key: Key) {
    let Some(graph) = state.graphs.remove(&graph_key) else {
        return;
    };
    state.queue.retain(|k| *k != graph_key);

    for (task_id, agent_key) in &graph.placement {
        if let Some(agent) = state.agents.get_mut(agent_key) {
            let _ = agent
                .channel
                .ostream
                .send(&Message::KillTask(KillTask { task_id: *task_id }));
        }
    }

    tracing::info!(graph = graph_key, errors = graph.solution.num_errors(), "graph concluded");
    if let Err(err) = graph
        .channel
        .ostream
        .send(&Message::Solution(graph.solution.clone()))
    {
        tracing::warn!(graph = graph_key, error = %err, "failed to deliver solution");
    }
    graph.channel.ostream.remove_on_flush();
}

fn handle_disconnect(state: &Arc<Mutex<State>>, key: Key) {
    let mut state = state.lock();

    if let Some(peer) = state.pending.remove(&key) {
        peer.ostream.deregister();
        return;
    }

    // A graph client going away drops its queued or running graph.
    if let Some(graph) = state.graphs.remove(&key) {
        tracing::info!(graph = key, "client disconnected, dropping graph");
        graph.channel.ostream.deregister();
        state.queue.retain(|k| *k != key);
        for (task_id, agent_key) in &graph.placement {
            if let Some(agent) = state.agents.get_mut(agent_key) {
                let _ = agent
                    .channel
                    .ostream
                    .send(&Message::KillTask(KillTask { task_id: *task_id }));
            }
        }
        try_place_queue(&mut state);
        return;
    }

    // An agent going away fails every task mapped to it.
    if let Some(agent) = state.agents.remove(&key) {
        tracing::warn!(agent = key, "agent disconnected");
        agent.channel.ostream.deregister();
        let mut affected = Vec::new();
        for (task_id, _) in agent.tasks {
            if let Some(graph) = state.graphs.get_mut(&task_id.graph) {
                graph.placement.remove(&task_id);
                graph.solution.taskinfos.push(TaskInfo::new(
                    task_id,
                    agent.resource.host.clone(),
                    flowgraph_protocol::ExitStatus::Exited(EXIT_BROKEN_CONNECTION),
                ));
                affected.push(task_id.graph);
            }
        }
        for graph_key in affected {
            conclude_graph(&mut state, graph_key);
        }
        try_place_queue(&mut state);
    }
}
