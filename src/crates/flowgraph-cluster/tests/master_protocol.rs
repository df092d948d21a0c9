//! Drives a live master through the wire protocol, playing both the agent
//! and the graph-client roles over plain blocking sockets.

use flowgraph_cluster::Master;
use flowgraph_core::Reactor;
use flowgraph_protocol::codec::{decode_frame, encode_frame, FRAME_HEADER_LEN};
use flowgraph_protocol::{
    ContainerSpec, ExitStatus, Message, Resource, StreamSpec, TaskInfo, Topology, VertexSpec,
    EXIT_BROKEN_CONNECTION, NONE_KEY,
};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

fn write_frame(stream: &mut TcpStream, message: &Message) {
    let frame = encode_frame(message).unwrap();
    stream.write_all(&frame).unwrap();
}

fn read_frame(stream: &mut TcpStream) -> Message {
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut header).unwrap();
    let body = u32::from_le_bytes(header) as usize;
    let mut bytes = vec![0u8; FRAME_HEADER_LEN + body];
    bytes[..FRAME_HEADER_LEN].copy_from_slice(&header);
    stream.read_exact(&mut bytes[FRAME_HEADER_LEN..]).unwrap();
    let (message, _) = decode_frame(&bytes).unwrap().unwrap();
    message
}

fn start_master() -> (String, Arc<Reactor>, std::thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = std::thread::spawn(move || {
        let master = Master::new("127.0.0.1:0").unwrap();
        tx.send((master.endpoint().to_string(), master.reactor().clone()))
            .unwrap();
        master.run().unwrap();
    });
    let (endpoint, reactor) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    (endpoint, reactor, handle)
}

fn connect(endpoint: &str) -> TcpStream {
    let stream = TcpStream::connect(endpoint).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

fn two_container_topology() -> Topology {
    let mut topology = Topology::new(NONE_KEY, NONE_KEY);
    topology.vertices.insert(0, VertexSpec { key: 0, container: 10 });
    topology.vertices.insert(1, VertexSpec { key: 1, container: 11 });
    topology.streams.insert(2, StreamSpec { key: 2, tail: 0, head: 1 });
    for key in [10, 11] {
        topology.containers.insert(
            key,
            ContainerSpec {
                key,
                resource: Resource::new(1, 1 << 10, 0),
                configs: HashMap::new(),
            },
        );
    }
    topology
}

#[test]
fn placement_round_trip_yields_solution() {
    let (endpoint, reactor, handle) = start_master();

    // Agent joins with room for both containers.
    let mut agent = connect(&endpoint);
    let mut capacity = Resource::new(4, 1 << 30, 0);
    capacity.host = "127.0.0.1:7001".to_string();
    write_frame(&mut agent, &Message::Resource(capacity));

    // Client submits a two-container graph.
    let mut client = connect(&endpoint);
    write_frame(&mut client, &Message::Topology(two_container_topology()));

    // The agent receives one sub-topology per container and reports success.
    for _ in 0..2 {
        let message = read_frame(&mut agent);
        let Message::Topology(sub) = message else {
            panic!("expected a topology, got {message:?}");
        };
        assert_eq!(sub.vertices.len(), 1);
        assert_eq!(sub.containers.len(), 1);
        assert!(sub.is_inter_stream(2));

        // Both endpoints of the cut stream must be resolvable to a host.
        let hosts = sub.runtime.vertex_hosts();
        assert_eq!(hosts.get(&0).map(String::as_str), Some("127.0.0.1:7001"));
        assert_eq!(hosts.get(&1).map(String::as_str), Some("127.0.0.1:7001"));

        write_frame(
            &mut agent,
            &Message::TaskInfo(TaskInfo::new(
                sub.task_id(),
                "127.0.0.1:7001",
                ExitStatus::Exited(0),
            )),
        );
    }

    // The client gets the aggregated solution.
    let Message::Solution(solution) = read_frame(&mut client) else {
        panic!("expected a solution");
    };
    assert_eq!(solution.taskinfos.len(), 2);
    assert_eq!(solution.num_errors(), 0);
    assert_eq!(solution.worst_exit_code(), 0);

    reactor.shutdown();
    handle.join().unwrap();
}

#[test]
fn agent_disconnect_fails_its_tasks() {
    let (endpoint, reactor, handle) = start_master();

    let mut agent = connect(&endpoint);
    let mut capacity = Resource::new(4, 1 << 30, 0);
    capacity.host = "127.0.0.1:7002".to_string();
    write_frame(&mut agent, &Message::Resource(capacity));

    // One-container graph.
    let mut topology = Topology::new(NONE_KEY, NONE_KEY);
    topology.vertices.insert(0, VertexSpec { key: 0, container: 5 });
    topology.containers.insert(
        5,
        ContainerSpec {
            key: 5,
            resource: Resource::new(1, 1 << 10, 0),
            configs: HashMap::new(),
        },
    );
    let mut client = connect(&endpoint);
    write_frame(&mut client, &Message::Topology(topology));

    // The agent takes the placement, then dies without reporting.
    let Message::Topology(_sub) = read_frame(&mut agent) else {
        panic!("expected a topology");
    };
    drop(agent);

    // The client still gets a (partial) solution naming the failure.
    let Message::Solution(solution) = read_frame(&mut client) else {
        panic!("expected a solution");
    };
    assert_eq!(solution.taskinfos.len(), 1);
    assert_eq!(solution.num_errors(), 1);
    assert_eq!(
        solution.taskinfos[0].status,
        ExitStatus::Exited(EXIT_BROKEN_CONNECTION)
    );

    reactor.shutdown();
    handle.join().unwrap();
}

#[test]
fn client_disconnect_kills_placed_tasks() {
    let (endpoint, reactor, handle) = start_master();

    let mut agent = connect(&endpoint);
    let mut capacity = Resource::new(4, 1 << 30, 0);
    capacity.host = "127.0.0.1:7003".to_string();
    write_frame(&mut agent, &Message::Resource(capacity));

    let mut topology = Topology::new(NONE_KEY, NONE_KEY);
    topology.vertices.insert(0, VertexSpec { key: 0, container: 7 });
    topology.containers.insert(
        7,
        ContainerSpec {
            key: 7,
            resource: Resource::new(1, 1 << 10, 0),
            configs: HashMap::new(),
        },
    );
    let client = connect(&endpoint);
    {
        let mut client = client;
        write_frame(&mut client, &Message::Topology(topology));
        let Message::Topology(_sub) = read_frame(&mut agent) else {
            panic!("expected a topology");
        };
        // Client vanishes with its task still running.
    }

    let Message::KillTask(kill) = read_frame(&mut agent) else {
        panic!("expected a kill order");
    };
    assert_eq!(kill.task_id.topology, 7);

    reactor.shutdown();
    handle.join().unwrap();
}

#[test]
fn graph_without_capacity_stays_queued() {
    let (endpoint, reactor, handle) = start_master();

    let mut topology = Topology::new(NONE_KEY, NONE_KEY);
    topology.vertices.insert(0, VertexSpec { key: 0, container: 3 });
    topology.containers.insert(
        3,
        ContainerSpec {
            key: 3,
            resource: Resource::new(64, 1 << 40, 0),
            configs: HashMap::new(),
        },
    );
    let mut client = connect(&endpoint);
    write_frame(&mut client, &Message::Topology(topology));

    // No agent can host that demand; no solution may arrive.
    client
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut byte = [0u8; 1];
    let outcome = client.read(&mut byte);
    assert!(
        matches!(outcome, Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock
            || err.kind() == std::io::ErrorKind::TimedOut),
        "unexpected read outcome: {outcome:?}"
    );

    reactor.shutdown();
    handle.join().unwrap();
}
