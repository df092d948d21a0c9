//! Full-stack cluster run: an in-process master and agent, plus the hello
//! binary submitted as a graph client. The agent forks one executor per
//! container; the two hello streams rendezvous through frontier sockets.

use flowgraph_cluster::{Agent, AgentConfig, Master};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

#[test]
fn hello_world_runs_distributed() {
    let (master_tx, master_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let master = Master::new("127.0.0.1:0").expect("master start");
        master_tx
            .send((master.endpoint().to_string(), master.reactor().clone()))
            .unwrap();
        let _ = master.run();
    });
    let (endpoint, master_reactor) = master_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    let (agent_tx, agent_rx) = mpsc::channel();
    let master_endpoint = endpoint.clone();
    std::thread::spawn(move || {
        let config = AgentConfig {
            master_endpoint,
            ..AgentConfig::default()
        };
        let agent = Agent::new(config).expect("agent start");
        agent_tx.send(agent.reactor().clone()).unwrap();
        // The master link breaks when the test shuts the master down.
        let _ = agent.run();
    });
    let agent_reactor = agent_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    let mut client = Command::new(env!("CARGO_BIN_EXE_flowgraph-hello"))
        .env("FLOWGRAPH_EXECUTION_MODE", "SUBMIT")
        .env("FLOWGRAPH_MASTER_ENDPOINT", &endpoint)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn hello client");

    // Watchdog: a wedged cluster must fail the test, not hang the harness.
    let deadline = Instant::now() + Duration::from_secs(90);
    let status = loop {
        match client.try_wait().expect("poll hello client") {
            Some(status) => break status,
            None if Instant::now() > deadline => {
                let _ = client.kill();
                let _ = client.wait();
                panic!("distributed hello did not finish in time");
            }
            None => std::thread::sleep(Duration::from_millis(100)),
        }
    };
    assert!(status.success(), "hello client exited with {status}");

    agent_reactor.shutdown();
    master_reactor.shutdown();
}
