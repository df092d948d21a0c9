//! Two-vertex hello exchange.
//!
//! Runs the whole graph in-process by default; set
//! `FLOWGRAPH_EXECUTION_MODE=SUBMIT` (plus `FLOWGRAPH_MASTER_ENDPOINT`) to
//! ship it to a cluster, where each vertex lands in its own container and
//! the two streams cross container boundaries.

use flowgraph_core::executor::Executor;
use flowgraph_core::graph::Graph;
use flowgraph_core::reactor::Signal;

fn main() -> anyhow::Result<()> {
    let g = Graph::new();
    let a = g.vertex();
    let b = g.vertex();
    let ab = g.stream(&a, &b);
    let ba = g.stream(&b, &a);
    let (ab_key, ba_key) = (ab.key(), ba.key());

    ab.on_istream(|_b, is| {
        if let Ok(Some(text)) = is.recv::<String>() {
            println!("B received: {text}");
            return Signal::Remove;
        }
        Signal::Default
    });
    ba.on_istream(|_a, is| {
        if let Ok(Some(text)) = is.recv::<String>() {
            println!("A received: {text}");
            return Signal::Remove;
        }
        Signal::Default
    });

    a.on_enter(move |v| {
        let _ = v.send(ab_key, &"hello world from A".to_string());
    });
    b.on_enter(move |v| {
        let _ = v.send(ba_key, &"hello world from B".to_string());
    });

    g.container().add(&a).num_cpus(1).memory_limit(64 << 20);
    g.container().add(&b).num_cpus(1).memory_limit(64 << 20);

    let code = Executor::new(g)?.run()?;
    std::process::exit(code);
}
