//! Whole-graph scenarios run through a local-mode executor.

use flowgraph_core::executor::Executor;
use flowgraph_core::graph::Graph;
use flowgraph_core::reactor::Signal;
use flowgraph_core::ExecutionMode;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

fn run_local(graph: Graph) -> i32 {
    Executor::with_mode(graph, ExecutionMode::Local)
        .unwrap()
        .run()
        .unwrap()
}

#[test]
fn hello_loop_exchanges_one_record_each_way() {
    let g = Graph::new();
    let a = g.vertex();
    let b = g.vertex();
    let ab = g.stream(&a, &b);
    let ba = g.stream(&b, &a);
    let (ab_key, ba_key) = (ab.key(), ba.key());

    let at_b = Arc::new(Mutex::new(Vec::new()));
    let at_a = Arc::new(Mutex::new(Vec::new()));

    let at_b_in_cb = at_b.clone();
    ab.on_istream(move |_b, is| {
        if let Ok(Some(text)) = is.recv::<String>() {
            at_b_in_cb.lock().push(text);
            return Signal::Remove;
        }
        Signal::Default
    });
    let at_a_in_cb = at_a.clone();
    ba.on_istream(move |_a, is| {
        if let Ok(Some(text)) = is.recv::<String>() {
            at_a_in_cb.lock().push(text);
            return Signal::Remove;
        }
        Signal::Default
    });

    a.on_enter(move |v| {
        v.send(ab_key, &"hello world from A".to_string()).unwrap();
    });
    b.on_enter(move |v| {
        v.send(ba_key, &"hello world from B".to_string()).unwrap();
    });

    assert_eq!(run_local(g), 0);
    assert_eq!(*at_b.lock(), vec!["hello world from A".to_string()]);
    assert_eq!(*at_a.lock(), vec!["hello world from B".to_string()]);
}

#[test]
fn pi_reduction_converges() {
    const NUM_SLAVES: usize = 3;
    const NUM_SAMPLES: i64 = 9_000_000;

    let g = Graph::new();
    let master = g.vertex();
    let mut m2s = Vec::new();
    let mut s2m = Vec::new();
    for _ in 0..NUM_SLAVES {
        let slave = g.vertex();
        m2s.push(g.stream(&master, &slave));
        s2m.push(g.stream(&slave, &master));
    }

    // Master scatters the per-slave sample count.
    let scatter: Vec<_> = m2s.iter().map(|s| s.key()).collect();
    master.on_enter(move |v| {
        v.set_state((0i64, 0usize));
        v.broadcast_to(&scatter, &(NUM_SAMPLES / NUM_SLAVES as i64))
            .unwrap();
    });

    // Each slave runs one Monte-Carlo pass and replies its hit count.
    for i in 0..NUM_SLAVES {
        let reply = s2m[i].key();
        m2s[i].on_istream(move |slave, is| {
            if let Ok(Some(samples)) = is.recv::<i64>() {
                let mut rng = rand::thread_rng();
                let mut hits = 0i64;
                for _ in 0..samples {
                    let x: f64 = rng.gen_range(-1.0..1.0);
                    let y: f64 = rng.gen_range(-1.0..1.0);
                    if x * x + y * y <= 1.0 {
                        hits += 1;
                    }
                }
                slave.send(reply, &hits).unwrap();
                return Signal::Close;
            }
            Signal::Default
        });
    }

    // Master reduces the three replies.
    let estimate = Arc::new(Mutex::new(None::<f64>));
    for stream in &s2m {
        let estimate_in_cb = estimate.clone();
        stream.on_istream(move |master, is| {
            if let Ok(Some(hits)) = is.recv::<i64>() {
                let (sum, count) = master.state_mut::<(i64, usize)>().unwrap();
                *sum += hits;
                *count += 1;
                if *count == NUM_SLAVES {
                    *estimate_in_cb.lock() = Some(4.0 * *sum as f64 / NUM_SAMPLES as f64);
                }
                return Signal::Close;
            }
            Signal::Default
        });
    }

    assert_eq!(run_local(g), 0);
    let pi = estimate.lock().expect("master never reduced");
    assert!((3.13..=3.16).contains(&pi), "pi estimate {pi} out of range");
}

fn is_prime(n: i64) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

#[test]
fn prime_reduction_counts_all_primes() {
    const NUM_SLAVES: i64 = 3;
    const RANGE: i64 = 1_000_000;
    const EXPECTED: i64 = 78_498;

    let g = Graph::new();
    let master = g.vertex();
    let mut m2s = Vec::new();
    let mut s2m = Vec::new();
    for _ in 0..NUM_SLAVES {
        let slave = g.vertex();
        m2s.push(g.stream(&master, &slave));
        s2m.push(g.stream(&slave, &master));
    }

    let scatter: Vec<_> = m2s.iter().map(|s| s.key()).collect();
    master.on_enter(move |v| {
        v.set_state((0i64, 0i64));
        v.broadcast_to(&scatter, &RANGE).unwrap();
    });

    // Slave i takes the strided slice n ≡ i (mod NUM_SLAVES).
    for i in 0..NUM_SLAVES {
        let reply = s2m[i as usize].key();
        m2s[i as usize].on_istream(move |slave, is| {
            if let Ok(Some(range)) = is.recv::<i64>() {
                let mut count = 0i64;
                let mut n = i;
                while n <= range {
                    if is_prime(n) {
                        count += 1;
                    }
                    n += NUM_SLAVES;
                }
                slave.send(reply, &count).unwrap();
                return Signal::Close;
            }
            Signal::Default
        });
    }

    let total = Arc::new(Mutex::new(None::<i64>));
    for stream in &s2m {
        let total_in_cb = total.clone();
        stream.on_istream(move |master, is| {
            if let Ok(Some(count)) = is.recv::<i64>() {
                let (sum, seen) = master.state_mut::<(i64, i64)>().unwrap();
                *sum += count;
                *seen += 1;
                if *seen == NUM_SLAVES {
                    *total_in_cb.lock() = Some(*sum);
                }
                return Signal::Close;
            }
            Signal::Default
        });
    }

    assert_eq!(run_local(g), 0);
    assert_eq!(total.lock().unwrap(), EXPECTED);
}

#[test]
fn prober_streams_until_remove_marker() {
    let words = ["hello", "from", "the", "server", "remove"];

    let g = Graph::new();
    let a = g.vertex();
    let b = g.vertex();
    let s = g.stream(&a, &b);
    let s_key = s.key();

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_in_cb = received.clone();
    s.on_istream(move |_b, is| {
        while let Ok(Some(word)) = is.recv::<String>() {
            if word == "remove" {
                return Signal::Remove;
            }
            received_in_cb.lock().push(word);
        }
        Signal::Default
    });

    a.on_enter(move |v| {
        v.set_state(words.map(String::from).to_vec());
    });

    let mut next = 0usize;
    g.prober(&a).duration(Duration::from_millis(50)).on(move |v| {
        let data = v.state::<Vec<String>>().unwrap();
        if next < data.len() {
            let word = data[next].clone();
            next += 1;
            v.send(s_key, &word).unwrap();
            Signal::Default
        } else {
            Signal::Remove
        }
    });

    assert_eq!(run_local(g), 0);
    assert_eq!(
        *received.lock(),
        vec![
            "hello".to_string(),
            "from".to_string(),
            "the".to_string(),
            "server".to_string()
        ]
    );
}

#[test]
fn executor_with_no_vertices_exits_zero() {
    assert_eq!(run_local(Graph::new()), 0);
}
